#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! Greeter demo built on the `naming` registrar.
//!
//! - `serve`: a greeter instance that registers itself in the directory for
//!   as long as it runs.
//! - `gateway`: an HTTP front that resolves greeter instances through the
//!   directory and forwards requests to them round-robin.
//! - `standalone`: both in one process over an in-process directory.

pub mod config;
pub mod directory;
pub mod gateway;
pub mod logging;
pub mod server;
pub mod signals;
