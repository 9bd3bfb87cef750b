#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! Naming - lease-bound service registration
//!
//! This crate keeps a service endpoint advertised in a directory
//! (etcd, or the in-process [`MemoryDirectory`]) for as long as the process
//! serves it:
//!
//! - [`Registrar`] grants a lease, publishes `<service>/<address>` under it,
//!   keeps the lease alive and re-registers when the lease is lost.
//! - [`EndpointResolver`] reads the same entries back and picks an instance
//!   round-robin.
//!
//! ```no_run
//! use naming::{Endpoint, MemoryDirectory, Registrar, RegistrarConfig};
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), naming::RegistrarError> {
//! let directory = Arc::new(MemoryDirectory::new());
//! let mut registrar = Registrar::new(
//!     directory,
//!     Endpoint::new("app", "127.0.0.1:9000"),
//!     RegistrarConfig::default(),
//! );
//! registrar.register().await?;
//! // ... serve traffic ...
//! registrar.unregister().await?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod config;
pub mod directory;
pub mod endpoint;
mod error;
pub mod humantime_serde;
pub mod lease;
pub mod memory;
pub mod publisher;
pub mod registrar;
pub mod resolver;

#[cfg(feature = "etcd")]
pub mod etcd;

pub use config::{RecoveryConfig, RegistrarConfig};
pub use directory::{
    DirectoryClient, DirectoryError, DirectoryLookup, KeepAliveStream, KeyValue, LeaseId,
    RenewalEvent,
};
pub use endpoint::Endpoint;
pub use error::RegistrarError;
pub use lease::{Lease, LeaseManager};
pub use memory::MemoryDirectory;
pub use publisher::EndpointPublisher;
pub use registrar::{Registrar, RegistrarState};
pub use resolver::{EndpointResolver, ResolveError};

#[cfg(feature = "etcd")]
pub use etcd::EtcdDirectory;
