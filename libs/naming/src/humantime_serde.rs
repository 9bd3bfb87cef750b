//! Serde mapping for `Duration` config fields written as `"5s"`, `"200ms"`.
//!
//! ```
//! use serde::Deserialize;
//! use std::time::Duration;
//!
//! #[derive(Deserialize)]
//! struct Foo {
//!     #[serde(with = "naming::humantime_serde")]
//!     timeout: Duration,
//! }
//! ```

use serde::{Deserialize, Deserializer, Serializer, de};
use std::time::Duration;

/// # Errors
/// Returns an error if the string is not a humantime duration.
pub fn deserialize<'de, D>(d: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(d)?;
    humantime::parse_duration(&raw).map_err(de::Error::custom)
}

/// # Errors
/// Propagates serializer errors.
pub fn serialize<S>(d: &Duration, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    s.collect_str(&humantime::format_duration(*d))
}
