//! Directory contract - the lease and key primitives the registrar consumes
//!
//! A directory is an external coordination service (etcd, or the in-process
//! [`crate::memory::MemoryDirectory`]) that grants time-bound leases, renews
//! them on request and stores keys whose lifetime is tied to a lease.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::fmt;
use std::time::Duration;

/// Opaque lease identifier issued by the directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LeaseId(pub i64);

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// One successful renewal of a lease.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenewalEvent {
    /// Remaining time-to-live reported by the directory, in seconds.
    pub ttl: i64,
}

/// Renewal notifications for a single lease.
///
/// Yields one [`RenewalEvent`] per successful renewal and ends when the lease
/// can no longer be renewed (expired, revoked or connection lost).
pub type KeepAliveStream = BoxStream<'static, RenewalEvent>;

/// A live key/value entry returned by [`DirectoryLookup::list`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    pub lease: Option<LeaseId>,
}

/// Errors reported by directory backends
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DirectoryError {
    /// The directory could not be reached
    #[error("directory unavailable: {0}")]
    Unavailable(String),

    /// The directory was reached but refused the request
    #[error("directory rejected request: {0}")]
    Rejected(String),

    /// The lease does not exist (never granted, expired or revoked)
    #[error("lease {0} not found")]
    LeaseNotFound(LeaseId),

    /// A value could not be encoded for storage
    #[error("failed to encode directory value: {0}")]
    Encode(#[from] serde_json::Error),
}

impl DirectoryError {
    /// Whether the failure is a connectivity problem rather than a refusal.
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Lease and registration primitives of a directory service.
///
/// Implementations must be safe for concurrent use; one client is shared by
/// every registrar in the process.
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    /// Grant a new lease with the given time-to-live.
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, DirectoryError>;

    /// Revoke a lease; keys attached to it are removed by the directory.
    async fn revoke(&self, lease: LeaseId) -> Result<(), DirectoryError>;

    /// Open a renewal stream for a lease.
    ///
    /// The client renews the lease periodically until the stream is dropped
    /// or renewal fails.
    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream, DirectoryError>;

    /// Store `value` under `key`, bound to `lease`.
    async fn register_key(
        &self,
        key: &str,
        value: &str,
        lease: LeaseId,
    ) -> Result<(), DirectoryError>;
}

/// Read side of a directory, used for endpoint resolution.
#[async_trait]
pub trait DirectoryLookup: Send + Sync {
    /// List live entries whose key starts with `prefix`, ordered by key.
    async fn list(&self, prefix: &str) -> Result<Vec<KeyValue>, DirectoryError>;
}

/// Whole seconds to request from a directory for `ttl`, rounded up, at least 1.
#[must_use]
pub fn ttl_seconds(ttl: Duration) -> i64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    i64::try_from(secs.max(1)).unwrap_or(i64::MAX)
}
