//! Lease Manager - lease grant, renewal stream and revoke

use std::sync::Arc;
use std::time::Duration;

use crate::directory::{DirectoryClient, KeepAliveStream, LeaseId};
use crate::error::RegistrarError;

/// A lease granted by the directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Lease {
    pub id: LeaseId,
    pub ttl: Duration,
}

/// Grants leases of a fixed TTL and opens their keepalive streams.
pub struct LeaseManager<D: ?Sized> {
    directory: Arc<D>,
    ttl: Duration,
}

impl<D: ?Sized> Clone for LeaseManager<D> {
    fn clone(&self) -> Self {
        Self {
            directory: Arc::clone(&self.directory),
            ttl: self.ttl,
        }
    }
}

impl<D> LeaseManager<D>
where
    D: DirectoryClient + ?Sized,
{
    #[must_use]
    pub fn new(directory: Arc<D>, ttl: Duration) -> Self {
        Self { directory, ttl }
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Request a fresh lease.
    ///
    /// # Errors
    /// [`RegistrarError::DirectoryUnavailable`] when the directory cannot be
    /// reached, [`RegistrarError::GrantFailed`] when it refuses.
    pub async fn grant(&self) -> Result<Lease, RegistrarError> {
        let id = self
            .directory
            .grant_lease(self.ttl)
            .await
            .map_err(RegistrarError::from_grant)?;
        tracing::debug!(lease_id = %id, ttl = ?self.ttl, "Lease granted");
        Ok(Lease { id, ttl: self.ttl })
    }

    /// Open the renewal stream for `lease`.
    ///
    /// # Errors
    /// [`RegistrarError::KeepAliveLost`] if the directory will not renew it.
    pub async fn keep_alive(&self, lease: &Lease) -> Result<KeepAliveStream, RegistrarError> {
        self.directory
            .keep_alive(lease.id)
            .await
            .map_err(|source| RegistrarError::KeepAliveLost {
                lease: lease.id,
                source,
            })
    }

    /// Revoke a lease by id.
    ///
    /// # Errors
    /// [`RegistrarError::RevokeFailed`] on any directory failure.
    pub async fn revoke(&self, lease: LeaseId) -> Result<(), RegistrarError> {
        self.directory
            .revoke(lease)
            .await
            .map_err(|source| RegistrarError::RevokeFailed { lease, source })
    }
}
