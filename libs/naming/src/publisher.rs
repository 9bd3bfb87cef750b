//! Endpoint Publisher - writes the registration key under a lease

use std::sync::Arc;

use crate::directory::{DirectoryClient, DirectoryError};
use crate::endpoint::Endpoint;
use crate::error::RegistrarError;
use crate::lease::Lease;

/// Writes endpoint entries into the directory. Never retries.
pub struct EndpointPublisher<D: ?Sized> {
    directory: Arc<D>,
}

impl<D: ?Sized> Clone for EndpointPublisher<D> {
    fn clone(&self) -> Self {
        Self {
            directory: Arc::clone(&self.directory),
        }
    }
}

impl<D> EndpointPublisher<D>
where
    D: DirectoryClient + ?Sized,
{
    #[must_use]
    pub fn new(directory: Arc<D>) -> Self {
        Self { directory }
    }

    /// Store `endpoint` under its registration key, bound to `lease` so the
    /// directory drops the key when the lease goes away.
    ///
    /// # Errors
    /// [`RegistrarError::PublishFailed`] on encode or directory failure.
    pub async fn publish(&self, endpoint: &Endpoint, lease: &Lease) -> Result<(), RegistrarError> {
        let key = endpoint.key();
        let publish_failed = |source: DirectoryError| RegistrarError::PublishFailed {
            key: key.clone(),
            lease: lease.id,
            source,
        };

        let value = endpoint
            .encode_value()
            .map_err(|e| publish_failed(DirectoryError::Encode(e)))?;
        self.directory
            .register_key(&key, &value, lease.id)
            .await
            .map_err(publish_failed)?;

        tracing::debug!(key = %key, lease_id = %lease.id, "Endpoint published");
        Ok(())
    }
}
