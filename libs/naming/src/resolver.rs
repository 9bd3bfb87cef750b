//! Endpoint resolution with round-robin selection

use dashmap::DashMap;
use std::sync::Arc;

use crate::directory::{DirectoryError, DirectoryLookup};
use crate::endpoint::Endpoint;

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("no endpoints registered for '{0}'")]
    NoEndpoints(String),

    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

/// Resolves a service name to one of its registered endpoints.
///
/// Every call reads the directory, so instances that register or drop out
/// are picked up immediately.
pub struct EndpointResolver {
    lookup: Arc<dyn DirectoryLookup>,
    rr_counters: DashMap<String, usize>,
}

impl std::fmt::Debug for EndpointResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointResolver")
            .field("services", &self.rr_counters.len())
            .finish_non_exhaustive()
    }
}

impl EndpointResolver {
    #[must_use]
    pub fn new(lookup: Arc<dyn DirectoryLookup>) -> Self {
        Self {
            lookup,
            rr_counters: DashMap::new(),
        }
    }

    /// All live endpoints of `service`, ordered by address.
    ///
    /// Entries whose value cannot be decoded are skipped.
    ///
    /// # Errors
    /// Returns an error if the directory lookup fails.
    pub async fn endpoints(&self, service: &str) -> Result<Vec<Endpoint>, ResolveError> {
        let prefix = format!("{service}/");
        let entries = self.lookup.list(&prefix).await?;

        Ok(entries
            .into_iter()
            .filter_map(|kv| match Endpoint::decode_value(service, &kv.value) {
                Ok(ep) => Some(ep),
                Err(e) => {
                    tracing::warn!(key = %kv.key, error = %e, "Skipping malformed endpoint entry");
                    None
                }
            })
            .collect())
    }

    /// Pick the next endpoint of `service` in round-robin order.
    ///
    /// # Errors
    /// [`ResolveError::NoEndpoints`] if nothing is registered, or the
    /// directory error.
    pub async fn resolve(&self, service: &str) -> Result<Endpoint, ResolveError> {
        let mut endpoints = self.endpoints(service).await?;
        if endpoints.is_empty() {
            return Err(ResolveError::NoEndpoints(service.to_owned()));
        }

        let len = endpoints.len();
        let idx = {
            let mut counter = self.rr_counters.entry(service.to_owned()).or_insert(0);
            let idx = *counter % len;
            *counter = (*counter + 1) % len;
            idx
        };
        Ok(endpoints.swap_remove(idx))
    }
}
