//! Directory backend selection.

use anyhow::Result;
use naming::{DirectoryClient, DirectoryLookup, MemoryDirectory};
use std::sync::Arc;

use crate::config::{DirectoryConfig, DirectoryKind};

/// Both halves of a directory backend: registration and lookup.
#[derive(Clone)]
pub struct Directory {
    pub client: Arc<dyn DirectoryClient>,
    pub lookup: Arc<dyn DirectoryLookup>,
}

impl std::fmt::Debug for Directory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Directory").finish_non_exhaustive()
    }
}

impl Directory {
    #[must_use]
    pub fn memory(directory: MemoryDirectory) -> Self {
        Self {
            client: Arc::new(directory.clone()),
            lookup: Arc::new(directory),
        }
    }

    /// Open the backend named by `cfg.kind`.
    ///
    /// # Errors
    /// Returns an error if the backend cannot be reached, or if `etcd` is
    /// requested from a binary built without the `etcd` feature.
    pub async fn connect(cfg: &DirectoryConfig) -> Result<Self> {
        match cfg.kind {
            DirectoryKind::Memory => {
                tracing::warn!("Using the in-process directory; other processes cannot see it");
                Ok(Self::memory(MemoryDirectory::new()))
            }
            DirectoryKind::Etcd => Self::etcd(cfg).await,
        }
    }

    #[cfg(feature = "etcd")]
    async fn etcd(cfg: &DirectoryConfig) -> Result<Self> {
        use anyhow::Context as _;

        let etcd = naming::EtcdDirectory::connect(&cfg.endpoints, cfg.dial_timeout)
            .await
            .with_context(|| format!("failed to connect to etcd at {:?}", cfg.endpoints))?;
        let etcd = Arc::new(etcd);
        Ok(Self {
            client: Arc::clone(&etcd) as Arc<dyn DirectoryClient>,
            lookup: etcd,
        })
    }

    #[cfg(not(feature = "etcd"))]
    #[allow(clippy::unused_async)]
    async fn etcd(cfg: &DirectoryConfig) -> Result<Self> {
        anyhow::bail!(
            "directory kind 'etcd' ({:?}) needs a binary built with the `etcd` feature",
            cfg.endpoints
        )
    }
}
