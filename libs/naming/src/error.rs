use crate::directory::{DirectoryError, LeaseId};

/// Registrar error types
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RegistrarError {
    /// The directory could not be reached while granting a lease
    #[error("directory unavailable: {0}")]
    DirectoryUnavailable(#[source] DirectoryError),

    /// The directory refused to grant a lease
    #[error("lease grant failed: {0}")]
    GrantFailed(#[source] DirectoryError),

    /// The registration key could not be written
    #[error("failed to publish '{key}' under lease {lease}: {source}")]
    PublishFailed {
        key: String,
        lease: LeaseId,
        #[source]
        source: DirectoryError,
    },

    /// The keepalive stream for a lease could not be opened
    #[error("keepalive lost for lease {lease}: {source}")]
    KeepAliveLost {
        lease: LeaseId,
        #[source]
        source: DirectoryError,
    },

    /// Revoking the lease failed; local resources were released anyway
    #[error("failed to revoke lease {lease}: {source}")]
    RevokeFailed {
        lease: LeaseId,
        #[source]
        source: DirectoryError,
    },

    /// `register` was called while the watch loop is still running
    #[error("endpoint '{0}' is already registered")]
    AlreadyRegistered(String),

    /// The registrar was unregistered and cannot be used again
    #[error("registrar for '{0}' has been unregistered")]
    Terminated(String),
}

impl RegistrarError {
    pub(crate) fn from_grant(err: DirectoryError) -> Self {
        if err.is_unavailable() {
            Self::DirectoryUnavailable(err)
        } else {
            Self::GrantFailed(err)
        }
    }
}
