//! Error taxonomy for the sync engine.

use std::path::PathBuf;

/// A sync pair could not be turned into a runnable configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("[{pair}] missing required field `{field}`")]
    Missing { pair: String, field: &'static str },

    #[error("[{pair}] invalid value for `{field}`: {reason}")]
    Invalid {
        pair: String,
        field: &'static str,
        reason: String,
    },

    #[error("[{pair}] invalid exclude pattern `{pattern}`: {source}")]
    Pattern {
        pair: String,
        pattern: String,
        #[source]
        source: globset::Error,
    },

    #[error("[{pair}] local root {} is not a directory", path.display())]
    LocalRoot { pair: String, path: PathBuf },
}

/// The local notification source failed.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("failed to watch {}: {source}", root.display())]
    Open {
        root: PathBuf,
        #[source]
        source: notify::Error,
    },

    #[error("notification source error: {0}")]
    Source(#[from] notify::Error),
}

/// Errors reported by a [`RemoteClient`](crate::RemoteClient) implementation.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("remote operation timed out")]
    Timeout,

    #[error("remote path not found: {0}")]
    NotFound(String),

    #[error("operation not supported by transport: {0}")]
    Unsupported(String),

    #[error("remote operation failed: {0}")]
    Operation(String),

    #[error("local I/O error: {0}")]
    LocalIo(#[from] std::io::Error),
}

impl RemoteError {
    /// Whether the error means the session itself is unusable.
    ///
    /// Connection-class errors move a worker into the degraded state; the
    /// rest are failures of a single operation on a healthy session.
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            RemoteError::Auth(_) | RemoteError::Connection(_) | RemoteError::Timeout
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::NotFound(_))
    }
}

/// A single path failed during a reconciliation pass.
#[derive(Debug, thiserror::Error)]
#[error("{}: {source}", path.display())]
pub struct ReconcileError {
    pub path: PathBuf,
    #[source]
    pub source: RemoteError,
}
