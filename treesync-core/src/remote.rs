use crate::config::ConnectionCfg;
use crate::error::RemoteError;
use async_trait::async_trait;
use std::path::Path;

/// Attributes of one remote directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    /// Seconds since the Unix epoch.
    pub mtime: u64,
}

/// Remote filesystem operations over one live session.
///
/// Paths are absolute remote paths with `/` separators. Every operation
/// except `rename` must be safe to repeat.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// `Ok(None)` when nothing exists at `path`.
    async fn stat(&self, path: &str) -> Result<Option<RemoteEntry>, RemoteError>;

    /// Create `path` and any missing parents. Existing directories are fine.
    async fn ensure_dir(&self, path: &str) -> Result<(), RemoteError>;

    /// Write (or overwrite) `remote` with the contents of `local`, carrying
    /// over the local modification time.
    async fn put_file(&self, local: &Path, remote: &str) -> Result<(), RemoteError>;

    async fn delete_file(&self, path: &str) -> Result<(), RemoteError>;

    /// Remove a directory and everything below it.
    async fn delete_dir(&self, path: &str) -> Result<(), RemoteError>;

    /// Move `from` to `to`. May fail with [`RemoteError::Unsupported`].
    async fn rename(&self, from: &str, to: &str) -> Result<(), RemoteError>;

    /// Entries of a directory, [`RemoteError::NotFound`] if it is missing.
    async fn list_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, RemoteError>;

    async fn close(&self) -> Result<(), RemoteError>;
}

/// Opens sessions. A worker calls this again for every reconnect.
#[async_trait]
pub trait RemoteConnector: Send + Sync + 'static {
    async fn connect(&self, conn: &ConnectionCfg) -> Result<Box<dyn RemoteClient>, RemoteError>;
}
