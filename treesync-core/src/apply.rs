use crate::error::RemoteError;
use crate::event::{ActionKind, PendingAction};
use crate::filter::PathMatcher;
use crate::remote::RemoteClient;
use crate::utils::{as_posix_path, remote_path, relative_to};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Where one pair's paths live on each side.
#[derive(Debug, Clone)]
pub struct SyncContext {
    pub pair: String,
    pub local_root: PathBuf,
    pub remote_root: String,
    pub matcher: Arc<PathMatcher>,
}

/// What applying an action amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Done,
    /// Nothing to do, e.g. the local file vanished before upload.
    Skipped,
}

impl SyncContext {
    pub fn remote(&self, rel: &Path) -> String {
        remote_path(&self.remote_root, rel)
    }

    pub fn local(&self, rel: &Path) -> PathBuf {
        self.local_root.join(rel)
    }

    /// Carry out one action against the remote.
    ///
    /// Every variant is idempotent except a bare remote rename, which is
    /// guarded by checking both ends first.
    pub async fn apply(
        &self,
        client: &dyn RemoteClient,
        action: &PendingAction,
    ) -> Result<Applied, RemoteError> {
        match &action.kind {
            ActionKind::Upload => self.upload(client, &action.path).await,
            ActionKind::Mkdir => {
                client.ensure_dir(&self.remote(&action.path)).await?;
                Ok(Applied::Done)
            }
            ActionKind::Delete => self.delete(client, &action.path).await,
            ActionKind::Rename { to } => self.rename(client, &action.path, to).await,
        }
    }

    async fn upload(&self, client: &dyn RemoteClient, rel: &Path) -> Result<Applied, RemoteError> {
        let meta = match tokio::fs::metadata(self.local(rel)).await {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(pair = %self.pair, path = %rel.display(), "vanished before upload");
                return Ok(Applied::Skipped);
            }
            Err(e) => return Err(e.into()),
        };
        if meta.is_dir() {
            return self.upload_tree(client, rel).await;
        }
        self.ensure_parent(client, rel).await?;
        self.put(client, rel).await
    }

    async fn put(&self, client: &dyn RemoteClient, rel: &Path) -> Result<Applied, RemoteError> {
        match client.put_file(&self.local(rel), &self.remote(rel)).await {
            Ok(()) => Ok(Applied::Done),
            Err(RemoteError::LocalIo(e)) if e.kind() == io::ErrorKind::NotFound => {
                debug!(pair = %self.pair, path = %rel.display(), "vanished during upload");
                Ok(Applied::Skipped)
            }
            Err(e) => Err(e),
        }
    }

    /// Mirror a whole local directory, skipping excluded entries.
    async fn upload_tree(
        &self,
        client: &dyn RemoteClient,
        rel: &Path,
    ) -> Result<Applied, RemoteError> {
        client.ensure_dir(&self.remote(rel)).await?;
        let root = self.local_root.clone();
        let start = self.local(rel);
        let matcher = self.matcher.clone();
        let entries = tokio::task::spawn_blocking(move || walk_local(&root, &start, &matcher))
            .await
            .map_err(|e| RemoteError::LocalIo(io::Error::other(e)))?;
        for (child, is_dir) in entries {
            if is_dir {
                client.ensure_dir(&self.remote(&child)).await?;
            } else {
                self.put(client, &child).await?;
            }
        }
        Ok(Applied::Done)
    }

    async fn ensure_parent(&self, client: &dyn RemoteClient, rel: &Path) -> Result<(), RemoteError> {
        match rel.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                client.ensure_dir(&self.remote(parent)).await
            }
            _ => client.ensure_dir(&self.remote_root).await,
        }
    }

    async fn delete(&self, client: &dyn RemoteClient, rel: &Path) -> Result<Applied, RemoteError> {
        let remote = self.remote(rel);
        let Some(entry) = client.stat(&remote).await? else {
            return Ok(Applied::Skipped);
        };
        let res = if entry.is_dir {
            client.delete_dir(&remote).await
        } else {
            client.delete_file(&remote).await
        };
        match res {
            Ok(()) => Ok(Applied::Done),
            Err(e) if e.is_not_found() => Ok(Applied::Skipped),
            Err(e) => Err(e),
        }
    }

    async fn rename(
        &self,
        client: &dyn RemoteClient,
        from: &Path,
        to: &Path,
    ) -> Result<Applied, RemoteError> {
        let src = self.remote(from);
        let dst = self.remote(to);
        if client.stat(&src).await?.is_none() {
            debug!(pair = %self.pair, from = %src, "rename source missing remotely, uploading");
            return self.upload(client, to).await;
        }
        if client.stat(&dst).await?.is_some() {
            self.delete(client, to).await?;
        }
        self.ensure_parent(client, to).await?;
        match client.rename(&src, &dst).await {
            Ok(()) => Ok(Applied::Done),
            Err(e) if e.is_connection() => Err(e),
            Err(e) => {
                warn!(pair = %self.pair, from = %src, to = %dst, error = %e,
                    "rename failed, falling back to delete + upload");
                self.delete(client, from).await?;
                self.upload(client, to).await
            }
        }
    }
}

/// Everything below `start` that survives the matcher, parents first.
/// Entries that disappear mid-walk are skipped.
pub(crate) fn walk_local(root: &Path, start: &Path, matcher: &PathMatcher) -> Vec<(PathBuf, bool)> {
    let mut out = Vec::new();
    let walker = WalkDir::new(start)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            if e.depth() == 0 {
                return true;
            }
            match relative_to(root, e.path()) {
                Some(rel) => !matcher.excluded(&rel, e.file_type().is_dir()),
                None => false,
            }
        });
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                debug!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if entry.file_type().is_symlink() {
            debug!(path = %as_posix_path(entry.path()), "skipping symlink");
            continue;
        }
        if let Some(rel) = relative_to(root, entry.path()) {
            out.push((rel, entry.file_type().is_dir()));
        }
    }
    out
}
