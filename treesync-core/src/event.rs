use std::fmt;
use std::path::{Path, PathBuf};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RawEventKind {
    Created,
    Modified,
    Deleted,
    MovedFrom,
    MovedTo,
    AttributesChanged,
}

/// One change reported by a [`WatchSession`](crate::WatchSession), already
/// relative to the sync root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub kind: RawEventKind,
    pub path: PathBuf,
    pub is_dir: bool,
    pub at: Instant,
    /// Correlates a `MovedFrom` with its `MovedTo`.
    pub cookie: Option<usize>,
    /// Source path of a `MovedTo` when the notification source pairs moves itself.
    pub paired: Option<PathBuf>,
}

impl RawEvent {
    pub fn new(kind: RawEventKind, path: impl Into<PathBuf>, is_dir: bool) -> Self {
        Self {
            kind,
            path: path.into(),
            is_dir,
            at: Instant::now(),
            cookie: None,
            paired: None,
        }
    }

    pub fn created(path: impl Into<PathBuf>, is_dir: bool) -> Self {
        Self::new(RawEventKind::Created, path, is_dir)
    }

    pub fn modified(path: impl Into<PathBuf>) -> Self {
        Self::new(RawEventKind::Modified, path, false)
    }

    pub fn deleted(path: impl Into<PathBuf>, is_dir: bool) -> Self {
        Self::new(RawEventKind::Deleted, path, is_dir)
    }

    pub fn moved_from(path: impl Into<PathBuf>, is_dir: bool, cookie: usize) -> Self {
        Self::new(RawEventKind::MovedFrom, path, is_dir).with_cookie(cookie)
    }

    pub fn moved_to(path: impl Into<PathBuf>, is_dir: bool, cookie: usize) -> Self {
        Self::new(RawEventKind::MovedTo, path, is_dir).with_cookie(cookie)
    }

    pub fn at(mut self, at: Instant) -> Self {
        self.at = at;
        self
    }

    pub fn with_cookie(mut self, cookie: usize) -> Self {
        self.cookie = Some(cookie);
        self
    }

    pub fn paired_with(mut self, from: impl Into<PathBuf>) -> Self {
        self.paired = Some(from.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ActionKind {
    /// Write the local file (or, for a directory, the whole subtree).
    Upload,
    /// Remove the remote file or subtree.
    Delete,
    /// Create the remote directory and missing parents.
    Mkdir,
    /// Move the remote path to `to`.
    Rename { to: PathBuf },
}

/// A coalesced unit of remote work, keyed by `path`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PendingAction {
    pub path: PathBuf,
    pub kind: ActionKind,
}

impl PendingAction {
    pub fn upload(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), kind: ActionKind::Upload }
    }

    pub fn delete(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), kind: ActionKind::Delete }
    }

    pub fn mkdir(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), kind: ActionKind::Mkdir }
    }

    pub fn rename(from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Self {
        Self {
            path: from.into(),
            kind: ActionKind::Rename { to: to.into() },
        }
    }

    /// The path whose remote state this action leaves in its final form.
    pub fn target(&self) -> &Path {
        match &self.kind {
            ActionKind::Rename { to } => to,
            _ => &self.path,
        }
    }
}

impl fmt::Display for PendingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ActionKind::Upload => write!(f, "upload {}", self.path.display()),
            ActionKind::Delete => write!(f, "delete {}", self.path.display()),
            ActionKind::Mkdir => write!(f, "mkdir {}", self.path.display()),
            ActionKind::Rename { to } => {
                write!(f, "rename {} -> {}", self.path.display(), to.display())
            }
        }
    }
}
