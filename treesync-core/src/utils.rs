use std::fs::Metadata;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Render a path with forward slashes, the separator every remote expects.
pub fn as_posix_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Join a path relative to the local root onto the remote root.
pub fn remote_path(remote_root: &str, rel: &Path) -> String {
    let rel = as_posix_path(rel);
    let root = remote_root.trim_end_matches('/');
    if rel.is_empty() {
        if root.is_empty() { "/".to_string() } else { root.to_string() }
    } else {
        format!("{root}/{rel}")
    }
}

/// Strip `root` from an absolute event path. `None` for paths outside the
/// root and for the root itself.
pub fn relative_to(root: &Path, path: &Path) -> Option<PathBuf> {
    let rel = path.strip_prefix(root).ok()?;
    if rel.as_os_str().is_empty() {
        return None;
    }
    Some(rel.to_path_buf())
}

/// `path` lies strictly beneath `ancestor` (component-wise).
pub fn is_beneath(path: &Path, ancestor: &Path) -> bool {
    path != ancestor && path.starts_with(ancestor)
}

/// Proper ancestors of a relative path, nearest last: `a/b/c` yields `a`, `a/b`.
pub fn ancestors_of(rel: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut cur = PathBuf::new();
    let comps: Vec<Component> = rel.components().collect();
    for comp in comps.iter().take(comps.len().saturating_sub(1)) {
        cur.push(comp);
        out.push(cur.clone());
    }
    out
}

/// Replace the `from` prefix of `path` with `to`.
pub fn rebase(path: &Path, from: &Path, to: &Path) -> PathBuf {
    match path.strip_prefix(from) {
        Ok(rest) if rest.as_os_str().is_empty() => to.to_path_buf(),
        Ok(rest) => to.join(rest),
        Err(_) => path.to_path_buf(),
    }
}

/// Modification time in whole seconds since the Unix epoch, 0 if unavailable.
pub fn mtime_secs(meta: &Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
