//! Full-tree comparison between the local root and the remote root.
//!
//! A pass takes two snapshots, computes a [`plan`] from them and then applies
//! it action by action. Planning is pure so it can be tested on its own.

use crate::apply::{walk_local, Applied, SyncContext};
use crate::error::{ReconcileError, RemoteError};
use crate::event::PendingAction;
use crate::remote::RemoteClient;
use crate::utils::{ancestors_of, is_beneath, mtime_secs};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Local mtimes within this many seconds of the remote one count as equal.
const MTIME_TOLERANCE_SECS: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryMeta {
    pub is_dir: bool,
    pub size: u64,
    pub mtime: u64,
}

impl EntryMeta {
    pub fn dir() -> Self {
        Self { is_dir: true, size: 0, mtime: 0 }
    }

    pub fn file(size: u64, mtime: u64) -> Self {
        Self { is_dir: false, size, mtime }
    }
}

/// Relative path to metadata for every non-excluded entry of one side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeSnapshot {
    entries: BTreeMap<PathBuf, EntryMeta>,
}

impl TreeSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, rel: impl Into<PathBuf>, meta: EntryMeta) {
        self.entries.insert(rel.into(), meta);
    }

    pub fn get(&self, rel: &Path) -> Option<&EntryMeta> {
        self.entries.get(rel)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in path order, so parents always precede their children.
    pub fn iter(&self) -> impl Iterator<Item = (&PathBuf, &EntryMeta)> {
        self.entries.iter()
    }
}

/// Output of [`plan`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Plan {
    pub actions: Vec<PendingAction>,
    /// Paths that are a file on one side and a directory on the other but
    /// may not be replaced because deletes are disabled. Nothing at or
    /// beneath them is touched.
    pub conflicts: Vec<PathBuf>,
}

/// Compute the actions that make `remote` look like `local`.
///
/// Order: deletes that clear a type mismatch, directory creations (parents
/// first), uploads, then deletes of extraneous remote paths. Only the
/// top-most extraneous path of a subtree is deleted. Without
/// `delete_extraneous` no delete is ever planned; type mismatches are
/// reported as conflicts instead.
pub fn plan(local: &TreeSnapshot, remote: &TreeSnapshot, delete_extraneous: bool) -> Plan {
    let mut replaced = Vec::new();
    let mut mkdirs = Vec::new();
    let mut uploads = Vec::new();
    let mut conflicts: Vec<PathBuf> = Vec::new();

    for (path, l) in local.iter() {
        if conflicts.iter().any(|c| is_beneath(path, c)) {
            continue;
        }
        match remote.get(path) {
            Some(r) if r.is_dir == l.is_dir => {
                if !l.is_dir && (l.size != r.size || l.mtime > r.mtime + MTIME_TOLERANCE_SECS) {
                    uploads.push(PendingAction::upload(path.clone()));
                }
                continue;
            }
            Some(_) if !delete_extraneous => {
                conflicts.push(path.clone());
                continue;
            }
            Some(_) => replaced.push(PendingAction::delete(path.clone())),
            None => {}
        }
        if l.is_dir {
            mkdirs.push(PendingAction::mkdir(path.clone()));
        } else {
            uploads.push(PendingAction::upload(path.clone()));
        }
    }

    let mut extraneous: Vec<PendingAction> = Vec::new();
    if delete_extraneous {
        for (path, _) in remote.iter() {
            if local.get(path).is_some() {
                continue;
            }
            let covered = ancestors_of(path).iter().any(|a| {
                local.get(a).is_some_and(|l| !l.is_dir)
                    || extraneous.iter().any(|d| d.path == *a)
            });
            if !covered {
                extraneous.push(PendingAction::delete(path.clone()));
            }
        }
        extraneous.reverse();
    }

    let mut actions = replaced;
    actions.extend(mkdirs);
    actions.extend(uploads);
    actions.extend(extraneous);
    Plan { actions, conflicts }
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub planned: usize,
    pub applied: usize,
    pub skipped: usize,
    pub failures: Vec<ReconcileError>,
    /// The session dropped mid-pass; the pass has to be repeated after reconnect.
    pub interrupted: bool,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && !self.interrupted
    }
}

/// Runs reconciliation passes for one pair.
#[derive(Debug, Clone)]
pub struct Reconciler {
    ctx: Arc<SyncContext>,
    delete_extraneous: bool,
}

impl Reconciler {
    pub fn new(ctx: Arc<SyncContext>, delete_extraneous: bool) -> Self {
        Self { ctx, delete_extraneous }
    }

    /// Bring the remote subtree at `subtree` (relative, empty for the whole
    /// root) in line with the local one.
    ///
    /// Per-path failures are collected and do not stop the pass. A
    /// connection-class error stops it and sets `interrupted`.
    pub async fn reconcile(&self, client: &dyn RemoteClient, subtree: &Path) -> ReconcileReport {
        let started = Instant::now();
        let mut report = ReconcileReport::default();
        let pair = self.ctx.pair.as_str();

        let local = match self.scan_local(subtree).await {
            Ok(s) => s,
            Err(source) => {
                warn!(pair, error = %source, "local scan failed");
                report.failures.push(ReconcileError { path: subtree.to_path_buf(), source });
                return report;
            }
        };
        let remote = match self.scan_remote(client, subtree).await {
            Ok(s) => s,
            Err(source) => {
                warn!(pair, error = %source, "remote scan failed");
                report.interrupted = source.is_connection();
                report.failures.push(ReconcileError { path: subtree.to_path_buf(), source });
                return report;
            }
        };

        let Plan { actions, conflicts } = plan(&local, &remote, self.delete_extraneous);
        report.planned = actions.len();
        for path in conflicts {
            warn!(pair, path = %path.display(), "file/directory mismatch left in place, deletes are disabled");
            report.failures.push(ReconcileError {
                path,
                source: RemoteError::Operation("type differs from local and deletes are disabled".into()),
            });
        }
        debug!(pair, subtree = %subtree.display(), local = local.len(), remote = remote.len(),
            planned = actions.len(), "reconcile plan ready");

        for action in &actions {
            match self.ctx.apply(client, action).await {
                Ok(Applied::Done) => report.applied += 1,
                Ok(Applied::Skipped) => report.skipped += 1,
                Err(source) => {
                    let fatal = source.is_connection();
                    warn!(pair, %action, error = %source, "reconcile step failed");
                    report.failures.push(ReconcileError { path: action.path.clone(), source });
                    if fatal {
                        report.interrupted = true;
                        break;
                    }
                }
            }
        }

        info!(
            pair,
            subtree = %subtree.display(),
            planned = report.planned,
            applied = report.applied,
            failed = report.failures.len(),
            interrupted = report.interrupted,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "reconcile pass finished"
        );
        report
    }

    async fn scan_local(&self, subtree: &Path) -> Result<TreeSnapshot, RemoteError> {
        let ctx = self.ctx.clone();
        let subtree = subtree.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<TreeSnapshot, RemoteError> {
            let start = ctx.local(&subtree);
            match std::fs::read_dir(&start) {
                Ok(_) => {}
                // a vanished subtree simply has no local entries
                Err(e) if e.kind() == std::io::ErrorKind::NotFound && !subtree.as_os_str().is_empty() => {
                    return Ok(TreeSnapshot::new());
                }
                Err(e) => return Err(e.into()),
            }
            let mut snap = TreeSnapshot::new();
            for (rel, is_dir) in walk_local(&ctx.local_root, &start, &ctx.matcher) {
                let meta = if is_dir {
                    EntryMeta::dir()
                } else {
                    match std::fs::metadata(ctx.local(&rel)) {
                        Ok(m) => EntryMeta::file(m.len(), mtime_secs(&m)),
                        Err(_) => continue,
                    }
                };
                snap.insert(rel, meta);
            }
            Ok(snap)
        })
        .await
        .map_err(|e| RemoteError::LocalIo(std::io::Error::other(e)))?
    }

    async fn scan_remote(&self, client: &dyn RemoteClient, subtree: &Path) -> Result<TreeSnapshot, RemoteError> {
        let mut snap = TreeSnapshot::new();
        let mut pending = vec![subtree.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let listing = match client.list_dir(&self.ctx.remote(&dir)).await {
                Ok(l) => l,
                Err(e) if e.is_not_found() => {
                    if dir.as_os_str().is_empty() {
                        client.ensure_dir(&self.ctx.remote_root).await?;
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };
            for entry in listing {
                if entry.name.is_empty() || entry.name == "." || entry.name == ".." {
                    continue;
                }
                let rel = dir.join(&entry.name);
                if self.ctx.matcher.excluded(&rel, entry.is_dir) {
                    continue;
                }
                if entry.is_dir {
                    snap.insert(rel.clone(), EntryMeta::dir());
                    pending.push(rel);
                } else {
                    snap.insert(rel, EntryMeta::file(entry.size, entry.mtime));
                }
            }
        }
        Ok(snap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Pattern;
    use crate::filter::PathMatcher;
    use crate::testing::MemoryRemote;
    use std::fs;

    fn snap(entries: &[(&str, EntryMeta)]) -> TreeSnapshot {
        let mut s = TreeSnapshot::new();
        for (p, m) in entries {
            s.insert(*p, *m);
        }
        s
    }

    fn reconciler(root: &Path, patterns: &[&str], delete: bool) -> Reconciler {
        let patterns: Vec<Pattern> = patterns.iter().map(|p| Pattern::from(*p)).collect();
        let ctx = SyncContext {
            pair: "test".into(),
            local_root: root.to_path_buf(),
            remote_root: "/srv/app".into(),
            matcher: Arc::new(PathMatcher::new(&patterns, false).unwrap()),
        };
        Reconciler::new(Arc::new(ctx), delete)
    }

    #[test]
    fn plan_creates_parents_before_files() {
        let local = snap(&[("src", EntryMeta::dir()), ("src/a.txt", EntryMeta::file(3, 10))]);
        let actions = plan(&local, &TreeSnapshot::new(), false).actions;
        assert_eq!(
            actions,
            vec![PendingAction::mkdir("src"), PendingAction::upload("src/a.txt")]
        );
    }

    #[test]
    fn plan_compares_size_and_mtime() {
        let local = snap(&[
            ("same", EntryMeta::file(3, 100)),
            ("close", EntryMeta::file(3, 101)),
            ("newer", EntryMeta::file(3, 200)),
            ("resized", EntryMeta::file(4, 100)),
            ("older", EntryMeta::file(3, 50)),
        ]);
        let remote = snap(&[
            ("same", EntryMeta::file(3, 100)),
            ("close", EntryMeta::file(3, 100)),
            ("newer", EntryMeta::file(3, 100)),
            ("resized", EntryMeta::file(3, 100)),
            ("older", EntryMeta::file(3, 100)),
        ]);
        assert_eq!(
            plan(&local, &remote, false).actions,
            vec![PendingAction::upload("newer"), PendingAction::upload("resized")]
        );
    }

    #[test]
    fn plan_deletes_only_top_most_extraneous_paths() {
        let local = snap(&[("keep", EntryMeta::file(1, 1))]);
        let remote = snap(&[
            ("keep", EntryMeta::file(1, 1)),
            ("old", EntryMeta::dir()),
            ("old/a", EntryMeta::file(1, 1)),
            ("old/b", EntryMeta::dir()),
            ("old/b/c", EntryMeta::file(1, 1)),
            ("stray.txt", EntryMeta::file(1, 1)),
        ]);
        assert_eq!(
            plan(&local, &remote, true).actions,
            vec![PendingAction::delete("stray.txt"), PendingAction::delete("old")]
        );
        assert_eq!(plan(&local, &remote, false), Plan::default());
    }

    #[test]
    fn plan_replaces_type_mismatches() {
        let local = snap(&[("x", EntryMeta::file(1, 1)), ("d", EntryMeta::dir())]);
        let remote = snap(&[
            ("x", EntryMeta::dir()),
            ("x/inner", EntryMeta::file(1, 1)),
            ("d", EntryMeta::file(1, 1)),
        ]);
        let actions = plan(&local, &remote, true).actions;
        assert_eq!(
            actions,
            vec![
                PendingAction::delete("d"),
                PendingAction::delete("x"),
                PendingAction::mkdir("d"),
                PendingAction::upload("x"),
            ]
        );
        assert!(!actions.contains(&PendingAction::delete("x/inner")));
    }

    #[test]
    fn plan_keeps_type_mismatches_without_delete() {
        let local = snap(&[
            ("x", EntryMeta::file(1, 1)),
            ("d", EntryMeta::dir()),
            ("d/child.txt", EntryMeta::file(1, 1)),
            ("ok.txt", EntryMeta::file(1, 1)),
        ]);
        let remote = snap(&[
            ("x", EntryMeta::dir()),
            ("x/keep_me", EntryMeta::file(1, 1)),
            ("d", EntryMeta::file(1, 1)),
        ]);
        let out = plan(&local, &remote, false);
        assert_eq!(out.actions, vec![PendingAction::upload("ok.txt")]);
        assert_eq!(out.conflicts, vec![PathBuf::from("d"), PathBuf::from("x")]);
    }

    #[tokio::test]
    async fn type_mismatch_is_reported_not_deleted_without_delete() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("x"), b"now a file").unwrap();
        let remote = MemoryRemote::new();
        remote.seed_dir("/srv");
        remote.seed_dir("/srv/app");
        remote.seed_dir("/srv/app/x");
        remote.seed_file("/srv/app/x/keep_me", b"keep", 1);

        let report = reconciler(dir.path(), &[], false).reconcile(&remote, Path::new("")).await;
        assert!(!report.interrupted);
        assert_eq!(report.planned, 0);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].path, PathBuf::from("x"));
        assert_eq!(remote.file("/srv/app/x/keep_me").unwrap(), b"keep");
    }

    #[tokio::test]
    async fn initial_pass_mirrors_tree_and_second_pass_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/a.txt"), b"abc").unwrap();
        fs::write(dir.path().join("trace.log"), b"skip").unwrap();
        let remote = MemoryRemote::new();
        let r = reconciler(dir.path(), &["*.log"], true);

        let first = r.reconcile(&remote, Path::new("")).await;
        assert!(first.is_clean());
        assert_eq!(first.planned, 2);
        assert_eq!(first.applied, 2);
        assert!(remote.is_dir("/srv/app/src"));
        assert_eq!(remote.file("/srv/app/src/a.txt").unwrap(), b"abc");
        assert!(!remote.exists("/srv/app/trace.log"));

        let second = r.reconcile(&remote, Path::new("")).await;
        assert!(second.is_clean());
        assert_eq!(second.planned, 0);
    }

    #[tokio::test]
    async fn extraneous_remote_paths_survive_without_delete() {
        let dir = tempfile::tempdir().unwrap();
        let remote = MemoryRemote::new();
        remote.seed_dir("/srv");
        remote.seed_dir("/srv/app");
        remote.seed_file("/srv/app/legacy.txt", b"old", 1);

        let report = reconciler(dir.path(), &[], false).reconcile(&remote, Path::new("")).await;
        assert!(report.is_clean());
        assert!(remote.exists("/srv/app/legacy.txt"));

        let report = reconciler(dir.path(), &[], true).reconcile(&remote, Path::new("")).await;
        assert_eq!(report.applied, 1);
        assert!(!remote.exists("/srv/app/legacy.txt"));
    }

    #[tokio::test]
    async fn per_path_failures_do_not_stop_the_pass() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();
        fs::write(dir.path().join("b.txt"), b"b").unwrap();
        let remote = MemoryRemote::new();
        remote.fail_puts_to("/srv/app/a.txt");

        let report = reconciler(dir.path(), &[], false).reconcile(&remote, Path::new("")).await;
        assert!(!report.interrupted);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].path, PathBuf::from("a.txt"));
        assert_eq!(remote.file("/srv/app/b.txt").unwrap(), b"b");
    }

    #[tokio::test]
    async fn connection_loss_interrupts_the_pass() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();
        fs::write(dir.path().join("b.txt"), b"b").unwrap();
        let remote = MemoryRemote::new();
        remote.drop_connection_on_put("/srv/app/a.txt");

        let report = reconciler(dir.path(), &[], false).reconcile(&remote, Path::new("")).await;
        assert!(report.interrupted);
        assert_eq!(remote.put_attempts("/srv/app/b.txt"), 0);
    }

    #[tokio::test]
    async fn subtree_pass_leaves_siblings_alone() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("one")).unwrap();
        fs::create_dir_all(dir.path().join("two")).unwrap();
        fs::write(dir.path().join("one/x"), b"1").unwrap();
        fs::write(dir.path().join("two/y"), b"2").unwrap();
        let remote = MemoryRemote::new();

        let report = reconciler(dir.path(), &[], true).reconcile(&remote, Path::new("one")).await;
        assert!(report.is_clean());
        assert_eq!(remote.file("/srv/app/one/x").unwrap(), b"1");
        assert!(!remote.exists("/srv/app/two/y"));
    }
}
