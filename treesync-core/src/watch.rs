use crate::error::WatchError;
use crate::event::{RawEvent, RawEventKind};
use crate::utils::relative_to;
use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Config, EventKind, PollWatcher, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};
use walkdir::WalkDir;

const QUEUE_CAPACITY: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchItem {
    Event(RawEvent),
    /// Events under this subtree (relative, empty for the root) were lost.
    RescanRequired(PathBuf),
}

/// Sending half of a [`WatchSession`] queue.
///
/// Never blocks: when the queue is full the item is dropped and the session
/// reports a rescan of the whole root on its next batch.
#[derive(Debug, Clone)]
pub struct WatchFeed {
    tx: mpsc::Sender<WatchItem>,
    overflow: Arc<AtomicBool>,
}

impl WatchFeed {
    pub fn send(&self, item: WatchItem) {
        match self.tx.try_send(item) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => self.overflow.store(true, Ordering::Release),
            Err(TrySendError::Closed(_)) => {}
        }
    }

    pub fn event(&self, ev: RawEvent) {
        self.send(WatchItem::Event(ev));
    }
}

/// Recursive change notifications for one local root.
pub struct WatchSession {
    root: PathBuf,
    rx: mpsc::Receiver<WatchItem>,
    overflow: Arc<AtomicBool>,
    watcher: Option<Box<dyn Watcher + Send>>,
}

impl WatchSession {
    /// Start watching `root` recursively. With `poll_interval` set, the
    /// polling backend is used instead of native notifications.
    pub fn open(root: &Path, poll_interval: Option<Duration>) -> Result<Self, WatchError> {
        let (mut session, feed) = Self::detached(root);
        let base = root.to_path_buf();
        let handler = move |res: notify::Result<notify::Event>| deliver(&base, &feed, res);
        let open_err = |source| WatchError::Open {
            root: root.to_path_buf(),
            source,
        };
        let mut watcher: Box<dyn Watcher + Send> = match poll_interval {
            Some(interval) => Box::new(
                PollWatcher::new(handler, Config::default().with_poll_interval(interval))
                    .map_err(open_err)?,
            ),
            None => Box::new(RecommendedWatcher::new(handler, Config::default()).map_err(open_err)?),
        };
        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(open_err)?;
        session.watcher = Some(watcher);
        debug!(root = %root.display(), polling = poll_interval.is_some(), "watch session open");
        Ok(session)
    }

    /// A session without an OS watcher. Items arrive only through the
    /// returned feed, which is how embedders replay recorded events.
    pub fn detached(root: &Path) -> (Self, WatchFeed) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let overflow = Arc::new(AtomicBool::new(false));
        let feed = WatchFeed {
            tx,
            overflow: overflow.clone(),
        };
        let session = Self {
            root: root.to_path_buf(),
            rx,
            overflow,
            watcher: None,
        };
        (session, feed)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Wait for the next batch of items. `None` once the source is gone.
    pub async fn next_events(&mut self) -> Option<Vec<WatchItem>> {
        let first = self.rx.recv().await?;
        let mut batch = vec![first];
        while let Ok(item) = self.rx.try_recv() {
            batch.push(item);
        }
        if self.overflow.swap(false, Ordering::AcqRel) {
            warn!(root = %self.root.display(), "notification queue overflowed, rescan of the root required");
            batch.push(WatchItem::RescanRequired(PathBuf::new()));
        }
        Some(batch)
    }

    pub fn close(&mut self) {
        if let Some(mut watcher) = self.watcher.take() {
            if let Err(e) = watcher.unwatch(&self.root) {
                debug!(root = %self.root.display(), error = %e, "unwatch failed");
            }
        }
        self.rx.close();
    }
}

impl Drop for WatchSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Notify callback body. A backend error means events may have been
/// missed, so the whole root is rescanned.
fn deliver(root: &Path, feed: &WatchFeed, res: notify::Result<notify::Event>) {
    match res.map_err(WatchError::from) {
        Ok(event) => {
            for item in translate(root, event) {
                feed.send(item);
            }
        }
        Err(e) => {
            warn!(root = %root.display(), error = %e, "requesting rescan");
            feed.send(WatchItem::RescanRequired(PathBuf::new()));
        }
    }
}

/// Turn one notify event into root-relative watch items.
fn translate(root: &Path, event: notify::Event) -> Vec<WatchItem> {
    let mut out = Vec::new();
    if event.need_rescan() {
        let subtree = event
            .paths
            .first()
            .and_then(|p| relative_to(root, p))
            .unwrap_or_default();
        out.push(WatchItem::RescanRequired(subtree));
        return out;
    }
    let cookie = event.tracker();
    match event.kind {
        EventKind::Create(kind) => {
            for p in &event.paths {
                let Some(rel) = relative_to(root, p) else { continue };
                let is_dir = match kind {
                    CreateKind::Folder => true,
                    CreateKind::File => false,
                    _ => p.is_dir(),
                };
                out.push(WatchItem::Event(RawEvent::created(rel, is_dir)));
                if is_dir {
                    scan_new_dir(root, p, &mut out);
                }
            }
        }
        EventKind::Modify(ModifyKind::Name(mode)) => translate_rename(root, mode, &event.paths, cookie, &mut out),
        EventKind::Modify(ModifyKind::Metadata(_)) => {
            for p in &event.paths {
                if let Some(rel) = relative_to(root, p) {
                    let ev = RawEvent::new(RawEventKind::AttributesChanged, rel, p.is_dir());
                    out.push(WatchItem::Event(ev));
                }
            }
        }
        EventKind::Modify(_) => {
            for p in &event.paths {
                // directory mtime churn carries no content
                if p.is_dir() {
                    continue;
                }
                if let Some(rel) = relative_to(root, p) {
                    out.push(WatchItem::Event(RawEvent::modified(rel)));
                }
            }
        }
        EventKind::Remove(kind) => {
            for p in &event.paths {
                if let Some(rel) = relative_to(root, p) {
                    let is_dir = matches!(kind, RemoveKind::Folder);
                    out.push(WatchItem::Event(RawEvent::deleted(rel, is_dir)));
                }
            }
        }
        _ => {}
    }
    out
}

fn translate_rename(
    root: &Path,
    mode: RenameMode,
    paths: &[PathBuf],
    cookie: Option<usize>,
    out: &mut Vec<WatchItem>,
) {
    let mut push = |ev: RawEvent| out.push(WatchItem::Event(ev));
    match mode {
        // the source is already gone; the coalescer infers directories
        RenameMode::From => {
            for p in paths {
                let Some(rel) = relative_to(root, p) else { continue };
                match cookie {
                    Some(c) => push(RawEvent::moved_from(rel, false, c)),
                    None => push(RawEvent::deleted(rel, false)),
                }
            }
        }
        RenameMode::To => {
            for p in paths {
                let Some(rel) = relative_to(root, p) else { continue };
                let ev = RawEvent::new(RawEventKind::MovedTo, rel, p.is_dir());
                push(match cookie {
                    Some(c) => ev.with_cookie(c),
                    None => ev,
                });
            }
        }
        // with a tracker the From/To halves already carry this rename
        RenameMode::Both if cookie.is_some() => {}
        RenameMode::Both => {
            let [from, to] = paths else { return };
            let is_dir = to.is_dir();
            match (relative_to(root, from), relative_to(root, to)) {
                (Some(src), Some(dst)) => {
                    push(RawEvent::new(RawEventKind::MovedTo, dst, is_dir).paired_with(src))
                }
                (None, Some(dst)) => push(RawEvent::new(RawEventKind::MovedTo, dst, is_dir)),
                (Some(src), None) => push(RawEvent::deleted(src, is_dir)),
                (None, None) => {}
            }
        }
        _ => {
            // the backend could not tell which half this is
            for p in paths {
                let Some(rel) = relative_to(root, p) else { continue };
                if p.exists() {
                    push(RawEvent::new(RawEventKind::MovedTo, rel, p.is_dir()));
                } else {
                    push(RawEvent::deleted(rel, false));
                }
            }
        }
    }
}

/// Report everything already inside a freshly created directory. Files
/// written before the recursive watch reached it produce no events.
fn scan_new_dir(root: &Path, dir: &Path, out: &mut Vec<WatchItem>) {
    for entry in WalkDir::new(dir).min_depth(1).follow_links(false).into_iter().flatten() {
        if entry.file_type().is_symlink() {
            continue;
        }
        if let Some(rel) = relative_to(root, entry.path()) {
            let ev = RawEvent::created(rel, entry.file_type().is_dir());
            out.push(WatchItem::Event(ev));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{DataChange, MetadataKind};
    use std::fs;

    fn events(items: Vec<WatchItem>) -> Vec<(RawEventKind, PathBuf, bool)> {
        items
            .into_iter()
            .filter_map(|i| match i {
                WatchItem::Event(e) => Some((e.kind, e.path, e.is_dir)),
                WatchItem::RescanRequired(_) => None,
            })
            .collect()
    }

    #[test]
    fn created_directory_reports_its_contents() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("pkg/sub")).unwrap();
        fs::write(root.join("pkg/sub/a.txt"), b"a").unwrap();

        let ev = notify::Event::new(EventKind::Create(CreateKind::Folder)).add_path(root.join("pkg"));
        let got = events(translate(root, ev));
        assert_eq!(
            got,
            vec![
                (RawEventKind::Created, PathBuf::from("pkg"), true),
                (RawEventKind::Created, PathBuf::from("pkg/sub"), true),
                (RawEventKind::Created, PathBuf::from("pkg/sub/a.txt"), false),
            ]
        );
    }

    #[test]
    fn rename_halves_keep_their_cookie() {
        let root = Path::new("/w");
        let from = notify::Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::From)))
            .add_path(PathBuf::from("/w/a"))
            .set_tracker(7);
        let both = notify::Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(PathBuf::from("/w/a"))
            .add_path(PathBuf::from("/w/b"))
            .set_tracker(7);
        match translate(root, from).as_slice() {
            [WatchItem::Event(e)] => {
                assert_eq!(e.kind, RawEventKind::MovedFrom);
                assert_eq!(e.cookie, Some(7));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(translate(root, both).is_empty());
    }

    #[test]
    fn untracked_rename_pair_is_paired_directly() {
        let root = Path::new("/w");
        let both = notify::Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(PathBuf::from("/w/a"))
            .add_path(PathBuf::from("/w/b"));
        match translate(root, both).as_slice() {
            [WatchItem::Event(e)] => {
                assert_eq!(e.kind, RawEventKind::MovedTo);
                assert_eq!(e.path, PathBuf::from("b"));
                assert_eq!(e.paired, Some(PathBuf::from("a")));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rescan_flag_and_outside_paths() {
        let root = Path::new("/w");
        let flagged = notify::Event::new(EventKind::Other)
            .add_path(PathBuf::from("/w/deep/dir"))
            .set_flag(notify::event::Flag::Rescan);
        assert_eq!(
            translate(root, flagged),
            vec![WatchItem::RescanRequired(PathBuf::from("deep/dir"))]
        );

        let outside = notify::Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
            .add_path(PathBuf::from("/elsewhere/x"));
        assert!(translate(root, outside).is_empty());

        let attrs = notify::Event::new(EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions)))
            .add_path(PathBuf::from("/w/x"));
        assert_eq!(
            events(translate(root, attrs)),
            vec![(RawEventKind::AttributesChanged, PathBuf::from("x"), false)]
        );
    }

    #[tokio::test]
    async fn detached_feed_overflow_requests_rescan() {
        let (mut session, feed) = WatchSession::detached(Path::new("/w"));
        for i in 0..QUEUE_CAPACITY + 10 {
            feed.event(RawEvent::modified(format!("f{i}")));
        }
        let batch = session.next_events().await.unwrap();
        assert_eq!(batch.len(), QUEUE_CAPACITY + 1);
        assert_eq!(batch.last(), Some(&WatchItem::RescanRequired(PathBuf::new())));
    }

    #[tokio::test]
    async fn backend_error_requests_root_rescan() {
        let root = Path::new("/w");
        let (mut session, feed) = WatchSession::detached(root);
        deliver(root, &feed, Err(notify::Error::generic("inotify read failed")));
        let ok = notify::Event::new(EventKind::Remove(RemoveKind::File)).add_path(PathBuf::from("/w/gone.txt"));
        deliver(root, &feed, Ok(ok));

        let batch = session.next_events().await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0], WatchItem::RescanRequired(PathBuf::new()));
        assert_eq!(
            events(batch),
            vec![(RawEventKind::Deleted, PathBuf::from("gone.txt"), false)]
        );
    }

    #[tokio::test]
    async fn polling_session_reports_new_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = WatchSession::open(dir.path(), Some(Duration::from_millis(50))).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        fs::write(dir.path().join("new.txt"), b"x").unwrap();

        let found = tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(batch) = session.next_events().await {
                let hit = batch.iter().any(|i| {
                    matches!(i, WatchItem::Event(e) if e.path == Path::new("new.txt"))
                });
                if hit {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false);
        assert!(found);
        session.close();
    }
}
