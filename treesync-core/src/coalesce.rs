//! Debounce and merge raw watch events into per-path remote actions.
//!
//! Every path has at most one pending slot. The slot records what the remote
//! side needs once the local burst settles, and its deadline is pushed back
//! on every new event for the path. When a deadline passes, the slot turns
//! into exactly one [`PendingAction`].
//!
//! What matters is the remote state at the start of the window and the
//! local state at the end of it; the intermediate local history is folded
//! away. That is why a file created and deleted inside one window produces
//! nothing, and a chain of renames collapses to its earliest source.

use crate::event::{PendingAction, RawEvent, RawEventKind};
use crate::filter::PathMatcher;
use crate::utils::{ancestors_of, is_beneath, rebase};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot {
    /// Appeared inside the window; the remote never had it.
    Created { is_dir: bool },
    /// Local content must be sent. For a directory, the whole subtree.
    Upload { is_dir: bool },
    Delete { is_dir: bool },
    /// The remote `from` should be moved here.
    Rename { from: PathBuf, is_dir: bool },
}

impl Slot {
    fn into_action(self, key: PathBuf) -> PendingAction {
        match self {
            Slot::Created { is_dir: true } => PendingAction::mkdir(key),
            Slot::Created { is_dir: false } | Slot::Upload { .. } => PendingAction::upload(key),
            Slot::Delete { .. } => PendingAction::delete(key),
            Slot::Rename { from, .. } => PendingAction::rename(from, key),
        }
    }
}

#[derive(Debug)]
struct Entry {
    slot: Slot,
    deadline: Instant,
    seq: u64,
}

/// A `MovedFrom` still waiting for its `MovedTo`.
#[derive(Debug)]
struct PendingMove {
    path: PathBuf,
    is_dir: bool,
    deadline: Instant,
}

pub struct EventCoalescer {
    matcher: Arc<PathMatcher>,
    window: Duration,
    entries: HashMap<PathBuf, Entry>,
    moves: HashMap<usize, PendingMove>,
    ready: VecDeque<PendingAction>,
    rescans: Vec<PathBuf>,
    next_seq: u64,
}

impl EventCoalescer {
    pub fn new(matcher: Arc<PathMatcher>, window: Duration) -> Self {
        Self {
            matcher,
            window,
            entries: HashMap::new(),
            moves: HashMap::new(),
            ready: VecDeque::new(),
            rescans: Vec::new(),
            next_seq: 0,
        }
    }

    /// Number of paths with an undelivered action.
    pub fn pending(&self) -> usize {
        self.entries.len() + self.moves.len() + self.ready.len()
    }

    /// Earliest moment at which [`drain_expired`](Self::drain_expired) has work.
    pub fn next_deadline(&self) -> Option<Instant> {
        if !self.ready.is_empty() {
            return Some(Instant::now());
        }
        self.entries
            .values()
            .map(|e| e.deadline)
            .chain(self.moves.values().map(|m| m.deadline))
            .min()
    }

    pub fn push(&mut self, ev: RawEvent) {
        if ev.path.as_os_str().is_empty() {
            return;
        }
        let deadline = ev.at + self.window;
        match ev.kind {
            RawEventKind::Created => {
                if !self.excluded(&ev.path, ev.is_dir) {
                    self.on_created(ev.path, ev.is_dir, deadline);
                }
            }
            RawEventKind::Modified | RawEventKind::AttributesChanged => {
                if !ev.is_dir && !self.excluded(&ev.path, false) {
                    self.on_modified(ev.path, deadline);
                }
            }
            RawEventKind::Deleted => {
                if !self.excluded(&ev.path, ev.is_dir) {
                    self.on_deleted(ev.path, ev.is_dir, deadline);
                }
            }
            RawEventKind::MovedFrom => match ev.cookie {
                Some(cookie) => {
                    self.moves.insert(
                        cookie,
                        PendingMove {
                            path: ev.path,
                            is_dir: ev.is_dir,
                            deadline,
                        },
                    );
                }
                None => {
                    if !self.excluded(&ev.path, ev.is_dir) {
                        self.on_deleted(ev.path, ev.is_dir, deadline);
                    }
                }
            },
            RawEventKind::MovedTo => {
                let source = match ev.paired {
                    Some(from) => Some(from),
                    None => ev
                        .cookie
                        .and_then(|c| self.moves.remove(&c))
                        .map(|m| m.path),
                };
                match source {
                    Some(from) => self.on_move_pair(from, ev.path, ev.is_dir, deadline),
                    None => {
                        if !self.excluded(&ev.path, ev.is_dir) {
                            self.on_moved_in(ev.path, ev.is_dir, deadline);
                        }
                    }
                }
            }
        }
    }

    /// Mark a subtree (relative, empty for the whole root) as needing a
    /// re-diff against the remote. Nested requests collapse into the outer one.
    pub fn request_rescan(&mut self, subtree: PathBuf) {
        if self
            .rescans
            .iter()
            .any(|r| r.as_os_str().is_empty() || subtree.starts_with(r))
        {
            return;
        }
        if subtree.as_os_str().is_empty() {
            self.rescans.clear();
        } else {
            self.rescans.retain(|r| !r.starts_with(&subtree));
        }
        self.rescans.push(subtree);
    }

    pub fn take_rescans(&mut self) -> Vec<PathBuf> {
        std::mem::take(&mut self.rescans)
    }

    /// Emit every action whose window has closed by `now`, dependencies first.
    pub fn drain_expired(&mut self, now: Instant) -> Vec<PendingAction> {
        let lost: Vec<usize> = self
            .moves
            .iter()
            .filter(|(_, m)| m.deadline <= now)
            .map(|(c, _)| *c)
            .collect();
        for cookie in lost {
            if let Some(m) = self.moves.remove(&cookie) {
                // moved out of the watched tree
                if !self.excluded(&m.path, m.is_dir) {
                    self.on_deleted(m.path, m.is_dir, m.deadline);
                }
            }
        }

        let mut due: Vec<(u64, PathBuf)> = self
            .entries
            .iter()
            .filter(|(_, e)| e.deadline <= now)
            .map(|(k, e)| (e.seq, k.clone()))
            .collect();
        due.sort();
        for (_, key) in due {
            self.emit(&key);
        }
        self.ready.drain(..).collect()
    }

    fn excluded(&self, path: &Path, is_dir: bool) -> bool {
        self.matcher.excluded(path, is_dir)
    }

    fn slot(&self, key: &Path) -> Option<&Slot> {
        self.entries.get(key).map(|e| &e.slot)
    }

    fn set(&mut self, key: PathBuf, slot: Slot, deadline: Instant) {
        match self.entries.get_mut(&key) {
            Some(entry) => {
                entry.slot = slot;
                entry.deadline = entry.deadline.max(deadline);
            }
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.entries.insert(key, Entry { slot, deadline, seq });
            }
        }
    }

    /// Move an entry to the ready queue, after everything it depends on:
    /// pending work on ancestor directories, and renames out of this path.
    fn emit(&mut self, key: &Path) {
        let Some(entry) = self.entries.remove(key) else {
            return;
        };
        for ancestor in ancestors_of(key) {
            if matches!(self.slot(&ancestor), Some(s) if !matches!(s, Slot::Delete { .. })) {
                self.emit(&ancestor);
            }
        }
        let mut renames_out: Vec<(u64, PathBuf)> = self
            .entries
            .iter()
            .filter(|(_, e)| match &e.slot {
                Slot::Rename { from, .. } => {
                    from == key || is_beneath(from, key) || is_beneath(key, from)
                }
                _ => false,
            })
            .map(|(k, e)| (e.seq, k.clone()))
            .collect();
        renames_out.sort();
        for (_, dep) in renames_out {
            self.emit(&dep);
        }
        self.ready.push_back(entry.slot.into_action(key.to_path_buf()));
    }

    /// Emit a pending delete immediately so something new can take the path.
    fn flush_delete(&mut self, key: &Path) {
        if matches!(self.slot(key), Some(Slot::Delete { .. })) {
            self.emit(key);
        }
    }

    /// The remote still holds `path` but nothing local corresponds to it any more.
    fn ensure_delete(&mut self, path: PathBuf, is_dir: bool, deadline: Instant) {
        if !self.entries.contains_key(&path) {
            self.set(path, Slot::Delete { is_dir }, deadline);
        }
    }

    fn on_created(&mut self, key: PathBuf, is_dir: bool, deadline: Instant) {
        let slot = match self.slot(&key).cloned() {
            None | Some(Slot::Created { .. }) => Slot::Created { is_dir },
            Some(Slot::Upload { .. }) => Slot::Upload { is_dir },
            Some(Slot::Delete { is_dir: was_dir }) => {
                if was_dir || is_dir {
                    self.flush_delete(&key);
                    Slot::Created { is_dir }
                } else {
                    Slot::Upload { is_dir: false }
                }
            }
            Some(Slot::Rename { from, is_dir: was_dir }) => {
                self.ensure_delete(from, was_dir, deadline);
                Slot::Upload { is_dir }
            }
        };
        self.set(key, slot, deadline);
    }

    fn on_modified(&mut self, key: PathBuf, deadline: Instant) {
        let slot = match self.slot(&key).cloned() {
            None => Slot::Upload { is_dir: false },
            Some(s @ (Slot::Created { .. } | Slot::Upload { .. })) => s,
            Some(Slot::Delete { is_dir: was_dir }) => {
                if was_dir {
                    self.flush_delete(&key);
                }
                Slot::Upload { is_dir: false }
            }
            Some(Slot::Rename { from, is_dir }) => {
                self.ensure_delete(from, is_dir, deadline);
                Slot::Upload { is_dir: false }
            }
        };
        self.set(key, slot, deadline);
    }

    fn on_deleted(&mut self, key: PathBuf, is_dir: bool, deadline: Instant) {
        // a move out of the tree cannot tell a directory from a file
        let is_dir = is_dir || self.entries.keys().any(|k| is_beneath(k, &key));
        if is_dir {
            self.discard_beneath(&key, deadline);
        }
        match self.slot(&key).cloned() {
            Some(Slot::Created { .. }) => {
                self.entries.remove(&key);
            }
            Some(Slot::Rename { from, is_dir: was_dir }) => {
                self.ensure_delete(from, was_dir, deadline);
                self.set(key, Slot::Delete { is_dir }, deadline);
            }
            _ => self.set(key, Slot::Delete { is_dir }, deadline),
        }
    }

    /// Something entered the tree from outside (or from an excluded path).
    fn on_moved_in(&mut self, key: PathBuf, is_dir: bool, deadline: Instant) {
        let slot = match self.slot(&key).cloned() {
            Some(Slot::Created { .. }) if !is_dir => Slot::Created { is_dir: false },
            Some(Slot::Delete { is_dir: was_dir }) => {
                if was_dir || is_dir {
                    self.flush_delete(&key);
                }
                Slot::Upload { is_dir }
            }
            Some(Slot::Rename { from, is_dir: was_dir }) => {
                self.ensure_delete(from, was_dir, deadline);
                Slot::Upload { is_dir }
            }
            _ => Slot::Upload { is_dir },
        };
        self.set(key, slot, deadline);
    }

    fn on_move_pair(&mut self, from: PathBuf, to: PathBuf, is_dir: bool, deadline: Instant) {
        match (self.excluded(&from, is_dir), self.excluded(&to, is_dir)) {
            (true, true) => {}
            (false, true) => self.on_deleted(from, is_dir, deadline),
            (true, false) => self.on_moved_in(to, is_dir, deadline),
            (false, false) => self.on_rename(from, to, is_dir, deadline),
        }
    }

    fn on_rename(&mut self, from: PathBuf, to: PathBuf, is_dir: bool, deadline: Instant) {
        if from == to {
            return;
        }
        let prior = self.entries.remove(&from).map(|e| e.slot);
        // whatever was pending at the destination is overwritten
        if let Some(Slot::Rename { from: older, is_dir: was_dir }) = self.slot(&to).cloned() {
            if older != from {
                self.ensure_delete(older, was_dir, deadline);
            }
        }
        if is_dir {
            self.rebase_beneath(&from, &to);
        }
        let slot = match prior {
            None | Some(Slot::Delete { .. }) => Some(Slot::Rename { from, is_dir }),
            Some(Slot::Created { is_dir: d }) => Some(Slot::Created { is_dir: d }),
            Some(Slot::Upload { is_dir: d }) => {
                self.set(from, Slot::Delete { is_dir }, deadline);
                Some(Slot::Upload { is_dir: d })
            }
            Some(Slot::Rename { from: origin, is_dir: d }) => {
                if origin == to {
                    // moved back where it started
                    None
                } else {
                    Some(Slot::Rename { from: origin, is_dir: d })
                }
            }
        };
        match slot {
            Some(slot) => self.set(to, slot, deadline),
            None => {
                self.entries.remove(&to);
            }
        }
    }

    /// Drop everything pending beneath a deleted directory.
    fn discard_beneath(&mut self, dir: &Path, deadline: Instant) {
        let doomed: Vec<PathBuf> = self
            .entries
            .keys()
            .filter(|k| is_beneath(k, dir))
            .cloned()
            .collect();
        for key in doomed {
            if let Some(entry) = self.entries.remove(&key) {
                if let Slot::Rename { from, is_dir } = entry.slot {
                    if !is_beneath(&from, dir) {
                        self.ensure_delete(from, is_dir, deadline);
                    }
                }
            }
        }
    }

    /// Re-key pending work beneath a renamed directory to its new location.
    fn rebase_beneath(&mut self, from: &Path, to: &Path) {
        let moved: Vec<PathBuf> = self
            .entries
            .keys()
            .filter(|k| is_beneath(k, from))
            .cloned()
            .collect();
        for key in moved {
            if let Some(mut entry) = self.entries.remove(&key) {
                if let Slot::Rename { from: src, .. } = &mut entry.slot {
                    if is_beneath(src, from) {
                        *src = rebase(src, from, to);
                    }
                }
                self.entries.insert(rebase(&key, from, to), entry);
            }
        }
    }
}
