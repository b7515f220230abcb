use crate::event::{ActionKind, PendingAction};
use crate::utils::is_beneath;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

/// Ordered queue of undelivered actions.
///
/// A newer action for a path replaces the queued one, with two exceptions
/// that keep the remote consistent with the local tree:
///
/// - A queued delete is never replaced by a later upload or mkdir of the
///   same path. The delete stays and the new action is queued behind it,
///   so stale remote contents of a replaced directory are cleared first.
/// - A delete drops queued work at and beneath its path and goes to the back.
///
/// Every non-delete action is inserted after any queued action on one of its
/// ancestors and ahead of queued actions beneath it, so a directory is always
/// created before anything inside it.
///
/// Renames depend on what the remote holds at the source: if work on the
/// source is still queued, the remote source is stale and the rename degrades
/// to `delete(source) + upload(destination)`.
#[derive(Debug, Default)]
pub struct ActionQueue {
    items: VecDeque<PendingAction>,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn front(&self) -> Option<&PendingAction> {
        self.items.front()
    }

    pub fn pop_front(&mut self) -> Option<PendingAction> {
        self.items.pop_front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingAction> {
        self.items.iter()
    }

    pub fn push(&mut self, action: PendingAction) {
        match &action.kind {
            ActionKind::Delete => self.push_delete(action),
            ActionKind::Rename { to } => {
                let to = to.clone();
                if let Some(stale) = self.take(&action.path, |_| true) {
                    match stale.kind {
                        // a queued rename into the source folds into one rename
                        ActionKind::Rename { .. } => {
                            self.push(PendingAction::rename(stale.path, to));
                        }
                        _ => {
                            self.push(PendingAction::delete(action.path));
                            self.push(PendingAction::upload(to));
                        }
                    }
                    return;
                }
                self.supersede(&to);
                self.insert_ordered(action);
            }
            ActionKind::Upload | ActionKind::Mkdir => {
                self.supersede(action.target());
                self.insert_ordered(action);
            }
        }
    }

    fn push_delete(&mut self, action: PendingAction) {
        let dir = action.path.clone();
        let mut orphaned: Vec<PathBuf> = Vec::new();
        self.items.retain(|a| {
            let target = a.target();
            if target != dir.as_path() && !is_beneath(target, &dir) {
                return true;
            }
            // a rename into the doomed path still left its source on the remote
            if let ActionKind::Rename { .. } = a.kind {
                if a.path != dir && !is_beneath(&a.path, &dir) {
                    orphaned.push(a.path.clone());
                }
            }
            false
        });
        for source in orphaned {
            self.push_delete(PendingAction::delete(source));
        }
        self.items.push_back(action);
    }

    /// Remove the queued non-delete action for `target`. An overwritten
    /// rename still left its source on the remote.
    fn supersede(&mut self, target: &Path) {
        let replaced = self.take(target, |a| !matches!(a.kind, ActionKind::Delete));
        if let Some(PendingAction { path, kind: ActionKind::Rename { .. } }) = replaced {
            self.push_delete(PendingAction::delete(path));
        }
    }

    fn insert_ordered(&mut self, action: PendingAction) {
        let target = action.target().to_path_buf();
        let after = self
            .items
            .iter()
            .rposition(|a| {
                let t = a.target();
                is_beneath(&target, t) || (t == target.as_path() && matches!(a.kind, ActionKind::Delete))
            })
            .map_or(0, |i| i + 1);
        let at = (after..self.items.len())
            .find(|&i| is_beneath(self.items[i].target(), &target))
            .unwrap_or(self.items.len());
        self.items.insert(at, action);
    }

    fn take(&mut self, target: &Path, pred: impl Fn(&PendingAction) -> bool) -> Option<PendingAction> {
        let pos = self
            .items
            .iter()
            .position(|a| a.target() == target && pred(a))?;
        self.items.remove(pos)
    }
}
