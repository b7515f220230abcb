//! Core library for treesync: one-way, real-time mirroring of local
//! directory trees to remote trees.
//!
//! Transports plug in through [`RemoteConnector`] / [`RemoteClient`].

mod apply;
mod backoff;
mod coalesce;
mod config;
mod error;
mod event;
mod filter;
mod queue;
mod reconcile;
mod remote;
mod supervisor;
mod utils;
mod watch;
mod worker;

#[cfg(test)]
mod testing;

pub use apply::{Applied, SyncContext};
pub use backoff::Backoff;
pub use coalesce::EventCoalescer;
pub use config::{expand_home, ConnectionCfg, InitialSyncCfg, Pattern, SyncPairConfig};
pub use error::{ConfigError, ReconcileError, RemoteError, WatchError};
pub use event::{ActionKind, PendingAction, RawEvent, RawEventKind};
pub use filter::{PathMatcher, SOURCE_CODE_DENY_LIST};
pub use queue::ActionQueue;
pub use reconcile::{plan, EntryMeta, Plan, ReconcileReport, Reconciler, TreeSnapshot};
pub use remote::{RemoteClient, RemoteConnector, RemoteEntry};
pub use supervisor::{ShutdownReport, SyncSupervisor};
pub use utils::remote_path;
pub use watch::{WatchFeed, WatchItem, WatchSession};
pub use worker::{
    spawn_worker, spawn_worker_with_session, Connectivity, FailedAction, RemoteSessionState,
    SyncWorkerHandle, WorkerState, WorkerStatus,
};
