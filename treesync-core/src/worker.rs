//! One running sync pair.
//!
//! A worker is two tasks. The ingestion task owns the [`WatchSession`] and
//! the [`EventCoalescer`] and forwards settled actions. The apply task owns
//! the remote session, the [`ActionQueue`] and every state transition.
//! Actions stay at the head of the queue until the remote confirms them, so
//! a dropped session replays exactly the work that was not acknowledged.

use crate::apply::{Applied, SyncContext};
use crate::backoff::Backoff;
use crate::coalesce::EventCoalescer;
use crate::config::SyncPairConfig;
use crate::error::ConfigError;
use crate::event::PendingAction;
use crate::filter::PathMatcher;
use crate::queue::ActionQueue;
use crate::reconcile::Reconciler;
use crate::remote::{RemoteClient, RemoteConnector};
use crate::watch::{WatchItem, WatchSession};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};

/// Time an in-flight remote operation gets to finish once stop is requested.
const STOP_GRACE: Duration = Duration::from_secs(5);
/// Pause before retrying an action that failed on a healthy session.
const RETRY_DELAY: Duration = Duration::from_millis(500);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Reconciling,
    Watching,
    Degraded,
    Reconnecting,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
}

#[derive(Debug, Clone)]
pub struct RemoteSessionState {
    pub status: Connectivity,
    pub last_error: Option<String>,
    /// Failed connection attempts since the last successful one.
    pub retry_count: u32,
}

/// An action given up on after too many consecutive failures.
#[derive(Debug, Clone)]
pub struct FailedAction {
    pub action: PendingAction,
    pub error: String,
    pub attempts: u32,
}

/// Snapshot published by a worker on every transition.
#[derive(Debug, Clone)]
pub struct WorkerStatus {
    pub state: WorkerState,
    pub session: RemoteSessionState,
    pub queued: usize,
    pub applied: u64,
    pub reconnects: u64,
    pub failed: Vec<FailedAction>,
}

impl WorkerStatus {
    fn new() -> Self {
        Self {
            state: WorkerState::Idle,
            session: RemoteSessionState {
                status: Connectivity::Disconnected,
                last_error: None,
                retry_count: 0,
            },
            queued: 0,
            applied: 0,
            reconnects: 0,
            failed: Vec::new(),
        }
    }
}

#[derive(Debug)]
enum WorkItem {
    Action(PendingAction),
    Rescan(PathBuf),
}

enum Pass {
    Done,
    Interrupted,
    Stopped,
}

/// Handle to a spawned worker.
#[derive(Debug)]
pub struct SyncWorkerHandle {
    name: String,
    stop_tx: watch::Sender<bool>,
    status_rx: watch::Receiver<WorkerStatus>,
    join: JoinHandle<()>,
}

impl SyncWorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> WorkerStatus {
        self.status_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerStatus> {
        self.status_rx.clone()
    }

    /// Ask the worker to stop. Returns immediately.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Stop and wait up to `grace`; the task is aborted past that.
    /// Returns whether it stopped on its own.
    pub async fn shutdown(mut self, grace: Duration) -> bool {
        self.stop();
        match timeout(grace, &mut self.join).await {
            Ok(_) => true,
            Err(_) => {
                warn!(pair = %self.name, "worker did not stop in time, aborting");
                self.join.abort();
                false
            }
        }
    }
}

/// Spawn a worker for a validated pair. The watch session is opened by the
/// worker itself before the initial reconciliation.
pub fn spawn_worker(
    cfg: SyncPairConfig,
    connector: Arc<dyn RemoteConnector>,
) -> Result<SyncWorkerHandle, ConfigError> {
    spawn_inner(cfg, connector, None)
}

/// Like [`spawn_worker`], fed by an already opened (or detached) session.
pub fn spawn_worker_with_session(
    cfg: SyncPairConfig,
    connector: Arc<dyn RemoteConnector>,
    session: WatchSession,
) -> Result<SyncWorkerHandle, ConfigError> {
    spawn_inner(cfg, connector, Some(session))
}

fn spawn_inner(
    cfg: SyncPairConfig,
    connector: Arc<dyn RemoteConnector>,
    session: Option<WatchSession>,
) -> Result<SyncWorkerHandle, ConfigError> {
    let matcher = Arc::new(PathMatcher::from_config(&cfg)?);
    let ctx = Arc::new(SyncContext {
        pair: cfg.name.clone(),
        local_root: cfg.local_root.clone(),
        remote_root: cfg.remote_root.clone(),
        matcher,
    });
    let (stop_tx, stop_rx) = watch::channel(false);
    let (status_tx, status_rx) = watch::channel(WorkerStatus::new());
    let name = cfg.name.clone();
    let worker = SyncWorker {
        cfg,
        ctx,
        connector,
        status: status_tx,
        stop: stop_rx,
        client: None,
        queue: ActionQueue::new(),
        failures: HashMap::new(),
    };
    let join = tokio::spawn(worker.run(session));
    Ok(SyncWorkerHandle {
        name,
        stop_tx,
        status_rx,
        join,
    })
}

/// Resolves once stop has been requested (or the handle is gone).
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|s| *s).await;
}

struct SyncWorker {
    cfg: SyncPairConfig,
    ctx: Arc<SyncContext>,
    connector: Arc<dyn RemoteConnector>,
    status: watch::Sender<WorkerStatus>,
    stop: watch::Receiver<bool>,
    client: Option<Box<dyn RemoteClient>>,
    queue: ActionQueue,
    failures: HashMap<PathBuf, u32>,
}

impl SyncWorker {
    async fn run(mut self, session: Option<WatchSession>) {
        info!(
            pair = %self.ctx.pair,
            local = %self.cfg.local_root.display(),
            remote = %self.cfg.remote_root,
            "worker starting"
        );
        let session = match session {
            Some(s) => Some(s),
            None => self.open_watch().await,
        };
        if let Some(session) = session {
            let (work_tx, work_rx) = mpsc::unbounded_channel();
            let coalescer = EventCoalescer::new(self.ctx.matcher.clone(), self.cfg.debounce());
            let ingest = tokio::spawn(ingest(
                self.ctx.pair.clone(),
                session,
                coalescer,
                work_tx,
                self.stop.clone(),
            ));

            self.apply_loop(work_rx).await;

            // ingestion watches the same stop signal
            if timeout(STOP_GRACE, ingest).await.is_err() {
                warn!(pair = %self.ctx.pair, "ingestion task did not finish in time");
            }
        }
        self.close_client().await;
        if !self.queue.is_empty() {
            info!(pair = %self.ctx.pair, discarded = self.queue.len(), "undelivered actions dropped at stop");
        }
        self.set_state(WorkerState::Stopped);
        self.update(|s| s.session.status = Connectivity::Disconnected);
        info!(pair = %self.ctx.pair, "worker stopped");
    }

    /// The local root may be briefly unavailable (unmounted, being recreated),
    /// so opening is retried with the reconnect backoff.
    async fn open_watch(&mut self) -> Option<WatchSession> {
        let mut backoff = self.backoff();
        loop {
            match WatchSession::open(&self.cfg.local_root, self.cfg.poll_interval()) {
                Ok(s) => return Some(s),
                Err(e) => error!(pair = %self.ctx.pair, error = %e, "cannot watch local root"),
            }
            if self.sleep_or_stop(backoff.next_delay()).await {
                return None;
            }
        }
    }

    async fn apply_loop(&mut self, mut work_rx: mpsc::UnboundedReceiver<WorkItem>) {
        let mut need_full = self.cfg.initial_sync.enabled;
        let mut rescans: Vec<PathBuf> = Vec::new();
        let mut intake_open = true;
        let mut retry_at: Option<Instant> = None;

        loop {
            if *self.stop.borrow() {
                break;
            }
            while let Ok(item) = work_rx.try_recv() {
                self.accept(item, &mut rescans);
            }

            if self.client.is_none() && !self.connect().await {
                break;
            }

            if need_full || !rescans.is_empty() {
                let subtree = if need_full { PathBuf::new() } else { rescans.remove(0) };
                match self.reconcile(&subtree).await {
                    Pass::Done => need_full = false,
                    Pass::Interrupted => {
                        if !need_full {
                            rescans.insert(0, subtree);
                        }
                    }
                    Pass::Stopped => break,
                }
                continue;
            }
            self.set_state(WorkerState::Watching);

            let Some(action) = self.queue.front().cloned() else {
                tokio::select! {
                    item = work_rx.recv(), if intake_open => match item {
                        Some(item) => self.accept(item, &mut rescans),
                        None => intake_open = false,
                    },
                    _ = stop_requested(&mut self.stop) => break,
                }
                continue;
            };

            if let Some(at) = retry_at {
                tokio::select! {
                    _ = sleep_until(at) => retry_at = None,
                    item = work_rx.recv(), if intake_open => match item {
                        Some(item) => self.accept(item, &mut rescans),
                        None => intake_open = false,
                    },
                    _ = stop_requested(&mut self.stop) => break,
                }
                continue;
            }

            match self.apply_head(&action).await {
                Some(true) => {}
                Some(false) => retry_at = Some(Instant::now() + RETRY_DELAY),
                None => break,
            }
        }
    }

    fn accept(&mut self, item: WorkItem, rescans: &mut Vec<PathBuf>) {
        match item {
            WorkItem::Action(action) => {
                self.failures.remove(action.target());
                self.queue.push(action);
            }
            WorkItem::Rescan(subtree) => {
                if !rescans.iter().any(|r| subtree.starts_with(r)) {
                    rescans.retain(|r| !r.starts_with(&subtree));
                    rescans.push(subtree);
                }
            }
        }
        let queued = self.queue.len();
        self.update(|s| s.queued = queued);
    }

    /// Apply the action at the head of the queue.
    ///
    /// `Some(true)` when the head was consumed (applied or given up on) or
    /// the session dropped, `Some(false)` when it should be retried after a
    /// pause, `None` when the worker is stopping.
    async fn apply_head(&mut self, action: &PendingAction) -> Option<bool> {
        let result = {
            let client = self.client.as_deref()?;
            let fut = self.ctx.apply(client, action);
            tokio::pin!(fut);
            tokio::select! {
                r = &mut fut => r,
                _ = stop_requested(&mut self.stop) => match timeout(STOP_GRACE, &mut fut).await {
                    Ok(r) => r,
                    Err(_) => {
                        warn!(pair = %self.ctx.pair, %action, "in-flight action abandoned at stop");
                        return None;
                    }
                },
            }
        };

        match result {
            Ok(applied) => {
                self.queue.pop_front();
                self.failures.remove(action.target());
                match applied {
                    Applied::Done => debug!(pair = %self.ctx.pair, %action, "applied"),
                    Applied::Skipped => debug!(pair = %self.ctx.pair, %action, "nothing to apply"),
                }
                let queued = self.queue.len();
                self.update(|s| {
                    s.applied += 1;
                    s.queued = queued;
                });
                Some(true)
            }
            Err(e) if e.is_connection() => {
                // the head stays queued and is replayed after reconnect
                self.degrade(e.to_string()).await;
                Some(true)
            }
            Err(e) => {
                let attempts = {
                    let n = self.failures.entry(action.target().to_path_buf()).or_insert(0);
                    *n += 1;
                    *n
                };
                if attempts < self.cfg.max_path_failures {
                    warn!(pair = %self.ctx.pair, %action, attempts, error = %e, "action failed, will retry");
                    return Some(false);
                }
                error!(pair = %self.ctx.pair, %action, attempts, error = %e, "action failed permanently, dropping");
                self.queue.pop_front();
                self.failures.remove(action.target());
                let failed = FailedAction {
                    action: action.clone(),
                    error: e.to_string(),
                    attempts,
                };
                let queued = self.queue.len();
                self.update(|s| {
                    s.failed.push(failed);
                    s.queued = queued;
                });
                Some(true)
            }
        }
    }

    async fn reconcile(&mut self, subtree: &Path) -> Pass {
        self.set_state(WorkerState::Reconciling);
        let reconciler = Reconciler::new(self.ctx.clone(), self.cfg.initial_sync.delete_extraneous);
        let report = {
            let Some(client) = self.client.as_deref() else {
                return Pass::Interrupted;
            };
            let fut = reconciler.reconcile(client, subtree);
            tokio::pin!(fut);
            tokio::select! {
                r = &mut fut => r,
                _ = stop_requested(&mut self.stop) => match timeout(STOP_GRACE, &mut fut).await {
                    Ok(r) => r,
                    Err(_) => return Pass::Stopped,
                },
            }
        };
        if report.interrupted {
            let reason = report
                .failures
                .last()
                .map(|f| f.to_string())
                .unwrap_or_else(|| "session lost during reconcile".to_string());
            self.degrade(reason).await;
            return Pass::Interrupted;
        }
        for failure in &report.failures {
            warn!(pair = %self.ctx.pair, error = %failure, "path left unsynchronised");
        }
        Pass::Done
    }

    /// Connect, retrying with backoff. `false` if stopped first.
    async fn connect(&mut self) -> bool {
        let reconnecting = self.status.borrow().state == WorkerState::Degraded;
        if reconnecting {
            self.set_state(WorkerState::Reconnecting);
        }
        let mut backoff = self.backoff();
        loop {
            self.update(|s| s.session.status = Connectivity::Connecting);
            let attempt = tokio::select! {
                r = self.connector.connect(&self.cfg.connection) => r,
                _ = stop_requested(&mut self.stop) => return false,
            };
            match attempt {
                Ok(client) => {
                    self.client = Some(client);
                    info!(
                        pair = %self.ctx.pair,
                        host = %self.cfg.connection.host,
                        attempts = backoff.attempts() + 1,
                        "remote session established"
                    );
                    self.update(|s| {
                        s.session.status = Connectivity::Connected;
                        s.session.last_error = None;
                        s.session.retry_count = 0;
                        if reconnecting {
                            s.reconnects += 1;
                        }
                    });
                    return true;
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(
                        pair = %self.ctx.pair,
                        host = %self.cfg.connection.host,
                        attempt = backoff.attempts(),
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "connect failed"
                    );
                    let retries = backoff.attempts();
                    self.update(|s| {
                        s.session.status = Connectivity::Disconnected;
                        s.session.last_error = Some(e.to_string());
                        s.session.retry_count = retries;
                    });
                    if self.sleep_or_stop(delay).await {
                        return false;
                    }
                }
            }
        }
    }

    async fn degrade(&mut self, reason: String) {
        warn!(pair = %self.ctx.pair, error = %reason, queued = self.queue.len(), "remote session lost");
        self.set_state(WorkerState::Degraded);
        self.update(|s| {
            s.session.status = Connectivity::Degraded;
            s.session.last_error = Some(reason);
        });
        self.close_client().await;
    }

    async fn close_client(&mut self) {
        if let Some(client) = self.client.take() {
            match timeout(CLOSE_TIMEOUT, client.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(pair = %self.ctx.pair, error = %e, "close failed"),
                Err(_) => debug!(pair = %self.ctx.pair, "close timed out"),
            }
        }
    }

    /// `true` when stop was requested before `delay` elapsed.
    async fn sleep_or_stop(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => *self.stop.borrow(),
            _ = stop_requested(&mut self.stop) => true,
        }
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.cfg.reconnect_initial_ms),
            Duration::from_millis(self.cfg.reconnect_max_ms),
        )
    }

    fn set_state(&self, next: WorkerState) {
        let mut prev = None;
        self.status.send_if_modified(|s| {
            if s.state == next {
                return false;
            }
            prev = Some(s.state);
            s.state = next;
            true
        });
        if let Some(prev) = prev {
            info!(pair = %self.ctx.pair, from = ?prev, to = ?next, "state change");
        }
    }

    fn update(&self, f: impl FnOnce(&mut WorkerStatus)) {
        self.status.send_modify(f);
    }
}

async fn ingest(
    pair: String,
    mut session: WatchSession,
    mut coalescer: EventCoalescer,
    work_tx: mpsc::UnboundedSender<WorkItem>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let deadline = coalescer.next_deadline();
        tokio::select! {
            _ = stop_requested(&mut stop) => break,
            batch = session.next_events() => match batch {
                Some(items) => {
                    for item in items {
                        match item {
                            WatchItem::Event(ev) => coalescer.push(ev),
                            WatchItem::RescanRequired(subtree) => {
                                warn!(pair = %pair, subtree = %subtree.display(), "events lost, rescan scheduled");
                                coalescer.request_rescan(subtree);
                            }
                        }
                    }
                }
                None => {
                    warn!(pair = %pair, "notification source closed");
                    break;
                }
            },
            _ = async { if let Some(at) = deadline { sleep_until(at).await } }, if deadline.is_some() => {}
        }

        for subtree in coalescer.take_rescans() {
            if work_tx.send(WorkItem::Rescan(subtree)).is_err() {
                return;
            }
        }
        for action in coalescer.drain_expired(Instant::now()) {
            debug!(pair = %pair, %action, "action settled");
            if work_tx.send(WorkItem::Action(action)).is_err() {
                return;
            }
        }
    }
    if coalescer.pending() > 0 {
        debug!(pair = %pair, pending = coalescer.pending(), "unsettled events dropped at stop");
    }
    session.close();
}
