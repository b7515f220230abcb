use crate::config::SyncPairConfig;
use crate::error::ConfigError;
use crate::remote::RemoteConnector;
use crate::worker::{spawn_worker, SyncWorkerHandle, WorkerStatus};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// How the workers went down.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub stopped: Vec<String>,
    /// Workers that were aborted after the timeout.
    pub forced: Vec<String>,
}

/// Owns one worker per enabled pair. A pair that fails to start never
/// affects the others.
pub struct SyncSupervisor {
    connector: Arc<dyn RemoteConnector>,
    workers: HashMap<String, SyncWorkerHandle>,
}

impl SyncSupervisor {
    pub fn new(connector: Arc<dyn RemoteConnector>) -> Self {
        Self {
            connector,
            workers: HashMap::new(),
        }
    }

    /// Validate and start every enabled pair. Returns the errors of the
    /// pairs that were skipped.
    pub fn start(&mut self, pairs: Vec<SyncPairConfig>) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        for cfg in pairs {
            if !cfg.enabled {
                info!(pair = %cfg.name, "pair disabled, skipping");
                continue;
            }
            if let Err(e) = self.start_pair(cfg) {
                warn!(error = %e, "pair not started");
                errors.push(e);
            }
        }
        errors
    }

    pub fn start_pair(&mut self, cfg: SyncPairConfig) -> Result<(), ConfigError> {
        let cfg = cfg.validate()?;
        if self.workers.contains_key(&cfg.name) {
            return Err(ConfigError::Invalid {
                pair: cfg.name,
                field: "name",
                reason: "another pair already uses this name".into(),
            });
        }
        let name = cfg.name.clone();
        let handle = spawn_worker(cfg, self.connector.clone())?;
        self.workers.insert(name, handle);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn status(&self, name: &str) -> Option<WorkerStatus> {
        self.workers.get(name).map(|h| h.status())
    }

    pub fn statuses(&self) -> Vec<(String, WorkerStatus)> {
        let mut out: Vec<_> = self
            .workers
            .iter()
            .map(|(name, h)| (name.clone(), h.status()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Stop every worker and wait at most `timeout` in total. Workers still
    /// running after that are aborted.
    pub async fn shutdown(self, timeout: Duration) -> ShutdownReport {
        let deadline = Instant::now() + timeout;
        for handle in self.workers.values() {
            handle.stop();
        }
        let mut report = ShutdownReport::default();
        for (name, handle) in self.workers {
            let left = deadline.saturating_duration_since(Instant::now());
            if handle.shutdown(left).await {
                report.stopped.push(name);
            } else {
                report.forced.push(name);
            }
        }
        report.stopped.sort();
        report.forced.sort();
        info!(
            stopped = report.stopped.len(),
            forced = report.forced.len(),
            "all workers down"
        );
        report
    }
}
