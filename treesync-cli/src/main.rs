mod load;

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use treesync_core::SyncSupervisor;
use treesync_remote_sftp::SftpConnector;

#[derive(Parser)]
#[command(name = "treesync", version, about = "treesync - real-time one-way directory mirroring over SFTP")]
struct Cli {
    /// Path to config file (JSON, or YAML for any other extension)
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Seconds to wait for workers to stop before aborting them
    #[arg(long, default_value_t = 10)]
    shutdown_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let pairs = load::load_pairs(&cli.config)?;

    let mut supervisor = SyncSupervisor::new(Arc::new(SftpConnector));
    let skipped = supervisor.start(pairs);
    if supervisor.is_empty() {
        return Err(anyhow!(
            "no runnable sync pairs in {} ({} rejected)",
            cli.config.display(),
            skipped.len()
        ));
    }
    info!(pairs = supervisor.len(), rejected = skipped.len(), "treesync running, press Ctrl+C to stop");

    wait_for_signal().await?;
    info!("stopping");
    let report = supervisor
        .shutdown(Duration::from_secs(cli.shutdown_timeout))
        .await;
    if !report.forced.is_empty() {
        warn!(pairs = ?report.forced, "aborted after shutdown timeout");
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res?,
        _ = term.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
