//! Run the timer service in the foreground

use anyhow::{Context, Result};
use debounce_core::DebounceConfig;
use debounce_service::{ServiceError, TimerService};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub async fn run(config: DebounceConfig) -> Result<()> {
    let socket_path = config.socket_path.clone();

    let service = match TimerService::bind(config) {
        Ok(service) => service,
        Err(ServiceError::AlreadyRunning { path, pid }) => {
            let owner = pid.map(|p| format!(" (PID {})", p)).unwrap_or_default();
            anyhow::bail!("A debounce service is already running at {}{}", path.display(), owner);
        }
        Err(e) => return Err(e).context("Failed to start debounce service"),
    };

    let shutdown = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
        trigger.cancel();
    });

    let stats = service
        .run(shutdown)
        .await
        .with_context(|| format!("Debounce service on {} failed", socket_path.display()))?;

    info!(
        "Delivered {} of {} expired timers",
        stats.fired,
        stats.fired + stats.dropped
    );
    Ok(())
}
