//! Process signal handling for the daemon.

use std::time::Duration;

use tokio::signal;
use tracing::{error, info};

use crate::core::coordinator::Coordinator;

/// Resolves on SIGINT (Ctrl+C) or, on unix, SIGTERM.
pub async fn wait_for_signal() -> Result<(), anyhow::Error> {
    #[cfg(unix)]
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    #[cfg(unix)]
    let terminate = terminate.recv();

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Option<()>>();

    tokio::select! {
        res = signal::ctrl_c() => {
            res?;
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
    Ok(())
}

/// Shuts the coordinator down, giving up after `timeout`.
pub async fn shutdown_coordinator(coordinator: &Coordinator, timeout: Duration) {
    info!("Initiating shutdown...");
    match tokio::time::timeout(timeout, coordinator.shutdown()).await {
        Ok(()) => info!("Shutdown completed"),
        Err(_) => error!(timeout_ms = timeout.as_millis() as u64, "Shutdown timed out"),
    }
}
