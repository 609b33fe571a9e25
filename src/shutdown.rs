use anyhow::Result;
use tracing::{info, warn};

use crate::merge::CancellationToken;
use crate::observability::orchestration_metrics;

/// Graceful shutdown coordinator for merge-conductor.
///
/// The first SIGINT/SIGTERM cancels the shared token. A run that has
/// not merged yet stops at its next state boundary; a run that already
/// merged finishes cleanup and verification first.
#[derive(Debug, Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token handed to every orchestration run
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn trigger(&self, reason: &str) {
        if !self.token.is_cancelled() {
            info!(reason, "Shutdown requested, cancelling active orchestrations");
        }
        self.token.cancel();
    }

    /// Install signal handlers for graceful shutdown
    pub fn install_signal_handlers(&self) -> Result<()> {
        info!("Installing signal handlers for graceful shutdown");
        let coordinator = self.clone();
        tokio::spawn(async move {
            match wait_for_signal().await {
                Ok(signal) => coordinator.trigger(signal),
                Err(e) => warn!("Failed to listen for shutdown signals: {}", e),
            }
        });
        Ok(())
    }

    /// Wait until shutdown was requested, then log final counters
    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
        orchestration_metrics().log_stats();
        info!("Graceful shutdown completed");
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            Ok("SIGINT")
        }
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl-c")
}
