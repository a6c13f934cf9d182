//! Graceful shutdown coordination for long-running commands

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Coordinates graceful shutdown across the application
#[derive(Debug, Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator
    pub fn new() -> Self {
        Self::default()
    }

    /// Trigger a shutdown
    pub fn shutdown(&self) {
        info!("Shutdown triggered");
        self.token.cancel();
    }

    /// Wait for the shutdown signal; returns at once if already triggered
    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }
}

/// Install signal handlers for graceful shutdown
///
/// Returns a `ShutdownCoordinator` that is triggered when SIGTERM or SIGINT
/// (Ctrl+C on Windows) is received.
pub fn install_signal_handlers() -> ShutdownCoordinator {
    let coordinator = ShutdownCoordinator::new();
    let coordinator_clone = coordinator.clone();

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            match (
                signal(SignalKind::terminate()),
                signal(SignalKind::interrupt()),
            ) {
                (Ok(mut sigterm), Ok(mut sigint)) => {
                    tokio::select! {
                        _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
                        _ = sigint.recv() => info!("Received SIGINT, initiating graceful shutdown"),
                    }
                }
                (Err(e), _) | (_, Err(e)) => {
                    warn!(error = %e, "Failed to install signal handlers, falling back to Ctrl+C");
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        warn!(error = %e, "Failed to wait for Ctrl+C");
                    }
                }
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to wait for Ctrl+C");
            }
            info!("Received Ctrl+C, initiating graceful shutdown");
        }

        coordinator_clone.shutdown();
    });

    coordinator
}
