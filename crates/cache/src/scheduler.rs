//! Background reclamation loop
//!
//! The scheduler owns one tokio task that runs
//! [`ReclaimManager::reclaim_if_needed`] and then sleeps for the configured
//! interval. Each pass runs on the blocking pool and is awaited before the
//! stop signal is looked at, so a pass is never abandoned halfway.

use crate::config::ReclaimInterval;
use crate::reclaim::ReclaimManager;
use crate::{Error, Result};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Whether the reclamation loop is active
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// No loop running
    Stopped,
    /// Loop executing
    Running,
}

#[derive(Debug)]
struct Worker {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

/// Periodically reclaims cache space in the background
#[derive(Debug)]
pub struct ReclaimScheduler {
    manager: Arc<ReclaimManager>,
    interval: ReclaimInterval,
    worker: Option<Worker>,
}

impl ReclaimScheduler {
    /// Create a stopped scheduler
    #[must_use]
    pub fn new(manager: Arc<ReclaimManager>, interval: ReclaimInterval) -> Self {
        Self {
            manager,
            interval,
            worker: None,
        }
    }

    /// Manager driven by this scheduler
    #[must_use]
    pub fn manager(&self) -> &Arc<ReclaimManager> {
        &self.manager
    }

    /// Sleep between passes
    #[must_use]
    pub const fn interval(&self) -> ReclaimInterval {
        self.interval
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SchedulerState {
        match &self.worker {
            Some(worker) if !worker.handle.is_finished() => SchedulerState::Running,
            _ => SchedulerState::Stopped,
        }
    }

    /// Spawn the reclamation loop on the current tokio runtime
    ///
    /// Fails when called outside a runtime or while already running.
    pub fn start(&mut self) -> Result<()> {
        if self.state() == SchedulerState::Running {
            return Err(Error::scheduler("reclaim scheduler is already running"));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::scheduler(format!("no tokio runtime available: {e}")))?;

        let shutdown = CancellationToken::new();
        let handle = runtime.spawn(run_loop(
            Arc::clone(&self.manager),
            self.interval,
            shutdown.clone(),
        ));
        self.worker = Some(Worker { shutdown, handle });
        Ok(())
    }

    /// Signal the loop to exit and wait for it to finish
    ///
    /// A pass in progress completes first. Stopping a stopped scheduler
    /// does nothing.
    pub async fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        worker.shutdown.cancel();
        if let Err(e) = worker.handle.await {
            tracing::warn!(error = %e, "Reclaim scheduler task ended abnormally");
        }
    }
}

impl Drop for ReclaimScheduler {
    fn drop(&mut self) {
        if let Some(worker) = &self.worker {
            worker.shutdown.cancel();
        }
    }
}

async fn run_loop(
    manager: Arc<ReclaimManager>,
    interval: ReclaimInterval,
    shutdown: CancellationToken,
) {
    tracing::info!(
        interval_ms = interval.as_duration().as_millis(),
        quota_kb = manager.quota_kb(),
        "Reclaim scheduler started"
    );

    loop {
        let pass = Arc::clone(&manager);
        match tokio::task::spawn_blocking(move || pass.reclaim_if_needed()).await {
            Ok(_) => {}
            Err(e) if e.is_cancelled() => break,
            Err(e) => {
                tracing::warn!(error = %e, "Reclaim pass panicked");
            }
        }

        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            () = tokio::time::sleep(interval.as_duration()) => {}
        }
    }

    tracing::info!(
        passes = manager.reclaim_passes(),
        checks = manager.reclaim_checks(),
        "Reclaim scheduler stopped"
    );
}
