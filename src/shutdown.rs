//! Shutdown Manager (C8): the ordered drain sequence on SIGTERM/SIGINT
//! (spec.md §4.8).
//!
//! Grounded on the teacher's `main.rs` signal-to-broadcast-channel pattern,
//! replacing the broadcast channel with the scheduler's own
//! `CancellationToken` tree: stop admitting new fires, cancel in-flight
//! executions, wait bounded by `shutdown_timeout`, then stop discovery.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::scheduler::Scheduler;

pub struct ShutdownManager {
    scheduler: Scheduler,
    discovery_cancel: CancellationToken,
    shutdown_timeout: Duration,
}

impl ShutdownManager {
    pub fn new(scheduler: Scheduler, discovery_cancel: CancellationToken, shutdown_timeout: Duration) -> Self {
        Self {
            scheduler,
            discovery_cancel,
            shutdown_timeout,
        }
    }

    /// Block until SIGTERM or SIGINT, then run the drain sequence.
    pub async fn wait_for_signal(&self) -> anyhow::Result<()> {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }

        self.shutdown().await;
        Ok(())
    }

    /// Run the drain sequence directly, without waiting on a signal (used
    /// by tests and by any embedder driving shutdown programmatically).
    pub async fn shutdown(&self) {
        info!(timeout_secs = self.shutdown_timeout.as_secs(), "shutdown initiated");

        // `Scheduler::stop` cancels the root token (stopping new cron fires
        // and waking every in-flight execution's cancellation branch) and
        // then waits for each job's gate to clear, bounded by
        // `shutdown_timeout` per job.
        self.scheduler.stop().await;

        // Discovery only matters to a reconciler that is, by this point,
        // never going to run again; stop it last.
        self.discovery_cancel.cancel();

        info!("shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn shutdown_stops_scheduler_and_cancels_discovery() {
        let docker = Arc::new(bollard::Docker::connect_with_local_defaults().expect("docker handle"));
        let scheduler = Scheduler::new(docker, Duration::from_millis(100));
        scheduler.start();
        let discovery_cancel = CancellationToken::new();

        let manager = ShutdownManager::new(scheduler.clone(), discovery_cancel.clone(), Duration::from_millis(100));
        manager.shutdown().await;

        assert!(!scheduler.is_running());
        assert!(discovery_cancel.is_cancelled());
    }
}
