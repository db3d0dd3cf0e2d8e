//! Health Snapshot (C9): a pure, read-only view of process health for
//! whatever peripheral surface wants to report it (spec.md §1: the HTTP
//! surface itself is out of scope, but the state it would read from is
//! not).

use std::sync::Arc;

use bollard::Docker;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::scheduler::Scheduler;

/// A point-in-time read of process health. Nothing here mutates state.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub docker_reachable: bool,
    pub scheduler_running: bool,
    pub job_count: usize,
    pub disabled_job_count: usize,
    pub last_reconcile_at: Option<DateTime<Utc>>,
    pub last_reconcile_ok: Option<bool>,
}

pub struct HealthMonitor {
    docker: Arc<Docker>,
    scheduler: Scheduler,
    last_reconcile: RwLock<Option<(DateTime<Utc>, bool)>>,
}

impl HealthMonitor {
    pub fn new(docker: Arc<Docker>, scheduler: Scheduler) -> Self {
        Self {
            docker,
            scheduler,
            last_reconcile: RwLock::new(None),
        }
    }

    /// Record the outcome of a just-completed reconcile pass, for
    /// `snapshot()` to report.
    pub async fn record_reconcile(&self, ok: bool) {
        *self.last_reconcile.write().await = Some((Utc::now(), ok));
    }

    pub async fn snapshot(&self) -> HealthSnapshot {
        let docker_reachable = self.docker.ping().await.is_ok();
        let jobs = self.scheduler.jobs().await;
        let disabled = self.scheduler.disabled_jobs().await;
        let last_reconcile = *self.last_reconcile.read().await;

        HealthSnapshot {
            docker_reachable,
            scheduler_running: self.scheduler.is_running(),
            job_count: jobs.len(),
            disabled_job_count: disabled.len(),
            last_reconcile_at: last_reconcile.map(|(at, _)| at),
            last_reconcile_ok: last_reconcile.map(|(_, ok)| ok),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn snapshot_reports_reconcile_state() {
        let docker = Arc::new(Docker::connect_with_local_defaults().expect("docker handle"));
        let scheduler = Scheduler::new(docker.clone(), Duration::from_secs(1));
        let monitor = HealthMonitor::new(docker, scheduler);

        let before = monitor.snapshot().await;
        assert!(before.last_reconcile_at.is_none());

        monitor.record_reconcile(true).await;
        let after = monitor.snapshot().await;
        assert_eq!(after.last_reconcile_ok, Some(true));
    }
}
