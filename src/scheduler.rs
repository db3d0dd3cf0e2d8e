//! Scheduler (C4): owns the job registry, enforces overlap policy, and
//! dispatches executions through the middleware chain (spec.md §4.4).
//!
//! Grounded on the teacher's `run_loop`/`OverlapPolicy`/`Semaphore` gate in
//! `job.rs`, generalized from "one job loop spawned at startup" to an owned,
//! mutable registry supporting add/replace/remove at runtime.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bollard::Docker;
use chrono::Utc;
use tokio::sync::{mpsc, Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::history::{ExecutionRecord, HistoryRing, Outcome};
use crate::job::{ExecutionContext, JobDescriptor, JobSource, JobType};
use crate::middleware::MiddlewareChain;

/// Identity bucket key: (type, name) per spec.md §3.
pub type JobKey = (JobType, String);

pub fn job_key(job_type: JobType, name: &str) -> JobKey {
    (job_type, name.to_string())
}

struct JobEntry {
    descriptor: RwLock<JobDescriptor>,
    chain: RwLock<MiddlewareChain>,
    history: Mutex<HistoryRing>,
    /// Single-permit gate; held for the duration of an execution when
    /// `allow_parallel` is false.
    gate: Semaphore,
    /// Cancelled on `RemoveJob`/`Stop`; aborts the cron loop and is
    /// observed by in-flight executions.
    cancel: CancellationToken,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    /// Drain tracker: every in-flight execution (parallel or not, however
    /// it was spawned — cron tick, `RunJob`, or an `on_success`/`on_failure`
    /// trigger) clones `exec_tx` for its duration. `remove_job` drops the
    /// stored sender and awaits `exec_rx.recv()`, which returns `None` once
    /// every clone (i.e. every in-flight execution) has finished.
    exec_tx: Mutex<Option<mpsc::Sender<()>>>,
    exec_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

/// A point-in-time view of one job, for `Entries()`/`Jobs()`.
#[derive(Debug, Clone)]
pub struct JobSummary {
    pub job_type: JobType,
    pub name: String,
    pub source: JobSource,
    pub schedule: String,
    pub command: String,
    pub currently_running: bool,
    pub history_len: usize,
    pub last_outcome: Option<Outcome>,
}

struct SchedulerState {
    docker: Arc<Docker>,
    registry: RwLock<HashMap<JobKey, Arc<JobEntry>>>,
    /// Jobs rejected by validation, kept for `DisabledJobs()` inspection
    /// (spec.md §4.4) rather than silently dropped.
    disabled: RwLock<HashMap<JobKey, (JobDescriptor, String)>>,
    root_cancel: CancellationToken,
    shutdown_timeout: Duration,
    /// Fallback for a job whose type-specific `max_runtime` is unset
    /// (`0` = unbounded), sourced from the global `max-runtime` INI key.
    default_max_runtime: Option<Duration>,
    running: std::sync::atomic::AtomicBool,
}

/// Owns the live job set and drives every execution.
#[derive(Clone)]
pub struct Scheduler {
    state: Arc<SchedulerState>,
}

impl Scheduler {
    pub fn new(docker: Arc<Docker>, shutdown_timeout: Duration) -> Self {
        Self::with_default_max_runtime(docker, shutdown_timeout, None)
    }

    pub fn with_default_max_runtime(
        docker: Arc<Docker>,
        shutdown_timeout: Duration,
        default_max_runtime: Option<Duration>,
    ) -> Self {
        Self {
            state: Arc::new(SchedulerState {
                docker,
                registry: RwLock::new(HashMap::new()),
                disabled: RwLock::new(HashMap::new()),
                root_cancel: CancellationToken::new(),
                shutdown_timeout,
                default_max_runtime,
                running: std::sync::atomic::AtomicBool::new(false),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn start(&self) {
        self.state.running.store(true, std::sync::atomic::Ordering::Relaxed);
        info!("scheduler started");
    }

    /// Admit a job: validate, build its middleware chain, install a cron
    /// entry, and store it. Fails on an invalid schedule or a name
    /// collision with a higher-precedence source, per spec.md §4.4.
    pub async fn add_job(
        &self,
        descriptor: JobDescriptor,
        chain: MiddlewareChain,
    ) -> anyhow::Result<()> {
        self.add_job_with_history(descriptor, chain, Vec::new()).await
    }

    /// Same as `add_job`, but seeds the fresh history ring with records
    /// restored from disk on boot (spec.md §6 `restore-history-enabled`).
    /// `initial_history` must already be oldest-first and within
    /// `restore-history-max-age`.
    pub async fn add_job_with_history(
        &self,
        descriptor: JobDescriptor,
        chain: MiddlewareChain,
        initial_history: Vec<ExecutionRecord>,
    ) -> anyhow::Result<()> {
        if let Err(e) = descriptor.validate() {
            self.mark_disabled(descriptor, e.to_string()).await;
            anyhow::bail!("job failed validation");
        }

        let key = job_key(descriptor.job_type, &descriptor.name);

        {
            let registry = self.state.registry.read().await;
            if let Some(existing) = registry.get(&key) {
                let existing_source = existing.descriptor.read().await.source;
                if existing_source.outranks(descriptor.source) {
                    warn!(
                        job = %descriptor.name,
                        kind = %descriptor.job_type,
                        "label attempted to introduce a name already held by INI; ignored"
                    );
                    anyhow::bail!("name collision with higher-precedence source");
                }
            }
        }

        let history_limit = descriptor.history_limit;
        let mut history = HistoryRing::new(history_limit);
        let mut next_id = 0u64;
        for record in initial_history {
            next_id = next_id.max(record.id + 1);
            history.push(record);
        }
        history.set_next_id(next_id);

        let (exec_tx, exec_rx) = mpsc::channel(1);
        let entry = Arc::new(JobEntry {
            descriptor: RwLock::new(descriptor),
            chain: RwLock::new(chain),
            history: Mutex::new(history),
            gate: Semaphore::new(1),
            cancel: self.state.root_cancel.child_token(),
            loop_handle: Mutex::new(None),
            exec_tx: Mutex::new(Some(exec_tx)),
            exec_rx: Mutex::new(Some(exec_rx)),
        });

        self.install(key.clone(), entry.clone()).await;
        self.state.disabled.write().await.remove(&key);
        self.state.registry.write().await.insert(key, entry);
        Ok(())
    }

    async fn mark_disabled(&self, descriptor: JobDescriptor, reason: String) {
        let key = job_key(descriptor.job_type, &descriptor.name);
        warn!(job = %descriptor.name, kind = %descriptor.job_type, reason = %reason, "job disabled: failed validation");
        self.state.disabled.write().await.insert(key, (descriptor, reason));
    }

    /// Remove a job: cancel its cron entry and await any in-flight
    /// execution up to `shutdown_timeout`.
    pub async fn remove_job(&self, key: &JobKey) {
        let removed = self.state.registry.write().await.remove(key);
        if let Some(entry) = removed {
            entry.cancel.cancel();
            if let Some(handle) = entry.loop_handle.lock().await.take() {
                let _ = tokio::time::timeout(self.state.shutdown_timeout, handle).await;
            }
            Self::drain(&entry, self.state.shutdown_timeout).await;
        }
    }

    /// Wait for every in-flight execution of `entry` to finish, bounded by
    /// `timeout`. Covers both `allow_parallel=true` and `=false` jobs: each
    /// fire, however it was spawned, holds a cloned `exec_tx` for its
    /// duration (see `fire`).
    async fn drain(entry: &Arc<JobEntry>, timeout: Duration) {
        entry.exec_tx.lock().await.take();
        if let Some(mut rx) = entry.exec_rx.lock().await.take() {
            let _ = tokio::time::timeout(timeout, rx.recv()).await;
        }
    }

    /// Atomic swap: remove `old`'s cron entry, install `new`'s, preserving
    /// the history ring (spec.md §4.4).
    pub async fn replace_job(
        &self,
        key: &JobKey,
        new_descriptor: JobDescriptor,
        new_chain: MiddlewareChain,
    ) -> anyhow::Result<()> {
        if let Err(e) = new_descriptor.validate() {
            self.mark_disabled(new_descriptor, e.to_string()).await;
            anyhow::bail!("replacement job failed validation");
        }

        let old = self.state.registry.write().await.remove(key);
        let history_limit = new_descriptor.history_limit;
        let history = if let Some(old_entry) = &old {
            old_entry.cancel.cancel();
            if let Some(handle) = old_entry.loop_handle.lock().await.take() {
                let _ = tokio::time::timeout(self.state.shutdown_timeout, handle).await;
            }
            // Wait for any execution still writing to the old history ring
            // before taking it over, so a late write can't land after the
            // swap and be silently lost.
            Self::drain(old_entry, self.state.shutdown_timeout).await;
            let mut ring = old_entry.history.lock().await;
            std::mem::replace(&mut *ring, HistoryRing::new(history_limit))
        } else {
            HistoryRing::new(history_limit)
        };

        let new_key = job_key(new_descriptor.job_type, &new_descriptor.name);
        let (exec_tx, exec_rx) = mpsc::channel(1);
        let entry = Arc::new(JobEntry {
            descriptor: RwLock::new(new_descriptor),
            chain: RwLock::new(new_chain),
            history: Mutex::new(history),
            gate: Semaphore::new(1),
            cancel: self.state.root_cancel.child_token(),
            loop_handle: Mutex::new(None),
            exec_tx: Mutex::new(Some(exec_tx)),
            exec_rx: Mutex::new(Some(exec_rx)),
        });

        self.install(new_key.clone(), entry.clone()).await;
        self.state.registry.write().await.insert(new_key, entry);
        Ok(())
    }

    async fn install(&self, key: JobKey, entry: Arc<JobEntry>) {
        let scheduler = self.clone();
        let loop_entry = entry.clone();
        let handle = tokio::spawn(async move {
            scheduler.cron_loop(key, loop_entry).await;
        });
        *entry.loop_handle.lock().await = Some(handle);
    }

    async fn cron_loop(&self, key: JobKey, entry: Arc<JobEntry>) {
        loop {
            let schedule = entry.descriptor.read().await.schedule.clone();
            let Some(next) = schedule.next_after(Utc::now()) else {
                // Non-timed (@triggered/@manual/@none): registered but
                // never fires on its own (spec.md §9 open question).
                return;
            };
            let now = Utc::now();
            let dur = (next - now).to_std().unwrap_or_default();

            tokio::select! {
                _ = tokio::time::sleep(dur) => {}
                _ = entry.cancel.cancelled() => return,
            }

            // Spawned rather than awaited: the timer must keep ticking while
            // this fire (or a prior one) is still running, both so distinct
            // jobs run in parallel and so an `allow_parallel=false` job's
            // later ticks reach the gate-miss path in `fire` and are
            // recorded as Skipped instead of never being attempted.
            let scheduler = self.clone();
            let fire_key = key.clone();
            let fire_entry = entry.clone();
            tokio::spawn(async move {
                scheduler.fire(&fire_key, &fire_entry, false).await;
            });
        }
    }

    /// Manual on-demand fire, honoring `allow_parallel` (spec.md §4.4
    /// `RunJob`).
    pub async fn run_job(&self, key: &JobKey) -> anyhow::Result<()> {
        let entry = {
            let registry = self.state.registry.read().await;
            registry.get(key).cloned()
        };
        let Some(entry) = entry else {
            anyhow::bail!("no such job: {}/{}", key.0, key.1);
        };
        self.fire(key, &entry, true).await;
        Ok(())
    }

    async fn fire(&self, key: &JobKey, entry: &Arc<JobEntry>, manual: bool) {
        let descriptor = entry.descriptor.read().await.clone();
        let job_name = descriptor.name.clone();

        if !descriptor.allow_parallel {
            let permit = match entry.gate.try_acquire() {
                Ok(p) => p,
                Err(_) => {
                    let mut record = {
                        let mut history = entry.history.lock().await;
                        let id = history.next_id();
                        ExecutionRecord::new(id, job_name.clone())
                    };
                    record.finish(Outcome::Skipped);
                    let chain = entry.chain.read().await;
                    chain.run_before(&job_name, &mut record).await;
                    chain.run_after(&job_name, &record).await;
                    entry.history.lock().await.push(record);
                    info!(job = %job_name, manual, "fire skipped: previous execution still in progress");
                    return;
                }
            };
            // Held for the duration of the run so `drain` (shutdown,
            // `remove_job`, `replace_job`) can observe this execution as
            // in-flight even though `fire` itself now runs detached from
            // `cron_loop`'s timer.
            let _guard = entry.exec_tx.lock().await.clone();
            self.execute_with_retry(entry, &descriptor).await;
            drop(permit);
        } else {
            let _guard = entry.exec_tx.lock().await.clone();
            self.execute_with_retry(entry, &descriptor).await;
        }
    }

    async fn execute_with_retry(&self, entry: &Arc<JobEntry>, descriptor: &JobDescriptor) {
        let job_name = descriptor.name.clone();
        let ctx = ExecutionContext {
            docker: self.state.docker.clone(),
            cancellation: entry.cancel.clone(),
            max_runtime: self.state.default_max_runtime,
        };

        let mut attempt = 0u32;
        let mut record = loop {
            let mut record = {
                let mut history = entry.history.lock().await;
                let id = history.next_id();
                let mut r = ExecutionRecord::new(id, job_name.clone());
                r.attempt = attempt;
                r
            };

            let chain = entry.chain.read().await.clone();
            chain.run_before(&job_name, &mut record).await;
            descriptor.run(&ctx, &mut record).await;

            if record.is_success() || attempt >= descriptor.retry.max_retries {
                chain.run_after(&job_name, &record).await;
                break record;
            }

            attempt += 1;
            let delay = descriptor.retry.delay_for(attempt);
            warn!(job = %job_name, attempt, delay_ms = delay.as_millis() as u64, "execution failed; retrying");
            tokio::time::sleep(delay).await;
        };
        record.attempt = attempt;

        self.trigger_dependents(descriptor, &record).await;
        entry.history.lock().await.push(record);
    }

    /// Resolve `on_success`/`on_failure` at fire time (spec.md §9): cycles
    /// are permitted and broken by normal overlap policy.
    async fn trigger_dependents(&self, descriptor: &JobDescriptor, record: &ExecutionRecord) {
        let names = if record.is_success() {
            &descriptor.on_success
        } else {
            &descriptor.on_failure
        };
        if names.is_empty() {
            return;
        }
        let registry = self.state.registry.read().await;
        for name in names {
            for job_type in [
                JobType::Exec,
                JobType::Run,
                JobType::ServiceRun,
                JobType::Local,
                JobType::Compose,
            ] {
                let key = job_key(job_type, name);
                if let Some(entry) = registry.get(&key) {
                    let scheduler = self.clone();
                    let entry = entry.clone();
                    let key = key.clone();
                    tokio::spawn(async move {
                        scheduler.fire(&key, &entry, false).await;
                    });
                    break;
                }
            }
        }
    }

    pub async fn entries(&self) -> Vec<JobSummary> {
        self.jobs_filtered(true).await
    }

    pub async fn jobs(&self) -> Vec<JobSummary> {
        self.jobs_filtered(false).await
    }

    async fn jobs_filtered(&self, timed_only: bool) -> Vec<JobSummary> {
        let registry = self.state.registry.read().await;
        let mut out = Vec::new();
        for entry in registry.values() {
            let descriptor = entry.descriptor.read().await;
            if timed_only && !descriptor.schedule.is_timed() {
                continue;
            }
            let history = entry.history.lock().await;
            out.push(JobSummary {
                job_type: descriptor.job_type,
                name: descriptor.name.clone(),
                source: descriptor.source,
                schedule: descriptor.schedule.to_string(),
                command: descriptor.command().to_string(),
                currently_running: entry.gate.available_permits() == 0,
                history_len: history.len(),
                last_outcome: history.last().map(|r| r.outcome),
            });
        }
        out
    }

    pub async fn disabled_jobs(&self) -> Vec<(JobType, String, String)> {
        self.state
            .disabled
            .read()
            .await
            .iter()
            .map(|(k, (_, reason))| (k.0, k.1.clone(), reason.clone()))
            .collect()
    }

    pub async fn contains(&self, key: &JobKey) -> bool {
        self.state.registry.read().await.contains_key(key)
    }

    pub async fn hash_of(&self, key: &JobKey) -> Option<crate::job::JobHash> {
        let registry = self.state.registry.read().await;
        let entry = registry.get(key)?;
        Some(entry.descriptor.read().await.hash())
    }

    pub async fn source_of(&self, key: &JobKey) -> Option<JobSource> {
        let registry = self.state.registry.read().await;
        let entry = registry.get(key)?;
        Some(entry.descriptor.read().await.source)
    }

    pub async fn all_keys(&self) -> Vec<JobKey> {
        self.state.registry.read().await.keys().cloned().collect()
    }

    /// Cancel the root context and wait for every registered job to have
    /// no in-flight run, bounded by `shutdown_timeout` (spec.md §4.4, §4.8).
    pub async fn stop(&self) {
        self.state.running.store(false, std::sync::atomic::Ordering::Relaxed);
        self.state.root_cancel.cancel();

        let keys: Vec<JobKey> = self.state.registry.read().await.keys().cloned().collect();
        for key in keys {
            self.remove_job(&key).await;
        }
        info!("scheduler stopped");
    }

    pub fn root_cancellation(&self) -> CancellationToken {
        self.state.root_cancel.clone()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn docker_stub() -> Arc<Docker> {
        // `Docker::connect_with_local_defaults` only builds a client handle;
        // it does not dial anything until a request is made, so it is safe
        // to construct in tests that never touch Docker.
        Arc::new(Docker::connect_with_local_defaults().expect("construct docker handle"))
    }

    #[tokio::test]
    async fn job_key_identity() {
        let a = job_key(JobType::Exec, "foo");
        let b = job_key(JobType::Exec, "foo");
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn scheduler_starts_and_stops() {
        let scheduler = Scheduler::new(docker_stub(), Duration::from_secs(1));
        scheduler.start();
        assert!(scheduler.is_running());
        scheduler.stop().await;
        assert!(!scheduler.is_running());
    }

    fn minimal_exec_descriptor(name: &str) -> JobDescriptor {
        use crate::job::{ExecJob, JobKind};
        use std::str::FromStr as _;
        JobDescriptor {
            name: name.to_string(),
            job_type: JobType::Exec,
            source: JobSource::Ini,
            schedule_raw: "@every 5s".into(),
            schedule: crate::schedule::ScheduleSpec::from_str("@every 5s").unwrap(),
            history_limit: 10,
            retry: Default::default(),
            allow_parallel: true,
            dependencies: Default::default(),
            on_success: vec![],
            on_failure: vec![],
            middleware: Default::default(),
            kind: JobKind::Exec(ExecJob {
                container: "c".into(),
                command: "echo hi".into(),
                user: None,
                tty: false,
                env: vec![],
            }),
        }
    }

    #[tokio::test]
    async fn add_job_with_history_seeds_ring_and_id_counter() {
        let scheduler = Scheduler::new(docker_stub(), Duration::from_secs(1));
        let descriptor = minimal_exec_descriptor("restored");
        let mut restored = ExecutionRecord::new(7, "restored");
        restored.finish(Outcome::Ok);
        scheduler
            .add_job_with_history(descriptor, MiddlewareChain::default(), vec![restored])
            .await
            .unwrap();

        let key = job_key(JobType::Exec, "restored");
        let entry = scheduler.state.registry.read().await.get(&key).unwrap().clone();
        let mut history = entry.history.lock().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history.last().unwrap().id, 7);
        // The next id allocated must not collide with the restored one.
        assert_eq!(history.next_id(), 8);
    }
}
