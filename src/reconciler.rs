//! Reconciler (C7): diffs the desired job set (INI files + opted-in
//! container labels) against the scheduler's live registry and applies the
//! minimal set of add/replace/remove operations (spec.md §4.7).
//!
//! INI always outranks Label on a name collision (`JobSource::outranks`);
//! a job's `JobHash` decides whether a descriptor present on both sides is
//! "the same job, re-seen" or "a replacement" (spec.md §4.2, §4.4).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::labels::{enabled_prefix, parse_container_labels};
use crate::config::{build_job_descriptor, ini, webhook_config_from_fields, GlobalConfig};
use crate::discovery::Discovery;
use crate::health::HealthMonitor;
use crate::job::{JobDescriptor, JobSource};
use crate::middleware::{build_chain, WebhookConfig};
use crate::scheduler::{job_key, JobKey, Scheduler};

/// Static inputs a reconcile run needs beyond what changes at runtime
/// (the INI path, label prefix, and the security flag governing
/// label-sourced host jobs) (spec.md §4.5, §4.6).
pub struct ReconcilerConfig {
    pub ini_glob: Option<String>,
    pub label_prefix: String,
    pub allow_host_jobs_from_labels: bool,
}

/// Outcome of one reconcile pass, surfaced for logging/health.
#[derive(Debug, Default, Clone)]
pub struct ReconcileReport {
    pub added: usize,
    pub replaced: usize,
    pub removed: usize,
    pub errors: Vec<String>,
}

pub struct Reconciler {
    scheduler: Scheduler,
    discovery: Discovery,
    config: ReconcilerConfig,
    global: RwLock<GlobalConfig>,
    health: Option<Arc<HealthMonitor>>,
    /// Serializes reconcile passes; a trigger arriving while one is already
    /// in flight sets `pending` instead of running concurrently, and the
    /// in-flight pass loops again once it finishes (spec.md §4.7: "a second
    /// reconcile-while-one-in-progress waits and recomputes from the latest
    /// snapshot").
    run_lock: Mutex<()>,
    pending: AtomicBool,
}

impl Reconciler {
    pub fn new(
        scheduler: Scheduler,
        discovery: Discovery,
        config: ReconcilerConfig,
        initial_global: GlobalConfig,
        health: Option<Arc<HealthMonitor>>,
    ) -> Self {
        Self {
            scheduler,
            discovery,
            config,
            global: RwLock::new(initial_global),
            health,
            run_lock: Mutex::new(()),
            pending: AtomicBool::new(false),
        }
    }

    /// Request a reconcile. Coalesces with any pass already running.
    pub async fn trigger(&self) {
        self.pending.store(true, Ordering::SeqCst);
        let Ok(_guard) = self.run_lock.try_lock() else {
            return;
        };
        loop {
            self.pending.store(false, Ordering::SeqCst);
            let report = self.reconcile_once().await;
            match &report {
                Ok(r) if r.errors.is_empty() => {
                    tracing::info!(added = r.added, replaced = r.replaced, removed = r.removed, "reconcile complete");
                }
                Ok(r) => {
                    tracing::warn!(added = r.added, replaced = r.replaced, removed = r.removed, errors = ?r.errors, "reconcile completed with errors");
                }
                Err(e) => tracing::warn!(error = %e, "reconcile pass failed"),
            }
            if let Some(health) = &self.health {
                health.record_reconcile(report.is_ok()).await;
            }
            if !self.pending.load(Ordering::SeqCst) {
                break;
            }
        }
    }

    async fn reconcile_once(&self) -> anyhow::Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let mut desired: HashMap<JobKey, JobDescriptor> = HashMap::new();
        let mut webhook_defs: HashMap<String, WebhookConfig> = HashMap::new();

        if let Some(pattern) = &self.config.ini_glob {
            match ini::load_glob(pattern) {
                Ok(doc) => {
                    for (name, fields) in &doc.webhooks {
                        match webhook_config_from_fields(name, fields) {
                            Ok(cfg) => {
                                webhook_defs.insert(name.clone(), cfg);
                            }
                            Err(e) => report.errors.push(e.to_string()),
                        }
                    }

                    for job in &doc.jobs {
                        match build_job_descriptor(
                            job.job_type,
                            &job.name,
                            JobSource::Ini,
                            &job.fields,
                            &doc.global,
                            self.config.allow_host_jobs_from_labels,
                        ) {
                            Ok(descriptor) => {
                                desired.insert(job_key(descriptor.job_type, &descriptor.name), descriptor);
                            }
                            Err(e) => {
                                warn!(job = %job.name, error = %e, "INI job rejected");
                                report.errors.push(e.to_string());
                            }
                        }
                    }

                    *self.global.write().await = doc.global;
                }
                Err(e) => {
                    warn!(error = %e, "failed to load INI config");
                    report.errors.push(e.to_string());
                }
            }
        }

        let global = self.global.read().await.clone();

        let containers = self.discovery.snapshot().await?;
        let prefixes = vec![self.config.label_prefix.clone()];
        for container in containers {
            let Some(prefix) = enabled_prefix(&container.labels, &prefixes) else {
                continue;
            };
            let candidates = match parse_container_labels(&container.name, &container.labels, prefix) {
                Ok(c) => c,
                Err(e) => {
                    warn!(container = %container.name, error = %e, "failed to parse container labels");
                    report.errors.push(e.to_string());
                    continue;
                }
            };
            for candidate in candidates {
                let key = job_key(candidate.job_type, &candidate.name);
                // INI always outranks Label: a name already claimed by an
                // INI job is never overwritten by a label candidate.
                if desired.contains_key(&key) {
                    continue;
                }
                match build_job_descriptor(
                    candidate.job_type,
                    &candidate.name,
                    JobSource::Label,
                    &candidate.fields,
                    &global,
                    self.config.allow_host_jobs_from_labels,
                ) {
                    Ok(descriptor) => {
                        desired.insert(key, descriptor);
                    }
                    Err(e) => {
                        // Security-policy refusals are logged at error, not
                        // warn (spec.md §7, §8 scenario 5).
                        if e.to_string().contains("SECURITY POLICY VIOLATION") {
                            tracing::error!(job = %candidate.name, container = %container.name, error = %e, "label job rejected");
                        } else {
                            warn!(job = %candidate.name, container = %container.name, error = %e, "label job rejected");
                        }
                        report.errors.push(e.to_string());
                    }
                }
            }
        }

        let desired_keys: HashSet<JobKey> = desired.keys().cloned().collect();

        for (key, descriptor) in desired {
            let chain = build_chain(&descriptor.middleware, &global, &webhook_defs);
            if !self.scheduler.contains(&key).await {
                let restored = if descriptor.middleware.save_to_disk && global.restore_history_enabled {
                    match &global.save_folder {
                        Some(folder) => {
                            crate::middleware::save::restore_history(
                                std::path::Path::new(folder),
                                &descriptor.name,
                                global.restore_history_max_age,
                            )
                            .await
                        }
                        None => Vec::new(),
                    }
                } else {
                    Vec::new()
                };
                if let Err(e) = self.scheduler.add_job_with_history(descriptor, chain, restored).await {
                    report.errors.push(e.to_string());
                    continue;
                }
                report.added += 1;
            } else if self.scheduler.hash_of(&key).await != Some(descriptor.hash()) {
                let prior_source = self.scheduler.source_of(&key).await;
                if prior_source == Some(JobSource::Label) && descriptor.source == JobSource::Ini {
                    warn!(job = %descriptor.name, kind = %descriptor.job_type, "overriding label-defined job with INI-defined job");
                }
                if let Err(e) = self.scheduler.replace_job(&key, descriptor, chain).await {
                    report.errors.push(e.to_string());
                    continue;
                }
                report.replaced += 1;
            }
        }

        for key in self.scheduler.all_keys().await {
            if !desired_keys.contains(&key) {
                self.scheduler.remove_job(&key).await;
                report.removed += 1;
            }
        }

        Ok(report)
    }

    /// Poll the globbed INI path(s) for an mtime change and re-trigger a
    /// reconcile whenever any matching file is newer than last observed
    /// (spec.md §4.7: "runs on... any INI file mtime change"). The teacher
    /// has no config-reload story of its own; this mirrors the same
    /// interval-polling shape `Discovery::watch`'s polling fallback uses
    /// rather than pulling in a filesystem-notification crate.
    pub fn watch_ini_files(self: Arc<Self>, poll_interval: std::time::Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let Some(pattern) = self.config.ini_glob.clone() else {
                return;
            };
            let mut last_mtimes: HashMap<std::path::PathBuf, SystemTime> = HashMap::new();
            let mut ticker = tokio::time::interval(poll_interval.max(std::time::Duration::from_secs(1)));
            ticker.tick().await; // first tick is immediate; boot already reconciled once

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let current = current_mtimes(&pattern);
                        if current != last_mtimes {
                            last_mtimes = current;
                            self.trigger().await;
                        }
                    }
                }
            }
        })
    }
}

fn current_mtimes(pattern: &str) -> HashMap<std::path::PathBuf, SystemTime> {
    let mut out = HashMap::new();
    let Ok(paths) = glob::glob(pattern) else {
        return out;
    };
    for entry in paths.filter_map(|r| r.ok()) {
        if let Ok(meta) = std::fs::metadata(&entry) {
            if let Ok(modified) = meta.modified() {
                out.insert(entry, modified);
            }
        }
    }
    out
}
