//! Middleware Chain (C3): composable before/after wrappers around each
//! execution (spec.md §4.3).
//!
//! Each job owns a chain built once at registration time from its merged
//! configuration. Chain order is deterministic and matches registration
//! order; `Before` runs synchronously ahead of `run`, `After` synchronously
//! behind it and may block on its own bounded I/O.

pub mod mail;
pub mod metrics;
pub mod overlap;
pub mod save;
pub mod slack;
pub mod webhook;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::GlobalConfig;
use crate::history::ExecutionRecord;
use crate::job::MiddlewareConfig;

pub use mail::MailMiddleware;
pub use metrics::MetricsMiddleware;
pub use overlap::OverlapGuard;
pub use save::SaveToDiskMiddleware;
pub use slack::SlackMiddleware;
pub use webhook::{WebhookConfig, WebhookMiddleware};

/// A cross-cutting hook wrapping every job execution.
#[async_trait]
pub trait Middleware: Send + Sync + std::fmt::Debug {
    /// Called synchronously before `run`; may mutate the record (e.g. stamp
    /// metadata the `after` hook will report on).
    async fn before(&self, _job_name: &str, _record: &mut ExecutionRecord) {}

    /// Called synchronously after `run` with the final record.
    async fn after(&self, _job_name: &str, _record: &ExecutionRecord) {}

    /// Human-readable name, used only for logging/diagnostics.
    fn name(&self) -> &'static str;
}

/// The ordered set of middlewares built for one job at registration time.
#[derive(Debug, Clone, Default)]
pub struct MiddlewareChain {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new(middlewares: Vec<Arc<dyn Middleware>>) -> Self {
        Self { middlewares }
    }

    pub async fn run_before(&self, job_name: &str, record: &mut ExecutionRecord) {
        for mw in &self.middlewares {
            mw.before(job_name, record).await;
        }
    }

    pub async fn run_after(&self, job_name: &str, record: &ExecutionRecord) {
        for mw in &self.middlewares {
            mw.after(job_name, record).await;
        }
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }
}

/// Build the chain for one job's merged middleware configuration, resolving
/// named `[webhook "<name>"]` definitions against `webhook_defs` (spec.md
/// §4.3, §6). `OverlapGuard` and `MetricsMiddleware` are always installed;
/// everything else is opt-in per job.
pub fn build_chain(
    mw: &MiddlewareConfig,
    global: &GlobalConfig,
    webhook_defs: &HashMap<String, WebhookConfig>,
) -> MiddlewareChain {
    let mut middlewares: Vec<Arc<dyn Middleware>> = vec![
        Arc::new(OverlapGuard),
        Arc::new(MetricsMiddleware::default()),
    ];

    if let Some(url) = &mw.slack_webhook {
        middlewares.push(Arc::new(SlackMiddleware::new(
            url.clone(),
            global.notification_cooldown,
        )));
    }

    if !mw.mail_to.is_empty() {
        if let Some(smtp) = &global.smtp {
            match MailMiddleware::new(smtp.clone(), mw.mail_to.clone()) {
                Ok(mail) => middlewares.push(Arc::new(mail)),
                Err(e) => tracing::warn!(error = %e, "failed to build mail middleware"),
            }
        }
    }

    if mw.save_to_disk {
        if let Some(folder) = &global.save_folder {
            middlewares.push(Arc::new(SaveToDiskMiddleware {
                folder: PathBuf::from(folder),
                only_on_error: mw.save_only_on_error,
            }));
        }
    }

    for name in &mw.webhooks {
        match webhook_defs.get(name) {
            Some(cfg) => middlewares.push(Arc::new(WebhookMiddleware::new(cfg.clone()))),
            None => tracing::warn!(webhook = %name, "job references unknown webhook definition"),
        }
    }

    MiddlewareChain::new(middlewares)
}
