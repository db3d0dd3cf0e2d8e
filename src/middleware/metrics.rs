//! In-memory execution counters. No exporter is wired up here: metrics
//! surfaces beyond this are peripheral per spec.md §1 ("pprof... not
//! specified here"), but the counters themselves are cheap ambient
//! bookkeeping any middleware chain should carry.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use crate::history::{ExecutionRecord, Outcome};
use crate::middleware::Middleware;

#[derive(Debug, Default)]
pub struct MetricsMiddleware {
    ok: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    error: AtomicU64,
}

impl MetricsMiddleware {
    pub fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.ok.load(Ordering::Relaxed),
            self.skipped.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
            self.error.load(Ordering::Relaxed),
        )
    }
}

#[async_trait]
impl Middleware for MetricsMiddleware {
    async fn after(&self, _job_name: &str, record: &ExecutionRecord) {
        let counter = match record.outcome {
            Outcome::Ok => &self.ok,
            Outcome::Skipped => &self.skipped,
            Outcome::Failed => &self.failed,
            Outcome::Error => &self.error,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn name(&self) -> &'static str {
        "metrics"
    }
}
