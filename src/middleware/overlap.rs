//! Overlap guard: the scheduler's own capability, exposed as a middleware
//! so notifiers downstream in the chain can observe a skip the same way
//! they observe any other outcome (spec.md §4.3, §4.4).
//!
//! The actual gating (whether a fire runs at all) is performed by the
//! scheduler's per-job semaphore before the chain is invoked; this
//! middleware only logs, and is always installed first so it is the first
//! thing a reader of the chain sees.

use async_trait::async_trait;
use tracing::debug;

use crate::history::{ExecutionRecord, Outcome};
use crate::middleware::Middleware;

#[derive(Debug, Default)]
pub struct OverlapGuard;

#[async_trait]
impl Middleware for OverlapGuard {
    async fn before(&self, job_name: &str, record: &mut ExecutionRecord) {
        if matches!(record.outcome, Outcome::Skipped) {
            debug!(job = %job_name, "fire skipped: previous execution still in progress");
        }
    }

    fn name(&self) -> &'static str {
        "overlap"
    }
}
