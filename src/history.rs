//! Execution records and the per-job history ring (spec.md §3).

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of a single execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Ok,
    Skipped,
    Failed,
    Error,
}

/// One invocation of a job's `run`, monotonically numbered within the job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: u64,
    pub job_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Outcome,
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<String>,
    /// Which attempt this is, starting at 0, against the job's retry policy.
    pub attempt: u32,
}

impl ExecutionRecord {
    pub fn new(id: u64, job_name: impl Into<String>) -> Self {
        Self {
            id,
            job_name: job_name.into(),
            started_at: Utc::now(),
            finished_at: None,
            outcome: Outcome::Ok,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            error: None,
            attempt: 0,
        }
    }

    pub fn finish(&mut self, outcome: Outcome) {
        self.finished_at = Some(Utc::now());
        self.outcome = outcome;
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Ok)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, Outcome::Failed | Outcome::Error)
    }
}

/// Bounded in-memory history for one job.
///
/// `history_limit == 0` retains nothing: the execution still runs and its
/// record is discarded immediately after dispatch (spec.md §9, open
/// question, resolved explicitly that way).
#[derive(Debug, Default)]
pub struct HistoryRing {
    limit: usize,
    records: VecDeque<ExecutionRecord>,
    next_id: u64,
}

impl HistoryRing {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            records: VecDeque::new(),
            next_id: 0,
        }
    }

    /// Allocate the next execution id without recording anything yet.
    pub fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Push a finished record, evicting the oldest if over `limit`.
    pub fn push(&mut self, record: ExecutionRecord) {
        if self.limit == 0 {
            return;
        }
        if self.records.len() >= self.limit {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExecutionRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn last(&self) -> Option<&ExecutionRecord> {
        self.records.back()
    }

    /// Fast-forward the id counter, used when seeding a ring with records
    /// restored from disk so freshly dispatched executions don't reuse a
    /// restored id.
    pub fn set_next_id(&mut self, next_id: u64) {
        self.next_id = self.next_id.max(next_id);
    }

    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
        while self.records.len() > limit {
            self.records.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_bounded_by_limit() {
        let mut ring = HistoryRing::new(2);
        for _ in 0..5 {
            let id = ring.next_id();
            ring.push(ExecutionRecord::new(id, "job"));
        }
        assert_eq!(ring.len(), 2);
    }

    #[test]
    fn zero_limit_retains_nothing() {
        let mut ring = HistoryRing::new(0);
        let id = ring.next_id();
        ring.push(ExecutionRecord::new(id, "job"));
        assert!(ring.is_empty());
    }

    #[test]
    fn ids_are_monotonic() {
        let mut ring = HistoryRing::new(10);
        let a = ring.next_id();
        let b = ring.next_id();
        assert!(b > a);
    }
}
