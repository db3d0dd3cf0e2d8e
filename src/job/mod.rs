//! Job Model (C2): a polymorphic job abstraction with concrete executors.
//!
//! Grounded on the teacher's flat `Job` struct (`job.rs`) and on
//! `Ayowel-cfc`'s `JobInfo` tagged enum / per-kind info structs, which spec.md
//! §9 ("polymorphism over job types... avoid deep type hierarchies") matches
//! closely: one tagged enum, flat per-kind state, a shared capability set.

pub mod compose;
pub mod exec;
pub mod local;
pub mod run;
pub mod service_run;

use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bollard::Docker;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

pub use compose::ComposeJob;
pub use exec::ExecJob;
pub use local::LocalJob;
pub use run::RunJob;
pub use service_run::ServiceRunJob;

use crate::error::ConfigError;
use crate::history::{ExecutionRecord, Outcome};
use crate::schedule::ScheduleSpec;

/// The type-bucket a job name must be unique within (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum JobType {
    Exec,
    Run,
    ServiceRun,
    Local,
    Compose,
}

impl JobType {
    pub const fn label(self) -> &'static str {
        match self {
            JobType::Exec => "job-exec",
            JobType::Run => "job-run",
            JobType::ServiceRun => "job-service-run",
            JobType::Local => "job-local",
            JobType::Compose => "job-compose",
        }
    }
}

impl Display for JobType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for JobType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "job-exec" | "exec" => Ok(JobType::Exec),
            "job-run" | "run" => Ok(JobType::Run),
            "job-service-run" | "service-run" | "service_run" => Ok(JobType::ServiceRun),
            "job-local" | "local" => Ok(JobType::Local),
            "job-compose" | "compose" => Ok(JobType::Compose),
            other => Err(other.to_string()),
        }
    }
}

/// Where a descriptor was parsed from; governs precedence (spec.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobSource {
    Ini,
    Label,
}

impl JobSource {
    /// INI strictly outranks Label.
    pub fn outranks(self, other: JobSource) -> bool {
        matches!((self, other), (JobSource::Ini, JobSource::Label))
    }
}

impl Display for JobSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            JobSource::Ini => write!(f, "INI"),
            JobSource::Label => write!(f, "Label"),
        }
    }
}

/// Retry policy shared by all job types (spec.md §3, §4.2).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_exponential: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            retry_delay_ms: 0,
            retry_max_delay_ms: 0,
            retry_exponential: false,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given retry attempt (1-indexed: the delay before
    /// the first retry is `delay_for(1)`).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if !self.retry_exponential {
            return Duration::from_millis(self.retry_delay_ms);
        }
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        let delay = self.retry_delay_ms.saturating_mul(factor);
        let capped = if self.retry_max_delay_ms > 0 {
            delay.min(self.retry_max_delay_ms)
        } else {
            delay
        };
        Duration::from_millis(capped)
    }
}

/// Which notification/persistence middlewares a job opts into, by name
/// (resolved against global `[webhook "<name>"]` / SMTP config at chain
/// build time, see `crate::middleware`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MiddlewareConfig {
    pub slack_webhook: Option<String>,
    pub mail_to: Vec<String>,
    pub save_to_disk: bool,
    pub save_only_on_error: bool,
    pub webhooks: Vec<String>,
}

/// Per-type executable state.
#[derive(Debug, Clone)]
pub enum JobKind {
    Exec(ExecJob),
    Run(RunJob),
    ServiceRun(ServiceRunJob),
    Local(LocalJob),
    Compose(ComposeJob),
}

/// Apply the same processing to every job kind, mirroring `cfc`'s
/// `match_all_jobs!` macro (spec.md §9: avoid a deep type hierarchy).
macro_rules! match_all_kinds {
    ($target:expr, $name:ident, $body:expr) => {
        match $target {
            JobKind::Exec($name) => $body,
            JobKind::Run($name) => $body,
            JobKind::ServiceRun($name) => $body,
            JobKind::Local($name) => $body,
            JobKind::Compose($name) => $body,
        }
    };
}
pub(crate) use match_all_kinds;

/// Context threaded into every execution: the Docker handle, a cancellation
/// token honored by every runner, and an optional hard deadline.
#[derive(Clone)]
pub struct ExecutionContext {
    pub docker: Arc<Docker>,
    pub cancellation: CancellationToken,
    pub max_runtime: Option<Duration>,
}

/// The normalized, validated, hashable job configuration (spec.md glossary).
#[derive(Debug, Clone)]
pub struct JobDescriptor {
    pub name: String,
    pub job_type: JobType,
    pub source: JobSource,
    pub schedule_raw: String,
    pub schedule: ScheduleSpec,
    pub history_limit: usize,
    pub retry: RetryPolicy,
    pub allow_parallel: bool,
    pub dependencies: BTreeSet<String>,
    pub on_success: Vec<String>,
    pub on_failure: Vec<String>,
    pub middleware: MiddlewareConfig,
    pub kind: JobKind,
}

/// A stable digest over every semantically significant field (spec.md
/// §4.2). Two descriptors with the same hash are interchangeable as far as
/// the reconciler is concerned, regardless of field ordering or
/// whitespace in the source text they were parsed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobHash([u8; 32]);

impl Display for JobHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl JobDescriptor {
    /// Validate type-specific required fields and cross-field invariants.
    /// The schedule itself is validated during parsing (an unparseable
    /// schedule never reaches a `JobDescriptor`).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::MissingField {
                name: "<unnamed>".into(),
                field: "name".into(),
            });
        }
        match &self.kind {
            JobKind::Exec(j) => j.validate(&self.name),
            JobKind::Run(j) => j.validate(&self.name),
            JobKind::ServiceRun(j) => j.validate(&self.name),
            JobKind::Local(j) => j.validate(&self.name),
            JobKind::Compose(j) => j.validate(&self.name),
        }
    }

    /// Compute the stable digest used by the reconciler to detect a
    /// "changed" descriptor without relying on full structural equality.
    pub fn hash(&self) -> JobHash {
        let mut hasher = Sha256::new();
        hasher.update(self.job_type.label().as_bytes());
        hasher.update(b"\0");
        hasher.update(self.name.as_bytes());
        hasher.update(b"\0");
        // schedule.to_string() is canonical regardless of how the original
        // text was whitespace-formatted.
        hasher.update(self.schedule.to_string().as_bytes());
        hasher.update(b"\0");
        hasher.update(self.history_limit.to_string().as_bytes());
        hasher.update([
            self.retry.max_retries as u8,
            (self.retry.max_retries >> 8) as u8,
        ]);
        hasher.update(self.retry.retry_delay_ms.to_le_bytes());
        hasher.update(self.retry.retry_max_delay_ms.to_le_bytes());
        hasher.update([self.retry.retry_exponential as u8]);
        hasher.update([self.allow_parallel as u8]);
        for dep in &self.dependencies {
            hasher.update(dep.as_bytes());
            hasher.update(b"\0");
        }
        for name in &self.on_success {
            hasher.update(b"S");
            hasher.update(name.as_bytes());
        }
        for name in &self.on_failure {
            hasher.update(b"F");
            hasher.update(name.as_bytes());
        }
        let mw = serde_json::to_vec(&self.middleware).unwrap_or_default();
        hasher.update(mw);
        match_all_kinds!(&self.kind, j, hasher.update(j.hash_input()));
        JobHash(hasher.finalize().into())
    }

    /// Perform the type-specific action, writing stdout/stderr/outcome
    /// into `record`. Retries are applied by the caller (the scheduler),
    /// not here: `run` performs exactly one attempt.
    pub async fn run(&self, ctx: &ExecutionContext, record: &mut ExecutionRecord) {
        let result = match &self.kind {
            JobKind::Exec(j) => j.execute(ctx, record).await,
            JobKind::Run(j) => j.execute(ctx, record).await,
            JobKind::ServiceRun(j) => j.execute(ctx, record).await,
            JobKind::Local(j) => j.execute(ctx, record).await,
            JobKind::Compose(j) => j.execute(ctx, record).await,
        };
        match result {
            Ok(()) => {
                if record.exit_code.unwrap_or(0) == 0 {
                    record.finish(Outcome::Ok);
                } else {
                    record.finish(Outcome::Failed);
                }
            }
            Err(e) => {
                record.error = Some(e.to_string());
                record.finish(Outcome::Error);
            }
        }
    }

    /// The command string driving this job, for logging/UI.
    pub fn command(&self) -> &str {
        match_all_kinds!(&self.kind, j, j.command.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr as _;

    fn minimal_exec() -> JobDescriptor {
        JobDescriptor {
            name: "a".into(),
            job_type: JobType::Exec,
            source: JobSource::Ini,
            schedule_raw: "@every 5s".into(),
            schedule: ScheduleSpec::from_str("@every 5s").unwrap(),
            history_limit: 10,
            retry: RetryPolicy::default(),
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

    #[test]
    fn hash_stable_across_clones() {
        let a = minimal_exec();
        let b = minimal_exec();
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn hash_changes_with_command() {
        let a = minimal_exec();
        let mut b = minimal_exec();
        if let JobKind::Exec(e) = &mut b.kind {
            e.command = "echo bye".into();
        }
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn retry_delay_doubles_when_exponential() {
        let p = RetryPolicy {
            max_retries: 5,
            retry_delay_ms: 100,
            retry_max_delay_ms: 1000,
            retry_exponential: true,
        };
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(400));
        assert_eq!(p.delay_for(10), Duration::from_millis(1000));
    }

    #[test]
    fn ini_outranks_label() {
        assert!(JobSource::Ini.outranks(JobSource::Label));
        assert!(!JobSource::Label.outranks(JobSource::Ini));
    }

    #[test]
    fn validate_rejects_empty_name() {
        let mut j = minimal_exec();
        j.name = "".into();
        assert!(j.validate().is_err());
    }
}
