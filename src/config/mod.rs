//! Config Parser (C6): parses INI files and label maps into typed job
//! descriptors (spec.md §4.6).
//!
//! Both sources converge on the same `build_job_descriptor` function,
//! generalizing `Ayowel-cfc`'s `JobInfo::try_from(HashMap<String,
//! Vec<String>>)` (spec.md §9: reuse the teacher's/pack's shape rather than
//! inventing a new one).

pub mod ini;
pub mod labels;

use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ConfigError, SecurityPolicyError};
use crate::job::compose::ComposeJob;
use crate::job::exec::ExecJob;
use crate::job::local::LocalJob;
use crate::job::run::{parse_pull_policy, RunJob};
use crate::job::service_run::ServiceRunJob;
use crate::job::{JobDescriptor, JobKind, JobSource, JobType, MiddlewareConfig, RetryPolicy};
use crate::middleware::webhook::{Trigger, WebhookConfig};
use crate::schedule::ScheduleSpec;

/// A single field's shadowed (repeated-key) values, not yet narrowed to
/// scalar-vs-list (spec.md §4.6, §8: "exactly one shadowed value yields a
/// string; exactly two yields a two-element list").
pub type RawFields = HashMap<String, Vec<String>>;

/// Global `[global]` section (spec.md §6).
#[derive(Debug, Clone)]
pub struct GlobalConfig {
    pub log_level: String,
    pub enable_web: bool,
    pub web_address: String,
    pub save_folder: Option<String>,
    pub save_only_on_error: bool,
    pub restore_history_enabled: bool,
    pub restore_history_max_age: Option<Duration>,
    pub max_runtime: Duration,
    pub notification_cooldown: Duration,
    pub allow_host_jobs_from_labels: bool,
    pub webhook_allowed_hosts: Vec<String>,
    pub slack_webhook: Option<String>,
    pub smtp: Option<crate::middleware::mail::SmtpConfig>,
    pub mail_to: Vec<String>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            enable_web: false,
            web_address: ":8080".into(),
            save_folder: None,
            save_only_on_error: false,
            restore_history_enabled: false,
            restore_history_max_age: None,
            max_runtime: Duration::ZERO,
            notification_cooldown: Duration::ZERO,
            allow_host_jobs_from_labels: false,
            webhook_allowed_hosts: Vec::new(),
            slack_webhook: None,
            smtp: None,
            mail_to: Vec::new(),
        }
    }
}

/// One fully-parsed webhook definition from a `[webhook "<name>"]` section.
pub fn webhook_config_from_fields(name: &str, fields: &RawFields) -> Result<WebhookConfig, ConfigError> {
    let url = scalar(fields, "url").ok_or_else(|| ConfigError::MissingField {
        name: name.into(),
        field: "url".into(),
    })?;
    Ok(WebhookConfig {
        name: name.to_string(),
        url,
        preset: scalar(fields, "preset"),
        id: scalar(fields, "id"),
        secret: scalar(fields, "secret"),
        trigger: scalar(fields, "trigger")
            .map(|s| Trigger::parse(&s))
            .unwrap_or(Trigger::OnFailure),
        timeout: scalar(fields, "timeout")
            .and_then(|s| humantime::parse_duration(&s).ok())
            .unwrap_or(Duration::from_secs(10)),
        retry_count: scalar(fields, "retry-count")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0),
        retry_delay: scalar(fields, "retry-delay")
            .and_then(|s| humantime::parse_duration(&s).ok())
            .unwrap_or(Duration::from_secs(1)),
        link: scalar(fields, "link"),
        link_text: scalar(fields, "link-text"),
    })
}

fn scalar(fields: &RawFields, key: &str) -> Option<String> {
    fields.get(key).and_then(|v| v.last()).cloned()
}

fn list(fields: &RawFields, key: &str) -> Vec<String> {
    match fields.get(key) {
        None => Vec::new(),
        Some(values) if values.len() == 1 => {
            // A single shadowed value may itself be a JSON array (spec.md
            // §4.5 "multi-valued fields accept a single scalar or a JSON
            // array").
            let v = &values[0];
            if let Ok(parsed) = serde_json::from_str::<Vec<String>>(v) {
                parsed
            } else {
                vec![v.clone()]
            }
        }
        Some(values) => values.clone(),
    }
}

fn bool_field(fields: &RawFields, key: &str, default: bool) -> bool {
    scalar(fields, key)
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn levenshtein_threshold(key: &str) -> usize {
    (2 * key.len() / 5).min(3)
}

/// "Did you mean?" suggestion for an unrecognized key, per spec.md §4.6.
pub fn suggest_field(unknown: &str, known: &[&str]) -> Option<&'static str> {
    let threshold = levenshtein_threshold(unknown);
    known
        .iter()
        .map(|k| (*k, strsim::levenshtein(unknown, k)))
        .filter(|(_, d)| *d <= threshold)
        .min_by_key(|(_, d)| *d)
        .map(|(k, _)| k)
}

const COMMON_FIELDS: &[&str] = &[
    "schedule",
    "command",
    "history-limit",
    "max-retries",
    "retry-delay",
    "retry-max-delay",
    "retry-exponential",
    "no-overlap",
    "allow-parallel",
    "depends-on",
    "on-success",
    "on-failure",
    "slack-webhook",
    "mail-to",
    "save",
    "save-only-on-error",
    "webhooks",
];

const EXEC_FIELDS: &[&str] = &["container", "user", "tty", "environment"];
const RUN_FIELDS: &[&str] = &[
    "image",
    "network",
    "hostname",
    "entrypoint",
    "volume",
    "volumes-from",
    "environment",
    "delete",
    "pull",
    "max-runtime",
    "container",
];
const SERVICE_RUN_FIELDS: &[&str] = &["image", "network", "tty", "delete", "max-runtime"];
const LOCAL_FIELDS: &[&str] = &["dir", "environment"];
const COMPOSE_FIELDS: &[&str] = &["file", "service", "exec"];

fn warn_unknown_fields(job_name: &str, fields: &RawFields, known: &[&str]) {
    for key in fields.keys() {
        if COMMON_FIELDS.contains(&key.as_str()) || known.contains(&key.as_str()) {
            continue;
        }
        let mut candidates: Vec<&str> = COMMON_FIELDS.to_vec();
        candidates.extend_from_slice(known);
        match suggest_field(key, &candidates) {
            Some(suggestion) => {
                tracing::warn!(job = %job_name, key = %key, suggestion = %suggestion, "unknown field; did you mean?");
            }
            None => {
                tracing::warn!(job = %job_name, key = %key, "unknown field");
            }
        }
    }
}

/// Build a validated `JobDescriptor` from a job's raw fields, shared by the
/// INI parser and the label parser.
pub fn build_job_descriptor(
    job_type: JobType,
    name: &str,
    source: JobSource,
    fields: &RawFields,
    global: &GlobalConfig,
    allow_host_jobs_from_labels: bool,
) -> Result<JobDescriptor, ConfigError> {
    if source == JobSource::Label
        && matches!(job_type, JobType::Local | JobType::Compose)
        && !allow_host_jobs_from_labels
    {
        let kind = if matches!(job_type, JobType::Local) {
            "local"
        } else {
            "compose"
        };
        return Err(ConfigError::InvalidField {
            name: name.into(),
            field: "kind".into(),
            reason: SecurityPolicyError {
                kind,
                job: name.into(),
                container: "<label>".into(),
            }
            .to_string(),
        });
    }

    let schedule_raw = scalar(fields, "schedule").ok_or_else(|| ConfigError::MissingField {
        name: name.into(),
        field: "schedule".into(),
    })?;
    let schedule = ScheduleSpec::from_str(&schedule_raw).map_err(|e| ConfigError::InvalidSchedule {
        name: name.into(),
        schedule: schedule_raw.clone(),
        source: e,
    })?;

    let history_limit = scalar(fields, "history-limit")
        .and_then(|s| s.parse().ok())
        .unwrap_or(10usize);

    let retry = RetryPolicy {
        max_retries: scalar(fields, "max-retries").and_then(|s| s.parse().ok()).unwrap_or(0),
        retry_delay_ms: scalar(fields, "retry-delay")
            .and_then(|s| humantime::parse_duration(&s).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0),
        retry_max_delay_ms: scalar(fields, "retry-max-delay")
            .and_then(|s| humantime::parse_duration(&s).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0),
        retry_exponential: bool_field(fields, "retry-exponential", false),
    };

    let allow_parallel = !bool_field(fields, "no-overlap", false) && bool_field(fields, "allow-parallel", true);

    let dependencies: BTreeSet<String> = list(fields, "depends-on").into_iter().collect();
    let on_success = list(fields, "on-success");
    let on_failure = list(fields, "on-failure");

    let middleware = MiddlewareConfig {
        slack_webhook: scalar(fields, "slack-webhook").or_else(|| global.slack_webhook.clone()),
        mail_to: {
            let mut to = list(fields, "mail-to");
            if to.is_empty() {
                to = global.mail_to.clone();
            }
            to
        },
        save_to_disk: bool_field(fields, "save", global.save_folder.is_some()),
        save_only_on_error: bool_field(fields, "save-only-on-error", global.save_only_on_error),
        webhooks: list(fields, "webhooks"),
    };

    let kind = match job_type {
        JobType::Exec => {
            warn_unknown_fields(name, fields, EXEC_FIELDS);
            JobKind::Exec(ExecJob {
                container: scalar(fields, "container").ok_or_else(|| ConfigError::MissingField {
                    name: name.into(),
                    field: "container".into(),
                })?,
                command: scalar(fields, "command").ok_or_else(|| ConfigError::MissingField {
                    name: name.into(),
                    field: "command".into(),
                })?,
                user: scalar(fields, "user"),
                tty: bool_field(fields, "tty", false),
                env: list(fields, "environment"),
            })
        }
        JobType::Run => {
            warn_unknown_fields(name, fields, RUN_FIELDS);
            JobKind::Run(RunJob {
                image: scalar(fields, "image").unwrap_or_default(),
                command: scalar(fields, "command").ok_or_else(|| ConfigError::MissingField {
                    name: name.into(),
                    field: "command".into(),
                })?,
                network: scalar(fields, "network"),
                hostname: scalar(fields, "hostname"),
                entrypoint: fields.get("entrypoint").cloned(),
                volumes: list(fields, "volume"),
                volumes_from: list(fields, "volumes-from"),
                env: list(fields, "environment"),
                delete_on_exit: bool_field(fields, "delete", true),
                pull: scalar(fields, "pull").map(|s| parse_pull_policy(&s)).unwrap_or(
                    crate::job::run::PullPolicy::IfNotPresent,
                ),
                max_runtime: scalar(fields, "max-runtime")
                    .and_then(|s| humantime::parse_duration(&s).ok())
                    .unwrap_or(global.max_runtime),
                existing_container: scalar(fields, "container"),
            })
        }
        JobType::ServiceRun => {
            warn_unknown_fields(name, fields, SERVICE_RUN_FIELDS);
            JobKind::ServiceRun(ServiceRunJob {
                image: scalar(fields, "image").ok_or_else(|| ConfigError::MissingField {
                    name: name.into(),
                    field: "image".into(),
                })?,
                command: scalar(fields, "command").ok_or_else(|| ConfigError::MissingField {
                    name: name.into(),
                    field: "command".into(),
                })?,
                network: scalar(fields, "network"),
                tty: bool_field(fields, "tty", false),
                delete_on_exit: bool_field(fields, "delete", true),
                max_runtime: scalar(fields, "max-runtime")
                    .and_then(|s| humantime::parse_duration(&s).ok())
                    .unwrap_or(global.max_runtime),
            })
        }
        JobType::Local => {
            warn_unknown_fields(name, fields, LOCAL_FIELDS);
            JobKind::Local(LocalJob {
                command: scalar(fields, "command").ok_or_else(|| ConfigError::MissingField {
                    name: name.into(),
                    field: "command".into(),
                })?,
                dir: scalar(fields, "dir"),
                env: list(fields, "environment"),
            })
        }
        JobType::Compose => {
            warn_unknown_fields(name, fields, COMPOSE_FIELDS);
            JobKind::Compose(ComposeJob {
                file: scalar(fields, "file").ok_or_else(|| ConfigError::MissingField {
                    name: name.into(),
                    field: "file".into(),
                })?,
                service: scalar(fields, "service").ok_or_else(|| ConfigError::MissingField {
                    name: name.into(),
                    field: "service".into(),
                })?,
                command: scalar(fields, "command").unwrap_or_default(),
                exec: bool_field(fields, "exec", false),
            })
        }
    };

    Ok(JobDescriptor {
        name: name.to_string(),
        job_type,
        source,
        schedule_raw,
        schedule,
        history_limit,
        retry,
        allow_parallel,
        dependencies,
        on_success,
        on_failure,
        middleware,
        kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suggestion_within_threshold() {
        let known = ["schedule", "command", "container"];
        assert_eq!(suggest_field("schedlue", &known), Some("schedule"));
    }

    #[test]
    fn suggestion_outside_threshold_is_none() {
        let known = ["schedule", "command", "container"];
        assert_eq!(suggest_field("zzzzzzzz", &known), None);
    }

    #[test]
    fn shadowed_single_value_is_scalar_equivalent() {
        let mut fields = RawFields::new();
        fields.insert("depends-on".into(), vec!["a".into()]);
        assert_eq!(list(&fields, "depends-on"), vec!["a".to_string()]);
    }

    #[test]
    fn shadowed_two_values_is_list() {
        let mut fields = RawFields::new();
        fields.insert("depends-on".into(), vec!["a".into(), "b".into()]);
        assert_eq!(
            list(&fields, "depends-on"),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn compose_from_label_refused_without_allow_flag() {
        let mut fields = RawFields::new();
        fields.insert("schedule".into(), vec!["@hourly".into()]);
        fields.insert("file".into(), vec!["docker-compose.yml".into()]);
        fields.insert("service".into(), vec!["db".into()]);
        let result = build_job_descriptor(
            JobType::Compose,
            "c",
            JobSource::Label,
            &fields,
            &GlobalConfig::default(),
            false,
        );
        assert!(result.is_err());
    }

    #[test]
    fn compose_from_label_allowed_with_flag() {
        let mut fields = RawFields::new();
        fields.insert("schedule".into(), vec!["@hourly".into()]);
        fields.insert("file".into(), vec!["docker-compose.yml".into()]);
        fields.insert("service".into(), vec!["db".into()]);
        fields.insert("command".into(), vec!["echo hi".into()]);
        let result = build_job_descriptor(
            JobType::Compose,
            "c",
            JobSource::Label,
            &fields,
            &GlobalConfig::default(),
            true,
        );
        assert!(result.is_ok());
    }
}
