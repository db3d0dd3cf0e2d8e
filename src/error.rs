use thiserror::Error;

/// A structured configuration problem, naming the offending field.
///
/// Reconciliation rejects the one job this names and continues with the
/// rest of the config (spec.md §7: "one bad job never brings down the
/// scheduler").
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("job '{name}': missing required field '{field}'")]
    MissingField { name: String, field: String },

    #[error("job '{name}': invalid value for '{field}': {reason}")]
    InvalidField {
        name: String,
        field: String,
        reason: String,
    },

    #[error("job '{name}': unknown job type '{kind}'")]
    UnknownType { name: String, kind: String },

    #[error("job '{name}': invalid schedule '{schedule}': {source}")]
    InvalidSchedule {
        name: String,
        schedule: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("duplicate job name '{name}' in type bucket '{kind}'")]
    DuplicateName { name: String, kind: String },

    #[error("invalid INI syntax in {path}: {reason}")]
    InvalidIni { path: String, reason: String },

    #[error("invalid duration '{value}' for '{field}': {reason}")]
    InvalidDuration {
        field: String,
        value: String,
        reason: String,
    },
}

/// A label-sourced job was refused on security grounds (spec.md §4.5, §8
/// scenario 5).
#[derive(Debug, Error)]
#[error("SECURITY POLICY VIOLATION: {kind} jobs from container labels are disabled (would allow privilege escalation); job '{job}' on container '{container}' ignored")]
pub struct SecurityPolicyError {
    pub kind: &'static str,
    pub job: String,
    pub container: String,
}

/// Errors surfaced while validating an already-parsed job descriptor.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Security(#[from] SecurityPolicyError),
}

/// Fatal startup conditions (spec.md §7): the process cannot come up at all.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("docker engine unreachable: {0}")]
    DockerUnreachable(#[source] anyhow::Error),
    #[error("no valid jobs and no discovery sources configured")]
    NoJobSources,
}
