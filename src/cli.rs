//! CLI surface (spec.md §6, SPEC_FULL.md §1): every `[global]` INI key is
//! reachable as a default/override from the command line or environment,
//! the way the teacher already exposes `label_prefixes` and
//! `container_label_selector` via `clap`'s `env` attribute.

use std::time::Duration;

#[derive(Debug, clap::Parser)]
#[command(name = "ofelia-rs", version, about = "Docker-aware cron job scheduler")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    Run(RunArgs),
}

#[derive(Debug, Clone, clap::Parser)]
pub struct RunArgs {
    /// Glob or literal path to INI config file(s) (spec.md §4.6).
    #[arg(long, env = "OFELIA_CONFIG")]
    pub config: Option<String>,

    /// Label namespace scanned on containers (spec.md §4.5).
    #[arg(long, env = "LABEL_PREFIX", default_value = "ofelia")]
    pub label_prefix: String,

    #[arg(long, env = "DOCKER_HOST", default_value = "unix:///var/run/docker.sock")]
    pub docker_host: String,

    /// Allow `job-local`/`job-compose` jobs to be sourced from container
    /// labels (spec.md §4.5, §8 scenario 5: host-job privilege escalation
    /// is refused unless the operator opts in explicitly).
    #[arg(long, env = "ALLOW_HOST_JOBS_FROM_LABELS", default_value_t = false)]
    pub allow_host_jobs_from_labels: bool,

    /// Bounded wait for in-flight executions to finish on shutdown (spec.md
    /// §4.8).
    #[arg(long, env = "SHUTDOWN_TIMEOUT", value_parser = humantime::parse_duration, default_value = "30s")]
    pub shutdown_timeout: Duration,

    /// Fallback container poll cadence when the Docker event stream is
    /// unavailable or disabled outright (spec.md §4.5).
    #[arg(long, env = "POLL_INTERVAL", value_parser = humantime::parse_duration, default_value = "10s")]
    pub poll_interval: Duration,

    /// Disable polling entirely; rely solely on the Docker event stream.
    #[arg(long, env = "NO_POLL", default_value_t = false)]
    pub no_poll: bool,

    /// Default per-job max runtime when a job doesn't set its own
    /// (`[global] max-runtime`, spec.md §6).
    #[arg(long, env = "MAX_RUNTIME", value_parser = humantime::parse_duration)]
    pub max_runtime: Option<Duration>,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Cli {
    /// Parse CLI from std::env and return the parsed structure.
    pub fn parse() -> Self {
        <Self as clap::Parser>::parse()
    }
}
