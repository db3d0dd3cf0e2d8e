//! Compose job: invoke a `docker compose` command against a configured
//! compose file and service.
//!
//! Treated as a host-process job like `LocalJob` since the compose CLI is
//! itself the "runner" here; the core only shells out to it, grounded on
//! the same host-process spawn as `job::local`.

use std::process::Stdio;

use anyhow::Context as _;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::warn;

use crate::error::ConfigError;
use crate::history::ExecutionRecord;
use crate::job::ExecutionContext;

#[derive(Debug, Clone)]
pub struct ComposeJob {
    pub file: String,
    pub service: String,
    pub command: String,
    /// `true` = `compose exec` (service must already be running); `false`
    /// = `compose run` (starts a fresh one-shot container).
    pub exec: bool,
}

impl ComposeJob {
    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.file.trim().is_empty() {
            return Err(ConfigError::MissingField {
                name: name.into(),
                field: "file".into(),
            });
        }
        if self.service.trim().is_empty() {
            return Err(ConfigError::MissingField {
                name: name.into(),
                field: "service".into(),
            });
        }
        if self.command.trim().is_empty() {
            return Err(ConfigError::MissingField {
                name: name.into(),
                field: "command".into(),
            });
        }
        Ok(())
    }

    pub fn hash_input(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for part in [self.file.as_str(), self.service.as_str(), self.command.as_str()] {
            buf.extend_from_slice(part.as_bytes());
            buf.push(0);
        }
        buf.push(self.exec as u8);
        buf
    }

    pub async fn execute(
        &self,
        ctx: &ExecutionContext,
        record: &mut ExecutionRecord,
    ) -> anyhow::Result<()> {
        let sub = if self.exec { "exec" } else { "run" };
        let extra = shlex::split(&self.command)
            .with_context(|| format!("could not tokenize command '{}'", self.command))?;

        let mut cmd = Command::new("docker");
        cmd.arg("compose").arg("-f").arg(&self.file).arg(sub);
        if !self.exec {
            cmd.arg("--rm");
        }
        cmd.arg(&self.service).args(extra);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().context("spawn docker compose")?;
        let mut stdout = child.stdout.take().map(BufReader::new);
        let mut stderr = child.stderr.take().map(BufReader::new);

        let run = async {
            let mut out = String::new();
            let mut err = String::new();
            let drain_out = async {
                if let Some(r) = stdout.as_mut() {
                    r.read_to_string(&mut out).await.ok();
                }
            };
            let drain_err = async {
                if let Some(r) = stderr.as_mut() {
                    r.read_to_string(&mut err).await.ok();
                }
            };
            // Stdout and stderr must drain concurrently: a child that fills
            // one pipe's OS buffer before closing the other would otherwise
            // deadlock against this reading them one at a time.
            tokio::join!(drain_out, drain_err);
            let status = child.wait().await.context("wait for docker compose")?;
            anyhow::Ok((out, err, status))
        };

        tokio::select! {
            res = run => {
                let (out, err, status) = res?;
                record.stdout = out;
                record.stderr = err;
                record.exit_code = status.code().map(|c| c as i64).or(Some(1));
            }
            _ = ctx.cancellation.cancelled() => {
                warn!(file = %self.file, service = %self.service, "cancelled; killing compose process");
                record.error = Some("execution cancelled".into());
                record.exit_code = Some(1);
            }
        }

        Ok(())
    }
}
