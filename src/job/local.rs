//! Local job: run a command directly on the host, outside any container.
//!
//! Grounded on the teacher's host-process shape absent from `dockcron`
//! (which only execs into containers) but present in `Ayowel-cfc`'s
//! `LocalJobInfo`; the actual process spawn mirrors how the retrieval
//! pack's scheduler examples shell out via `tokio::process::Command`.

use std::process::Stdio;

use anyhow::Context as _;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::warn;

use crate::error::ConfigError;
use crate::history::ExecutionRecord;
use crate::job::ExecutionContext;

#[derive(Debug, Clone)]
pub struct LocalJob {
    pub command: String,
    pub dir: Option<String>,
    pub env: Vec<String>,
}

impl LocalJob {
    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
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
        buf.extend_from_slice(self.command.as_bytes());
        buf.push(0);
        buf.extend_from_slice(self.dir.as_deref().unwrap_or("").as_bytes());
        for e in &self.env {
            buf.extend_from_slice(e.as_bytes());
            buf.push(0);
        }
        buf
    }

    pub async fn execute(
        &self,
        ctx: &ExecutionContext,
        record: &mut ExecutionRecord,
    ) -> anyhow::Result<()> {
        let args = shlex::split(&self.command)
            .filter(|a| !a.is_empty())
            .with_context(|| format!("could not tokenize command '{}'", self.command))?;
        let (program, rest) = args.split_first().context("empty command")?;

        let mut cmd = Command::new(program);
        cmd.args(rest);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        if let Some(dir) = &self.dir {
            cmd.current_dir(dir);
        }
        for kv in &self.env {
            if let Some((k, v)) = kv.split_once('=') {
                cmd.env(k, v);
            }
        }

        let mut child = cmd.spawn().context("spawn local process")?;
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
            let status = child.wait().await.context("wait for local process")?;
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
                warn!(command = %self.command, "cancelled; killing local process");
                record.error = Some("execution cancelled".into());
                record.exit_code = Some(1);
            }
        }

        Ok(())
    }
}
