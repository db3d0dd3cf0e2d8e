//! Exec job: run a command inside an already-running container.
//!
//! Grounded on the teacher's `run_once` (`job.rs`) and on `Ayowel-cfc`'s
//! `ExecJobInfo::exec`.

use anyhow::Context as _;
use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::query_parameters::InspectContainerOptions;
use futures::StreamExt;
use tracing::warn;

use crate::error::ConfigError;
use crate::history::ExecutionRecord;
use crate::job::ExecutionContext;

#[derive(Debug, Clone)]
pub struct ExecJob {
    /// Target container name or id. Defaults to the labelling container
    /// when discovered from labels (spec.md §4.5); an explicit `.container`
    /// field overrides that default.
    pub container: String,
    pub command: String,
    pub user: Option<String>,
    pub tty: bool,
    pub env: Vec<String>,
}

impl ExecJob {
    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.container.trim().is_empty() {
            return Err(ConfigError::MissingField {
                name: name.into(),
                field: "container".into(),
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
        buf.extend_from_slice(self.container.as_bytes());
        buf.push(0);
        buf.extend_from_slice(self.command.as_bytes());
        buf.push(0);
        buf.extend_from_slice(self.user.as_deref().unwrap_or("").as_bytes());
        buf.push(self.tty as u8);
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
        let details = ctx
            .docker
            .inspect_container(&self.container, None::<InspectContainerOptions>)
            .await
            .with_context(|| format!("inspect container '{}'", self.container))?;

        let running = details
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);
        if !running {
            warn!(container = %self.container, "container is not running; skipping exec");
            record.error = Some(format!("container '{}' is not running", self.container));
            record.exit_code = Some(1);
            return Ok(());
        }

        let cmd = shlex::split(&self.command)
            .filter(|args| !args.is_empty())
            .with_context(|| format!("could not tokenize command '{}'", self.command))?;

        let exec_id = ctx
            .docker
            .create_exec(
                &self.container,
                CreateExecOptions {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(self.tty),
                    cmd: Some(cmd),
                    env: Some(self.env.clone()),
                    user: self.user.clone(),
                    ..Default::default()
                },
            )
            .await
            .context("create exec")?
            .id;

        let collect = async {
            match ctx.docker.start_exec(&exec_id, None).await? {
                StartExecResults::Attached { mut output, .. } => {
                    while let Some(item) = output.next().await {
                        match item? {
                            LogOutput::StdOut { message } => {
                                record.stdout.push_str(&String::from_utf8_lossy(&message));
                            }
                            LogOutput::StdErr { message } => {
                                record.stderr.push_str(&String::from_utf8_lossy(&message));
                            }
                            _ => {}
                        }
                    }
                }
                StartExecResults::Detached => {}
            }
            anyhow::Ok(())
        };

        tokio::select! {
            res = collect => res?,
            _ = ctx.cancellation.cancelled() => {
                warn!(container = %self.container, exec = %exec_id, "cancelled; exec left to terminate with the container");
                record.error = Some("execution cancelled".into());
                record.exit_code = Some(1);
                return Ok(());
            }
        }

        let inspect = ctx.docker.inspect_exec(&exec_id).await.ok();
        record.exit_code = inspect.and_then(|i| i.exit_code);
        Ok(())
    }
}
