//! Run job: create and run a new container to completion.
//!
//! Grounded on the teacher's container-oriented `bollard` usage (`job.rs`)
//! and on `Ayowel-cfc`'s `RunJobInfo`, generalized with image pull policy
//! and a `max_runtime` deadline per spec.md §4.2.

use anyhow::Context as _;
use bollard::container::LogOutput;
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::models::{ContainerCreateBody, HostConfig};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ConfigError;
use crate::history::ExecutionRecord;
use crate::job::ExecutionContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PullPolicy {
    Always,
    IfNotPresent,
    Never,
}

#[derive(Debug, Clone)]
pub struct RunJob {
    pub image: String,
    pub command: String,
    pub network: Option<String>,
    pub hostname: Option<String>,
    pub entrypoint: Option<Vec<String>>,
    pub volumes: Vec<String>,
    pub volumes_from: Vec<String>,
    pub env: Vec<String>,
    pub delete_on_exit: bool,
    pub pull: PullPolicy,
    /// `Duration::ZERO` means unbounded (spec.md §8).
    pub max_runtime: std::time::Duration,
    /// Reuse an existing (stopped) container instead of creating a fresh
    /// one, when set.
    pub existing_container: Option<String>,
}

impl RunJob {
    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.image.trim().is_empty() && self.existing_container.is_none() {
            return Err(ConfigError::MissingField {
                name: name.into(),
                field: "image".into(),
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
        for part in [
            self.image.as_str(),
            self.command.as_str(),
            self.network.as_deref().unwrap_or(""),
            self.hostname.as_deref().unwrap_or(""),
        ] {
            buf.extend_from_slice(part.as_bytes());
            buf.push(0);
        }
        for v in self.entrypoint.iter().flatten() {
            buf.extend_from_slice(v.as_bytes());
        }
        for v in self.volumes.iter().chain(self.volumes_from.iter()).chain(self.env.iter()) {
            buf.extend_from_slice(v.as_bytes());
            buf.push(0);
        }
        buf.push(self.delete_on_exit as u8);
        buf.push(match self.pull {
            PullPolicy::Always => 0,
            PullPolicy::IfNotPresent => 1,
            PullPolicy::Never => 2,
        });
        buf.extend_from_slice(&self.max_runtime.as_millis().to_le_bytes());
        buf
    }

    async fn ensure_image(&self, ctx: &ExecutionContext) -> anyhow::Result<()> {
        if matches!(self.pull, PullPolicy::Never) {
            return Ok(());
        }
        if matches!(self.pull, PullPolicy::IfNotPresent)
            && ctx.docker.inspect_image(&self.image).await.is_ok()
        {
            return Ok(());
        }
        let mut stream = ctx.docker.create_image(
            Some(CreateImageOptions {
                from_image: Some(self.image.clone()),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(item) = stream.next().await {
            item.with_context(|| format!("pull image '{}'", self.image))?;
        }
        Ok(())
    }

    pub async fn execute(
        &self,
        ctx: &ExecutionContext,
        record: &mut ExecutionRecord,
    ) -> anyhow::Result<()> {
        let container_id = if let Some(existing) = &self.existing_container {
            existing.clone()
        } else {
            self.ensure_image(ctx).await?;

            let env = self.env.clone();
            let cmd = shlex::split(&self.command)
                .with_context(|| format!("could not tokenize command '{}'", self.command))?;

            let host_config = HostConfig {
                binds: if self.volumes.is_empty() {
                    None
                } else {
                    Some(self.volumes.clone())
                },
                volumes_from: if self.volumes_from.is_empty() {
                    None
                } else {
                    Some(self.volumes_from.clone())
                },
                network_mode: self.network.clone(),
                ..Default::default()
            };

            let body = ContainerCreateBody {
                image: Some(self.image.clone()),
                cmd: Some(cmd),
                entrypoint: self.entrypoint.clone(),
                env: Some(env),
                hostname: self.hostname.clone(),
                host_config: Some(host_config),
                ..Default::default()
            };

            let created = ctx
                .docker
                .create_container(None::<CreateContainerOptions>, body)
                .await
                .context("create container")?;
            created.id
        };

        ctx.docker
            .start_container(&container_id, None::<StartContainerOptions>)
            .await
            .context("start container")?;

        let wait_fut = async {
            let mut logs = ctx.docker.logs(
                &container_id,
                Some(LogsOptions {
                    follow: true,
                    stdout: true,
                    stderr: true,
                    ..Default::default()
                }),
            );
            let mut wait = ctx.docker.wait_container(
                &container_id,
                None::<WaitContainerOptions>,
            );

            loop {
                tokio::select! {
                    log = logs.next() => {
                        match log {
                            Some(Ok(LogOutput::StdOut { message })) => {
                                record.stdout.push_str(&String::from_utf8_lossy(&message));
                            }
                            Some(Ok(LogOutput::StdErr { message })) => {
                                record.stderr.push_str(&String::from_utf8_lossy(&message));
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => return Err(anyhow::Error::from(e)),
                            None => {}
                        }
                    }
                    status = wait.next() => {
                        if let Some(status) = status {
                            let status = status?;
                            record.exit_code = Some(status.status_code);
                            return Ok(());
                        } else {
                            return Ok(());
                        }
                    }
                }
            }
        };

        let effective_timeout = if self.max_runtime.is_zero() {
            ctx.max_runtime
        } else {
            Some(self.max_runtime)
        };

        let timed_out = match effective_timeout {
            None => {
                tokio::select! {
                    res = wait_fut => { res?; false }
                    _ = ctx.cancellation.cancelled() => true,
                }
            }
            Some(timeout) => {
                tokio::select! {
                    res = wait_fut => { res?; false }
                    _ = tokio::time::sleep(timeout) => true,
                    _ = ctx.cancellation.cancelled() => true,
                }
            }
        };

        if timed_out {
            warn!(container = %container_id, "max_runtime elapsed or cancelled; stopping container");
            let _ = ctx.docker.stop_container(&container_id, None).await;
            record.error = Some("max_runtime exceeded or cancelled".into());
            record.exit_code = Some(1);
        } else {
            info!(container = %container_id, exit_code = ?record.exit_code, "run job finished");
        }

        if self.delete_on_exit {
            let _ = ctx
                .docker
                .remove_container(
                    &container_id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
        }

        Ok(())
    }
}

/// Parse a pull-policy string from config; unknown values default to
/// `IfNotPresent`.
pub fn parse_pull_policy(s: &str) -> PullPolicy {
    match s.to_ascii_lowercase().as_str() {
        "always" => PullPolicy::Always,
        "never" => PullPolicy::Never,
        _ => PullPolicy::IfNotPresent,
    }
}

