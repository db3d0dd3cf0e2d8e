//! ServiceRun job: submit a one-shot swarm service, wait for it to settle,
//! collect logs, then remove the service.
//!
//! Grounded on the teacher's container lifecycle handling (`job.rs`),
//! generalized to the swarm service API bollard exposes alongside the
//! container API.

use std::time::Duration;

use anyhow::Context as _;
use bollard::models::{
    ContainerSpec, EndpointSpec, ServiceSpec, ServiceSpecMode, ServiceSpecModeReplicatedJob,
    TaskSpec,
};
use bollard::query_parameters::{RemoveServiceOptions, TasksOptions};
use bollard::service::CreateServiceOptions;
use futures::StreamExt;
use tracing::{info, warn};

use crate::error::ConfigError;
use crate::history::ExecutionRecord;
use crate::job::ExecutionContext;

#[derive(Debug, Clone)]
pub struct ServiceRunJob {
    pub image: String,
    pub command: String,
    pub network: Option<String>,
    pub tty: bool,
    pub delete_on_exit: bool,
    /// `Duration::ZERO` means unbounded.
    pub max_runtime: Duration,
}

impl ServiceRunJob {
    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.image.trim().is_empty() {
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
        buf.extend_from_slice(self.image.as_bytes());
        buf.push(0);
        buf.extend_from_slice(self.command.as_bytes());
        buf.push(0);
        buf.extend_from_slice(self.network.as_deref().unwrap_or("").as_bytes());
        buf.push(self.tty as u8);
        buf.push(self.delete_on_exit as u8);
        buf.extend_from_slice(&self.max_runtime.as_millis().to_le_bytes());
        buf
    }

    pub async fn execute(
        &self,
        ctx: &ExecutionContext,
        record: &mut ExecutionRecord,
    ) -> anyhow::Result<()> {
        let cmd = shlex::split(&self.command)
            .with_context(|| format!("could not tokenize command '{}'", self.command))?;

        let service_name = format!("ofelia-run-{}", &record.id);

        let spec = ServiceSpec {
            name: Some(service_name.clone()),
            task_template: Some(TaskSpec {
                container_spec: Some(ContainerSpec {
                    image: Some(self.image.clone()),
                    command: Some(cmd),
                    tty: Some(self.tty),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            mode: Some(ServiceSpecMode {
                replicated_job: Some(ServiceSpecModeReplicatedJob {
                    max_concurrent: Some(1),
                    total_completions: Some(1),
                }),
                ..Default::default()
            }),
            endpoint_spec: self.network.as_ref().map(|_| EndpointSpec::default()),
            ..Default::default()
        };

        let created = ctx
            .docker
            .create_service(spec, None::<CreateServiceOptions>)
            .await
            .context("create swarm service")?;
        let service_id = created.id.unwrap_or(service_name.clone());

        let settle = async {
            loop {
                let tasks = ctx
                    .docker
                    .list_tasks(Some(TasksOptions {
                        filters: Some(
                            [("service".to_string(), vec![service_id.clone()])]
                                .into_iter()
                                .collect(),
                        ),
                    }))
                    .await
                    .context("list tasks")?;

                let settled = tasks.iter().all(|t| {
                    matches!(
                        t.status.as_ref().and_then(|s| s.state.as_ref()),
                        Some(bollard::models::TaskState::COMPLETE)
                            | Some(bollard::models::TaskState::FAILED)
                            | Some(bollard::models::TaskState::SHUTDOWN)
                            | Some(bollard::models::TaskState::REJECTED)
                    )
                });

                if settled && !tasks.is_empty() {
                    let failed = tasks.iter().any(|t| {
                        matches!(
                            t.status.as_ref().and_then(|s| s.state.as_ref()),
                            Some(bollard::models::TaskState::FAILED)
                                | Some(bollard::models::TaskState::REJECTED)
                        )
                    });
                    record.exit_code = Some(if failed { 1 } else { 0 });
                    return anyhow::Ok(());
                }

                tokio::time::sleep(Duration::from_millis(500)).await;
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
                    res = settle => { res?; false }
                    _ = ctx.cancellation.cancelled() => true,
                }
            }
            Some(timeout) => {
                tokio::select! {
                    res = settle => { res?; false }
                    _ = tokio::time::sleep(timeout) => true,
                    _ = ctx.cancellation.cancelled() => true,
                }
            }
        };

        if timed_out {
            warn!(service = %service_name, "max_runtime exceeded or cancelled");
            record.error = Some("max_runtime exceeded or cancelled".into());
            record.exit_code = Some(1);
        } else {
            info!(service = %service_name, exit_code = ?record.exit_code, "service run finished");
        }

        if self.delete_on_exit {
            let _ = ctx
                .docker
                .remove_service(&service_id, None::<RemoveServiceOptions>)
                .await;
        }

        Ok(())
    }
}
