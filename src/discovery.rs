//! Container Discovery (C5): keeps a live view of containers carrying the
//! "service enabled" label, feeding the reconciler (spec.md §4.5).
//!
//! Grounded on the teacher's `job::discover()` label scan, generalized from
//! a one-shot startup scan into a continuous watcher: a Docker event stream
//! primary with a polling fallback, matching how the teacher already reads
//! `DOCKER_HOST`/labels once but extended to the ongoing-discovery model
//! spec.md §4.5 requires.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bollard::Docker;
use bollard::query_parameters::{EventsOptions, ListContainersOptions};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// One container's identity and labels, as seen at snapshot time.
#[derive(Debug, Clone)]
pub struct ContainerSnapshot {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
}

/// Watches the Docker daemon for containers carrying the configured
/// prefix's `.enabled` label.
#[derive(Clone)]
pub struct Discovery {
    docker: Arc<Docker>,
    poll_interval: Duration,
    poll_disabled: bool,
}

impl Discovery {
    pub fn new(docker: Arc<Docker>, poll_interval: Duration, poll_disabled: bool) -> Self {
        Self {
            docker,
            poll_interval,
            poll_disabled,
        }
    }

    /// One-shot listing of every running container and its labels.
    /// Filtering to containers that actually opted in happens downstream in
    /// `config::labels`, which needs the full label set to resolve the
    /// required label across every configured prefix.
    pub async fn snapshot(&self) -> anyhow::Result<Vec<ContainerSnapshot>> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: false,
                ..Default::default()
            }))
            .await?;

        Ok(containers
            .into_iter()
            .map(|c| ContainerSnapshot {
                id: c.id.unwrap_or_default(),
                name: c
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                labels: c.labels.unwrap_or_default(),
            })
            .collect())
    }

    /// Push a fresh snapshot down `tx` on startup, on every relevant Docker
    /// container lifecycle event, and on every `poll_interval` tick (unless
    /// polling is disabled). If the event stream errors or ends, polling
    /// becomes the sole source rather than the watcher giving up (spec.md
    /// §4.5: "polling fallback when the event stream errors").
    pub fn watch(&self, tx: mpsc::Sender<Vec<ContainerSnapshot>>, cancel: CancellationToken) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            if let Ok(snap) = this.snapshot().await {
                let _ = tx.send(snap).await;
            }

            let mut event_filters = HashMap::new();
            event_filters.insert("type".to_string(), vec!["container".to_string()]);
            event_filters.insert(
                "event".to_string(),
                vec!["start".into(), "die".into(), "stop".into(), "destroy".into()],
            );

            let mut events = this.docker.events(Some(EventsOptions {
                filters: Some(event_filters),
                ..Default::default()
            }));
            let mut event_stream_alive = true;

            let mut poll = tokio::time::interval(this.poll_interval.max(Duration::from_secs(1)));
            poll.tick().await; // first tick is immediate; the initial snapshot above already covers it

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("discovery watcher stopped");
                        return;
                    }
                    event = events.next(), if event_stream_alive => {
                        match event {
                            Some(Ok(_)) => {
                                match this.snapshot().await {
                                    Ok(snap) => { let _ = tx.send(snap).await; }
                                    Err(e) => warn!(error = %e, "discovery snapshot failed after docker event"),
                                }
                            }
                            Some(Err(e)) => {
                                warn!(error = %e, "docker event stream error; falling back to polling");
                                event_stream_alive = false;
                            }
                            None => {
                                warn!("docker event stream ended; falling back to polling");
                                event_stream_alive = false;
                            }
                        }
                    }
                    _ = poll.tick(), if !this.poll_disabled || !event_stream_alive => {
                        match this.snapshot().await {
                            Ok(snap) => { let _ = tx.send(snap).await; }
                            Err(e) => warn!(error = %e, "discovery poll failed"),
                        }
                    }
                }
            }
        })
    }
}
