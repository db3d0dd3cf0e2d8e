//! Slack notification middleware: posts a message to an incoming webhook
//! URL when a job fails, rate-limited by the global `notification-cooldown`
//! (spec.md §6).

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::warn;

use crate::history::ExecutionRecord;
use crate::middleware::Middleware;

#[derive(Debug)]
pub struct SlackMiddleware {
    webhook_url: String,
    client: reqwest::Client,
    cooldown: Duration,
    last_sent: Mutex<Option<Instant>>,
}

impl SlackMiddleware {
    pub fn new(webhook_url: String, cooldown: Duration) -> Self {
        Self {
            webhook_url,
            client: reqwest::Client::new(),
            cooldown,
            last_sent: Mutex::new(None),
        }
    }

    async fn should_send(&self) -> bool {
        let mut guard = self.last_sent.lock().await;
        let now = Instant::now();
        if let Some(last) = *guard {
            if now.duration_since(last) < self.cooldown {
                return false;
            }
        }
        *guard = Some(now);
        true
    }
}

#[async_trait]
impl Middleware for SlackMiddleware {
    async fn after(&self, job_name: &str, record: &ExecutionRecord) {
        if !record.is_failure() {
            return;
        }
        if !self.should_send().await {
            return;
        }

        let body = json!({
            "text": format!(
                "job `{}` finished with outcome {:?}{}",
                job_name,
                record.outcome,
                record.error.as_deref().map(|e| format!(": {}", e)).unwrap_or_default(),
            )
        });

        if let Err(e) = self.client.post(&self.webhook_url).json(&body).send().await {
            warn!(job = %job_name, error = ?e, "failed to deliver slack notification");
        }
    }

    fn name(&self) -> &'static str {
        "slack"
    }
}
