//! Generic webhook delivery middleware (spec.md §6 `[webhook "<name>"]`
//! sections): POSTs a JSON payload with bounded retries.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::warn;

use crate::history::{ExecutionRecord, Outcome};
use crate::middleware::Middleware;

/// Which outcomes cause a webhook to fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Always,
    OnFailure,
    OnSuccess,
}

impl Trigger {
    pub fn matches(self, outcome: Outcome) -> bool {
        match self {
            Trigger::Always => true,
            Trigger::OnFailure => matches!(outcome, Outcome::Failed | Outcome::Error),
            Trigger::OnSuccess => matches!(outcome, Outcome::Ok),
        }
    }

    pub fn parse(s: &str) -> Trigger {
        match s.to_ascii_lowercase().as_str() {
            "success" | "on-success" => Trigger::OnSuccess,
            "failure" | "on-failure" | "error" => Trigger::OnFailure,
            _ => Trigger::Always,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub name: String,
    pub url: String,
    pub preset: Option<String>,
    pub id: Option<String>,
    pub secret: Option<String>,
    pub trigger: Trigger,
    pub timeout: Duration,
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub link: Option<String>,
    pub link_text: Option<String>,
}

#[derive(Debug)]
pub struct WebhookMiddleware {
    config: WebhookConfig,
    client: reqwest::Client,
}

impl WebhookMiddleware {
    pub fn new(config: WebhookConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    async fn deliver(&self, job_name: &str, record: &ExecutionRecord) -> anyhow::Result<()> {
        let mut payload = json!({
            "id": self.config.id,
            "preset": self.config.preset,
            "job": job_name,
            "outcome": format!("{:?}", record.outcome),
            "exit_code": record.exit_code,
            "error": record.error,
            "link": self.config.link,
            "link_text": self.config.link_text,
        });
        if let Some(secret) = &self.config.secret {
            payload["secret"] = json!(secret);
        }

        let mut attempt = 0u32;
        loop {
            let res = self.client.post(&self.config.url).json(&payload).send().await;
            match res {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => {
                    if attempt >= self.config.retry_count {
                        anyhow::bail!("webhook '{}' responded with {}", self.config.name, resp.status());
                    }
                }
                Err(e) => {
                    if attempt >= self.config.retry_count {
                        return Err(e.into());
                    }
                }
            }
            attempt += 1;
            tokio::time::sleep(self.config.retry_delay).await;
        }
    }
}

#[async_trait]
impl Middleware for WebhookMiddleware {
    async fn after(&self, job_name: &str, record: &ExecutionRecord) {
        if !self.config.trigger.matches(record.outcome) {
            return;
        }
        if let Err(e) = self.deliver(job_name, record).await {
            warn!(job = %job_name, webhook = %self.config.name, error = ?e, "webhook delivery failed after retries");
        }
    }

    fn name(&self) -> &'static str {
        "webhook"
    }
}
