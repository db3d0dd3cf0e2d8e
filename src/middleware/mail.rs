//! Mail notification middleware: sends an email via SMTP on job failure,
//! grounded on `loco-rs`'s use of `lettre` for outbound mail in the
//! retrieval pack.

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::warn;

use crate::history::ExecutionRecord;
use crate::middleware::Middleware;

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
}

#[derive(Debug)]
pub struct MailMiddleware {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: String,
    to: Vec<String>,
}

impl MailMiddleware {
    pub fn new(config: SmtpConfig, to: Vec<String>) -> anyhow::Result<Self> {
        let creds = Credentials::new(config.username, config.password);
        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)?
            .port(config.port)
            .credentials(creds)
            .build();
        Ok(Self {
            transport,
            from: config.from,
            to,
        })
    }
}

#[async_trait]
impl Middleware for MailMiddleware {
    async fn after(&self, job_name: &str, record: &ExecutionRecord) {
        if !record.is_failure() || self.to.is_empty() {
            return;
        }

        let subject = format!("[ofelia-rs] job '{}' {:?}", job_name, record.outcome);
        let body = format!(
            "job: {}\noutcome: {:?}\nexit_code: {:?}\nerror: {}\n\nstdout:\n{}\n\nstderr:\n{}\n",
            job_name,
            record.outcome,
            record.exit_code,
            record.error.as_deref().unwrap_or(""),
            record.stdout,
            record.stderr,
        );

        for recipient in &self.to {
            let message = match Message::builder()
                .from(self.from.parse().unwrap_or_else(|_| {
                    "ofelia-rs@localhost".parse().expect("valid fallback address")
                }))
                .to(match recipient.parse() {
                    Ok(addr) => addr,
                    Err(e) => {
                        warn!(job = %job_name, to = %recipient, error = ?e, "invalid mail recipient");
                        continue;
                    }
                })
                .subject(subject.clone())
                .body(body.clone())
            {
                Ok(m) => m,
                Err(e) => {
                    warn!(job = %job_name, error = ?e, "failed to build mail message");
                    continue;
                }
            };

            if let Err(e) = self.transport.send(message).await {
                warn!(job = %job_name, to = %recipient, error = ?e, "failed to deliver mail notification");
            }
        }
    }

    fn name(&self) -> &'static str {
        "mail"
    }
}
