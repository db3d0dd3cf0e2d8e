//! Persist each execution record to disk as JSON (spec.md §6, §1
//! "persistence to disk: optional middleware; only the hook points are
//! specified here").

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use tracing::warn;

use crate::history::ExecutionRecord;
use crate::middleware::Middleware;

#[derive(Debug, Clone)]
pub struct SaveToDiskMiddleware {
    pub folder: PathBuf,
    pub only_on_error: bool,
}

#[async_trait]
impl Middleware for SaveToDiskMiddleware {
    async fn after(&self, job_name: &str, record: &ExecutionRecord) {
        if self.only_on_error && record.is_success() {
            return;
        }
        if let Err(e) = self.write(job_name, record).await {
            warn!(job = %job_name, error = ?e, "failed to save execution record to disk");
        }
    }

    fn name(&self) -> &'static str {
        "save-to-disk"
    }
}

impl SaveToDiskMiddleware {
    async fn write(&self, job_name: &str, record: &ExecutionRecord) -> anyhow::Result<()> {
        let dir = self.folder.join(job_name);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{:020}.json", record.id));
        let json = serde_json::to_vec_pretty(record)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }
}

/// Restore a job's history from disk on boot, honoring
/// `restore-history-max-age` (spec.md §6). Records newer than `max_age` are
/// returned oldest-first, ready to feed into a fresh `HistoryRing`.
pub async fn restore_history(
    folder: &Path,
    job_name: &str,
    max_age: Option<std::time::Duration>,
) -> Vec<ExecutionRecord> {
    let dir = folder.join(job_name);
    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(e) => e,
        Err(_) => return Vec::new(),
    };

    let cutoff = max_age.and_then(|d| ChronoDuration::from_std(d).ok()).map(|d| Utc::now() - d);
    let mut records = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let Ok(bytes) = tokio::fs::read(entry.path()).await else {
            continue;
        };
        let Ok(record) = serde_json::from_slice::<ExecutionRecord>(&bytes) else {
            continue;
        };
        if let Some(cutoff) = cutoff {
            if record.started_at < cutoff {
                continue;
            }
        }
        records.push(record);
    }
    records.sort_by_key(|r| r.id);
    records
}
