// crates/shadow/src/notifications.rs
//! Fire-and-forget notification sink.
//!
//! The GUI reads `~/.hindsight-notifications.json`, an array of at most the
//! 10 newest records. There is no consumer ACK; the file is rewritten
//! atomically (temp + rename) on every record. Records carry repository and
//! file *names*, never absolute paths.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;

/// Maximum records kept in the sink file.
const MAX_RECORDS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    /// ISO-8601.
    pub timestamp: String,
    /// Event type, e.g. "shadow-commit", "repository-disabled".
    #[serde(rename = "type")]
    pub kind: String,
    /// Repository name (basename of the root), not a path.
    pub repository: String,
    /// Repo-relative file path.
    pub file: String,
    pub branch: String,
    pub commit_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Writes the notification ring file.
#[derive(Clone)]
pub struct NotificationSink {
    path: PathBuf,
}

impl NotificationSink {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Open the sink at the canonical home location, if resolvable.
    pub fn default_sink() -> Option<Self> {
        hindsight_core::paths::notifications_path().map(Self::new)
    }

    /// Prepend a record, keep the newest 10, rewrite atomically. Failures
    /// are logged and swallowed — notifications are best-effort by design.
    pub async fn record(&self, record: NotificationRecord) {
        let mut records = self.read_all().await;
        records.insert(0, record);
        records.truncate(MAX_RECORDS);

        let json = match serde_json::to_string_pretty(&records) {
            Ok(json) => json,
            Err(e) => {
                debug!(error = %e, "failed to serialize notifications");
                return;
            }
        };

        let tmp = self.path.with_extension("json.tmp");
        if let Err(e) = tokio::fs::write(&tmp, json).await {
            debug!(error = %e, "failed to stage notifications file");
            return;
        }
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            debug!(error = %e, "failed to publish notifications file");
        }
    }

    pub async fn read_all(&self) -> Vec<NotificationRecord> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }
}
