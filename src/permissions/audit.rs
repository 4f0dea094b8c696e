//! Append-only permission audit log.
//!
//! One JSON line per decision, written to `{config_root}/permissions-audit.log`
//! and mirrored in memory for inspection. Records are never mutated.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::{fs::OpenOptions, io::AsyncWriteExt, sync::Mutex};

/// One structured JSON line per permission decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// RFC-3339 timestamp of the decision.
    pub timestamp: String,
    /// What produced the decision: `"rule"` | `"remembered"` | `"prompt"` | `"default"`.
    #[serde(rename = "type")]
    pub kind: String,
    pub tool: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    /// `"allow"` or `"deny"`.
    pub decision: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// True when a human answered an interactive prompt.
    pub user: bool,
}

impl AuditRecord {
    pub fn new(kind: &str, tool: &str, resource: Option<String>, allow: bool) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            kind: kind.to_string(),
            tool: tool.to_string(),
            resource,
            decision: if allow { "allow" } else { "deny" }.to_string(),
            scope: None,
            reason: None,
            user: false,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn from_user(mut self) -> Self {
        self.user = true;
        self
    }
}

/// Append-only audit log with an in-memory mirror.
pub struct PermissionAudit {
    path: PathBuf,
    records: Mutex<Vec<AuditRecord>>,
}

impl PermissionAudit {
    pub fn new(config_root: &Path) -> Self {
        Self {
            path: config_root.join("permissions-audit.log"),
            records: Mutex::new(Vec::new()),
        }
    }

    /// Append a record to the log file and the in-memory mirror.
    ///
    /// A write failure is logged and the in-memory record kept; an audit IO
    /// error never blocks the permission decision itself.
    pub async fn append(&self, record: AuditRecord) {
        let line = match serde_json::to_string(&record) {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!(err = %e, "could not serialize audit record");
                return;
            }
        };

        if let Some(parent) = self.path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
        {
            Ok(mut file) => {
                if let Err(e) = file.write_all(format!("{line}\n").as_bytes()).await {
                    tracing::warn!(path = %self.path.display(), err = %e, "audit append failed");
                }
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), err = %e, "could not open audit log");
            }
        }

        self.records.lock().await.push(record);
    }

    /// Snapshot of all records appended by this process.
    pub async fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().await.clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
