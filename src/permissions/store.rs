//! Remembered permission decisions.
//!
//! A decision the user chose to remember maps `(tool, resource)` to an
//! allow/deny with a scope: `once` is never stored, `session` lives for the
//! process lifetime, `always` is persisted to
//! `{config_root}/permission-decisions.json` and reloaded at startup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::rules::RuleAction;

/// Lifetime of a remembered decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionScope {
    Once,
    Session,
    Always,
}

impl DecisionScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionScope::Once => "once",
            DecisionScope::Session => "session",
            DecisionScope::Always => "always",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RememberedDecision {
    pub tool: String,
    pub resource: String,
    pub action: RuleAction,
    pub scope: DecisionScope,
    pub timestamp: DateTime<Utc>,
}

/// In-memory and on-disk store of remembered decisions.
pub struct DecisionStore {
    path: PathBuf,
    /// `always` entries, persisted.
    always: RwLock<HashMap<String, RememberedDecision>>,
    /// `session` entries, process lifetime only.
    session: RwLock<HashMap<String, RememberedDecision>>,
}

fn key(tool: &str, resource: &str) -> String {
    format!("{tool}\u{1f}{resource}")
}

impl DecisionStore {
    /// Open the store, loading any persisted `always` decisions.
    pub fn open(config_root: &Path) -> Self {
        let path = config_root.join("permission-decisions.json");
        let always = match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<Vec<RememberedDecision>>(&contents) {
                Ok(entries) => entries
                    .into_iter()
                    .map(|d| (key(&d.tool, &d.resource), d))
                    .collect(),
                Err(e) => {
                    tracing::warn!(path = %path.display(), err = %e, "corrupt decision store — starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        Self {
            path,
            always: RwLock::new(always),
            session: RwLock::new(HashMap::new()),
        }
    }

    /// Look up a remembered decision. `always` entries take precedence over
    /// `session` entries for the same key.
    pub async fn lookup(&self, tool: &str, resource: &str) -> Option<RememberedDecision> {
        let k = key(tool, resource);
        if let Some(d) = self.always.read().await.get(&k) {
            return Some(d.clone());
        }
        self.session.read().await.get(&k).cloned()
    }

    /// Remember a decision with the given scope.
    ///
    /// `Once` decisions are deliberately not stored.
    pub async fn remember(
        &self,
        tool: &str,
        resource: &str,
        action: RuleAction,
        scope: DecisionScope,
    ) {
        let decision = RememberedDecision {
            tool: tool.to_string(),
            resource: resource.to_string(),
            action,
            scope,
            timestamp: Utc::now(),
        };
        let k = key(tool, resource);
        match scope {
            DecisionScope::Once => {}
            DecisionScope::Session => {
                self.session.write().await.insert(k, decision);
            }
            DecisionScope::Always => {
                self.always.write().await.insert(k, decision);
                self.persist().await;
            }
        }
    }

    async fn persist(&self) {
        let entries: Vec<RememberedDecision> =
            self.always.read().await.values().cloned().collect();
        let json = match serde_json::to_string_pretty(&entries) {
            Ok(j) => j,
            Err(e) => {
                tracing::warn!(err = %e, "could not serialize decision store");
                return;
            }
        };
        if let Some(parent) = self.path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        if let Err(e) = tokio::fs::write(&self.path, json).await {
            tracing::warn!(path = %self.path.display(), err = %e, "could not persist decision store");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn once_is_never_stored() {
        let dir = TempDir::new().unwrap();
        let store = DecisionStore::open(dir.path());
        store
            .remember("Bash", "npm test", RuleAction::Allow, DecisionScope::Once)
            .await;
        assert!(store.lookup("Bash", "npm test").await.is_none());
    }

    #[tokio::test]
    async fn session_lives_in_memory_only() {
        let dir = TempDir::new().unwrap();
        let store = DecisionStore::open(dir.path());
        store
            .remember("Bash", "npm test", RuleAction::Deny, DecisionScope::Session)
            .await;
        assert_eq!(
            store.lookup("Bash", "npm test").await.unwrap().action,
            RuleAction::Deny
        );

        // A fresh store (new process) does not see session entries.
        let reopened = DecisionStore::open(dir.path());
        assert!(reopened.lookup("Bash", "npm test").await.is_none());
    }

    #[tokio::test]
    async fn always_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let store = DecisionStore::open(dir.path());
        store
            .remember("Write", "/tmp/a.txt", RuleAction::Allow, DecisionScope::Always)
            .await;

        let reopened = DecisionStore::open(dir.path());
        let d = reopened.lookup("Write", "/tmp/a.txt").await.unwrap();
        assert_eq!(d.action, RuleAction::Allow);
        assert_eq!(d.scope, DecisionScope::Always);
    }
}
