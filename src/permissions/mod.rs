//! `permissions` — the gate every side-effectful tool invocation passes
//! through before an executor runs it.
//!
//! Decision order is strict:
//!
//! 1. Any matching deny rule refuses the call.
//! 2. Any matching allow rule permits it.
//! 3. A remembered decision (`always`, then `session`) applies.
//! 4. The interactive prompt surface, when wired, is asked with a bounded
//!    timeout.
//! 5. The caller's default action applies.
//!
//! Every decision is appended to the audit log, whatever produced it.

pub mod audit;
pub mod store;

pub use audit::{AuditRecord, PermissionAudit};
pub use store::{DecisionScope, DecisionStore, RememberedDecision};

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::rules::{PermissionRule, RuleAction, RuleDecision, RuleSet, ToolInvocation};

/// Default deadline for an interactive prompt before falling back.
pub const DEFAULT_PROMPT_TIMEOUT: Duration = Duration::from_secs(60);

// ─── Prompt surface (collaborator) ────────────────────────────────────────────

/// What the prompt surface shows the user.
#[derive(Debug, Clone)]
pub struct PermissionRequest {
    pub tool: String,
    pub resource: String,
}

/// The user's answer.
#[derive(Debug, Clone)]
pub struct PromptResponse {
    pub action: RuleAction,
    /// When set, the decision is remembered with this scope.
    pub remember: Option<DecisionScope>,
    pub reason: Option<String>,
}

/// Interactive prompt collaborator. The terminal UI implements this; tests
/// substitute a canned responder.
#[async_trait]
pub trait PromptSurface: Send + Sync {
    /// Ask the user. `None` means the surface could not obtain an answer.
    async fn request(&self, req: PermissionRequest) -> Option<PromptResponse>;
}

// ─── Gate decision ────────────────────────────────────────────────────────────

/// What produced a gate decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecisionBasis {
    Rule,
    Remembered,
    Prompt,
    Default,
}

impl DecisionBasis {
    fn as_str(&self) -> &'static str {
        match self {
            DecisionBasis::Rule => "rule",
            DecisionBasis::Remembered => "remembered",
            DecisionBasis::Prompt => "prompt",
            DecisionBasis::Default => "default",
        }
    }
}

/// The outcome handed back to the executor.
#[derive(Debug, Clone)]
pub struct GateDecision {
    pub action: RuleAction,
    pub basis: DecisionBasis,
    /// Human-readable explanation: the matching rule, the remembered scope,
    /// or the timeout that forced the default.
    pub reason: String,
}

impl GateDecision {
    pub fn allowed(&self) -> bool {
        self.action == RuleAction::Allow
    }
}

// ─── Permission gate ──────────────────────────────────────────────────────────

pub struct PermissionGate {
    rules: RwLock<RuleSet>,
    store: DecisionStore,
    audit: PermissionAudit,
    prompt: Option<Arc<dyn PromptSurface>>,
    prompt_timeout: Duration,
}

impl PermissionGate {
    pub fn new(config_root: &Path, rules: RuleSet) -> Self {
        Self {
            rules: RwLock::new(rules),
            store: DecisionStore::open(config_root),
            audit: PermissionAudit::new(config_root),
            prompt: None,
            prompt_timeout: DEFAULT_PROMPT_TIMEOUT,
        }
    }

    pub fn with_prompt(mut self, prompt: Arc<dyn PromptSurface>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    pub fn with_prompt_timeout(mut self, timeout: Duration) -> Self {
        self.prompt_timeout = timeout;
        self
    }

    /// Add rules at runtime (e.g. session rules created from prompt answers).
    pub async fn add_rule(&self, rule: PermissionRule) {
        self.rules.write().await.push(rule);
    }

    pub fn audit(&self) -> &PermissionAudit {
        &self.audit
    }

    pub fn decisions(&self) -> &DecisionStore {
        &self.store
    }

    /// Decide whether `tool` may run with `params`.
    pub async fn check(
        &self,
        tool: &str,
        params: &serde_json::Value,
        default: RuleAction,
    ) -> GateDecision {
        let resource = resource_of(params);
        let inv = ToolInvocation { tool, params };

        // 1+2. Rules, deny over allow.
        let rule_decision = self.rules.read().await.evaluate(&inv, default);
        match &rule_decision {
            RuleDecision::Deny { rule } | RuleDecision::Allow { rule } => {
                let allow = rule_decision.action() == RuleAction::Allow;
                let reason = format!("rule {}", rule.canonical());
                self.audit
                    .append(
                        AuditRecord::new("rule", tool, resource.clone(), allow)
                            .with_reason(reason.clone()),
                    )
                    .await;
                return GateDecision {
                    action: rule_decision.action(),
                    basis: DecisionBasis::Rule,
                    reason,
                };
            }
            RuleDecision::Default { .. } => {}
        }

        // 3. Remembered decisions.
        let resource_str = resource.clone().unwrap_or_default();
        if let Some(remembered) = self.store.lookup(tool, &resource_str).await {
            let allow = remembered.action == RuleAction::Allow;
            let reason = format!("remembered ({})", remembered.scope.as_str());
            self.audit
                .append(
                    AuditRecord::new("remembered", tool, resource.clone(), allow)
                        .with_scope(remembered.scope.as_str())
                        .with_reason(reason.clone()),
                )
                .await;
            return GateDecision {
                action: remembered.action,
                basis: DecisionBasis::Remembered,
                reason,
            };
        }

        // 4. Interactive prompt, bounded.
        if let Some(prompt) = &self.prompt {
            let req = PermissionRequest {
                tool: tool.to_string(),
                resource: resource_str.clone(),
            };
            match tokio::time::timeout(self.prompt_timeout, prompt.request(req)).await {
                Ok(Some(response)) => {
                    if let Some(scope) = response.remember {
                        self.store
                            .remember(tool, &resource_str, response.action, scope)
                            .await;
                    }
                    let allow = response.action == RuleAction::Allow;
                    let reason = response
                        .reason
                        .clone()
                        .unwrap_or_else(|| "user decision".to_string());
                    let mut record = AuditRecord::new("prompt", tool, resource.clone(), allow)
                        .from_user()
                        .with_reason(reason.clone());
                    if let Some(scope) = response.remember {
                        record = record.with_scope(scope.as_str());
                    }
                    self.audit.append(record).await;
                    return GateDecision {
                        action: response.action,
                        basis: DecisionBasis::Prompt,
                        reason,
                    };
                }
                Ok(None) => {
                    tracing::warn!(tool, "prompt surface returned no answer — using default");
                }
                Err(_) => {
                    tracing::warn!(
                        tool,
                        timeout_secs = self.prompt_timeout.as_secs(),
                        "permission prompt timed out — using default"
                    );
                    let reason = format!(
                        "prompt timed out after {}s, default applied",
                        self.prompt_timeout.as_secs()
                    );
                    self.audit
                        .append(
                            AuditRecord::new("default", tool, resource.clone(), default == RuleAction::Allow)
                                .with_reason(reason.clone()),
                        )
                        .await;
                    return GateDecision {
                        action: default,
                        basis: DecisionBasis::Default,
                        reason,
                    };
                }
            }
        }

        // 5. Default.
        let allow = default == RuleAction::Allow;
        self.audit
            .append(AuditRecord::new("default", tool, resource, allow))
            .await;
        GateDecision {
            action: default,
            basis: DecisionBasis::Default,
            reason: "no matching rule or remembered decision".to_string(),
        }
    }
}

/// The argument a decision is keyed on: the command string for shell tools,
/// the file path for file tools.
fn resource_of(params: &serde_json::Value) -> Option<String> {
    params
        .get("command")
        .or_else(|| params.get("file_path"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}
