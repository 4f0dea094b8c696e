//! `hooks` — user-registered callbacks at lifecycle events.
//!
//! Hooks run sequentially in registration order for one dispatch. A hook
//! declared `blocking` whose result reports `blocked` short-circuits the
//! rest of the run; everything else is observational.

pub mod config;
pub mod dispatch;
pub mod model;

pub use config::{load_hooks_dir, load_hooks_value};
pub use dispatch::{HookDelegate, NullHookDelegate};
pub use model::{
    HookEvent, HookInput, HookMatcher, HookResult, HookSpec, RegisteredHook,
};

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;

use crate::rules::RuleAction;

#[derive(Debug, Error)]
pub enum HookError {
    #[error("invalid hook matcher: {0}")]
    InvalidMatcher(String),
}

// ─── Registry ─────────────────────────────────────────────────────────────────

/// Ordered collection of registered hooks.
#[derive(Default)]
pub struct HookRegistry {
    hooks: RwLock<Vec<RegisteredHook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook. The matcher string, when present, is validated here
    /// so dispatch never sees an uncompilable pattern.
    pub async fn register(
        &self,
        event: HookEvent,
        matcher: Option<&str>,
        spec: HookSpec,
    ) -> Result<(), HookError> {
        let matcher = matcher.map(HookMatcher::parse).transpose()?;
        self.hooks.write().await.push(RegisteredHook {
            event,
            matcher,
            spec,
        });
        Ok(())
    }

    /// Drop every registration. Tests use this between scenarios.
    pub async fn clear(&self) {
        self.hooks.write().await.clear();
    }

    pub async fn count(&self) -> usize {
        self.hooks.read().await.len()
    }

    /// Hooks for one event, in registration order, matcher-filtered.
    pub(crate) async fn select(&self, input: &HookInput) -> Vec<RegisteredHook> {
        self.hooks
            .read()
            .await
            .iter()
            .filter(|h| h.event == input.event)
            .filter(|h| {
                h.matcher
                    .as_ref()
                    .map(|m| m.matches(input.tool_name.as_deref()))
                    .unwrap_or(true)
            })
            .cloned()
            .collect()
    }
}

// ─── Dispatcher ───────────────────────────────────────────────────────────────

pub struct HookDispatcher {
    registry: HookRegistry,
    executor: dispatch::HookExecutor,
}

impl Default for HookDispatcher {
    fn default() -> Self {
        Self::new(Arc::new(NullHookDelegate))
    }
}

impl HookDispatcher {
    pub fn new(delegate: Arc<dyn HookDelegate>) -> Self {
        Self {
            registry: HookRegistry::new(),
            executor: dispatch::HookExecutor::new(delegate),
        }
    }

    pub fn registry(&self) -> &HookRegistry {
        &self.registry
    }

    /// Run all hooks matching the input, in order, stopping after the first
    /// blocked result from a blocking hook. Returns the ordered results of
    /// the hooks that actually ran.
    pub async fn dispatch(&self, input: &HookInput) -> Vec<HookResult> {
        let selected = self.registry.select(input).await;
        let mut results = Vec::with_capacity(selected.len());

        for hook in &selected {
            let result = self.executor.run(hook, input).await;
            let stop = result.blocked && hook.spec.is_blocking();
            tracing::debug!(
                event = input.event.as_str(),
                hook_type = hook.spec.type_name(),
                success = result.success,
                blocked = result.blocked,
                "hook executed"
            );
            results.push(result);
            if stop {
                tracing::info!(
                    event = input.event.as_str(),
                    ran = results.len(),
                    skipped = selected.len() - results.len(),
                    "blocking hook blocked — dispatch short-circuited"
                );
                break;
            }
        }

        results
    }
}

// ─── Aggregation helpers ──────────────────────────────────────────────────────

/// The first blocked result of a dispatch run, if any.
pub fn first_blocked(results: &[HookResult]) -> Option<&HookResult> {
    results.iter().find(|r| r.blocked)
}

/// Scan permission-request hook results for the first explicit
/// `allow`/`deny` decision.
pub fn permission_decision(results: &[HookResult]) -> Option<RuleAction> {
    results.iter().find_map(|r| match r.decision.as_deref() {
        Some("allow") => Some(RuleAction::Allow),
        Some("deny") => Some(RuleAction::Deny),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn command_spec(command: &str, blocking: bool) -> HookSpec {
        HookSpec::Command {
            command: command.to_string(),
            args: vec![],
            env: Default::default(),
            timeout: Some(5),
            blocking,
        }
    }

    #[tokio::test]
    async fn dispatch_runs_hooks_in_registration_order() {
        let dispatcher = HookDispatcher::default();
        let reg = dispatcher.registry();
        reg.register(HookEvent::PreToolUse, None, command_spec("echo first", false))
            .await
            .unwrap();
        reg.register(HookEvent::PreToolUse, None, command_spec("echo second", false))
            .await
            .unwrap();

        let input = HookInput::for_event(HookEvent::PreToolUse).with_tool("Bash", json!({}));
        let results = dispatcher.dispatch(&input).await;
        assert_eq!(results.len(), 2);
        assert!(results[0].output.contains("first"));
        assert!(results[1].output.contains("second"));
    }

    #[tokio::test]
    async fn blocking_hook_short_circuits() {
        let dispatcher = HookDispatcher::default();
        let reg = dispatcher.registry();
        // Exit 1 with a blocked:true JSON body — a block, not a failure.
        reg.register(
            HookEvent::PreToolUse,
            None,
            command_spec(r#"echo '{"blocked":true,"message":"no"}'; exit 1"#, true),
        )
        .await
        .unwrap();
        reg.register(HookEvent::PreToolUse, None, command_spec("echo never", false))
            .await
            .unwrap();

        let input = HookInput::for_event(HookEvent::PreToolUse).with_tool("Bash", json!({}));
        let results = dispatcher.dispatch(&input).await;
        assert_eq!(results.len(), 1);
        assert!(results[0].blocked);
        assert!(results[0].error.is_none(), "blocked is not a failure");
        assert!(first_blocked(&results).is_some());
    }

    #[tokio::test]
    async fn non_blocking_blocked_result_does_not_short_circuit() {
        let dispatcher = HookDispatcher::default();
        let reg = dispatcher.registry();
        reg.register(
            HookEvent::PreToolUse,
            None,
            command_spec(r#"echo '{"blocked":true}'; exit 1"#, false),
        )
        .await
        .unwrap();
        reg.register(HookEvent::PreToolUse, None, command_spec("echo after", false))
            .await
            .unwrap();

        let input = HookInput::for_event(HookEvent::PreToolUse).with_tool("Bash", json!({}));
        let results = dispatcher.dispatch(&input).await;
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn matcher_filters_by_tool_name() {
        let dispatcher = HookDispatcher::default();
        let reg = dispatcher.registry();
        reg.register(HookEvent::PreToolUse, Some("Bash"), command_spec("echo bash", false))
            .await
            .unwrap();
        reg.register(
            HookEvent::PreToolUse,
            Some("/^(Edit|Write)$/"),
            command_spec("echo filetool", false),
        )
        .await
        .unwrap();

        let input = HookInput::for_event(HookEvent::PreToolUse).with_tool("Edit", json!({}));
        let results = dispatcher.dispatch(&input).await;
        assert_eq!(results.len(), 1);
        assert!(results[0].output.contains("filetool"));
    }

    #[tokio::test]
    async fn command_hook_sees_env_and_stdin_payload() {
        let dispatcher = HookDispatcher::default();
        dispatcher
            .registry()
            .register(
                HookEvent::PreToolUse,
                None,
                command_spec("printf '%s|' \"$CLAUDE_HOOK_EVENT\" \"$CLAUDE_HOOK_TOOL_NAME\"; cat", false),
            )
            .await
            .unwrap();

        let input = HookInput::for_event(HookEvent::PreToolUse)
            .with_tool("Bash", json!({ "command": "ls" }))
            .with_session("s1");
        let results = dispatcher.dispatch(&input).await;
        assert_eq!(results.len(), 1);
        let out = &results[0].output;
        assert!(out.starts_with("PreToolUse|Bash|"));
        assert!(out.contains(r#""command":"ls""#));
    }

    #[tokio::test]
    async fn command_hook_timeout_is_a_failure() {
        let dispatcher = HookDispatcher::default();
        dispatcher
            .registry()
            .register(
                HookEvent::PreToolUse,
                None,
                HookSpec::Command {
                    command: "sleep 30".to_string(),
                    args: vec![],
                    env: Default::default(),
                    timeout: Some(1),
                    blocking: false,
                },
            )
            .await
            .unwrap();

        let input = HookInput::for_event(HookEvent::PreToolUse).with_tool("Bash", json!({}));
        let results = dispatcher.dispatch(&input).await;
        assert!(!results[0].success);
        assert!(results[0].error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn clear_resets_registry() {
        let dispatcher = HookDispatcher::default();
        dispatcher
            .registry()
            .register(HookEvent::Stop, None, command_spec("true", false))
            .await
            .unwrap();
        assert_eq!(dispatcher.registry().count().await, 1);
        dispatcher.registry().clear().await;
        assert_eq!(dispatcher.registry().count().await, 0);
    }

    #[test]
    fn permission_decision_finds_first_answer() {
        let mut a = HookResult::success("command", String::new());
        let mut b = HookResult::success("command", String::new());
        b.decision = Some("deny".to_string());
        let mut c = HookResult::success("command", String::new());
        c.decision = Some("allow".to_string());
        a.decision = None;
        assert_eq!(permission_decision(&[a, b, c]), Some(RuleAction::Deny));
        assert_eq!(permission_decision(&[]), None);
    }
}
