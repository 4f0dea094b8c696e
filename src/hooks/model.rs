//! Hook data model — lifecycle events, hook specs, matchers, and results.

use std::collections::HashMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::HookError;

/// Default deadline for command hooks.
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;
/// Default deadline for URL hooks.
pub const DEFAULT_URL_TIMEOUT_SECS: u64 = 10;

// ─── Events ───────────────────────────────────────────────────────────────────

/// The fixed set of lifecycle events hooks can attach to.
///
/// Serialized exactly as the variant name (`"PreToolUse"`, …) — the same
/// strings appear as keys in `.claude/settings.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookEvent {
    PreToolUse,
    PostToolUse,
    PostToolUseFailure,
    Notification,
    UserPromptSubmit,
    SessionStart,
    SessionEnd,
    Stop,
    SubagentStart,
    SubagentStop,
    PreCompact,
    PermissionRequest,
    // CLI-phase events.
    BeforeSetup,
    AfterSetup,
    CommandsLoaded,
    ToolsLoaded,
    McpConfigsLoaded,
    PluginsInitialized,
    AfterHooks,
}

impl HookEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookEvent::PreToolUse => "PreToolUse",
            HookEvent::PostToolUse => "PostToolUse",
            HookEvent::PostToolUseFailure => "PostToolUseFailure",
            HookEvent::Notification => "Notification",
            HookEvent::UserPromptSubmit => "UserPromptSubmit",
            HookEvent::SessionStart => "SessionStart",
            HookEvent::SessionEnd => "SessionEnd",
            HookEvent::Stop => "Stop",
            HookEvent::SubagentStart => "SubagentStart",
            HookEvent::SubagentStop => "SubagentStop",
            HookEvent::PreCompact => "PreCompact",
            HookEvent::PermissionRequest => "PermissionRequest",
            HookEvent::BeforeSetup => "BeforeSetup",
            HookEvent::AfterSetup => "AfterSetup",
            HookEvent::CommandsLoaded => "CommandsLoaded",
            HookEvent::ToolsLoaded => "ToolsLoaded",
            HookEvent::McpConfigsLoaded => "McpConfigsLoaded",
            HookEvent::PluginsInitialized => "PluginsInitialized",
            HookEvent::AfterHooks => "AfterHooks",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_string())).ok()
    }
}

// ─── Matchers ─────────────────────────────────────────────────────────────────

/// Optional predicate restricting a hook to specific tools.
///
/// A string wrapped in slashes (`/Bash|Edit/`) is a regex; anything else is
/// a literal compared for equality with the input's tool name.
#[derive(Debug, Clone)]
pub enum HookMatcher {
    Literal(String),
    Pattern(Regex),
}

impl HookMatcher {
    pub fn parse(s: &str) -> Result<Self, HookError> {
        if s.len() >= 2 && s.starts_with('/') && s.ends_with('/') {
            let pattern = &s[1..s.len() - 1];
            let re = Regex::new(pattern)
                .map_err(|e| HookError::InvalidMatcher(format!("{s}: {e}")))?;
            Ok(HookMatcher::Pattern(re))
        } else {
            Ok(HookMatcher::Literal(s.to_string()))
        }
    }

    /// An input without a tool name never matches an explicit matcher.
    pub fn matches(&self, tool_name: Option<&str>) -> bool {
        let Some(name) = tool_name else { return false };
        match self {
            HookMatcher::Literal(lit) => lit == name,
            HookMatcher::Pattern(re) => re.is_match(name),
        }
    }
}

// ─── Hook specs ───────────────────────────────────────────────────────────────

/// How a hook runs, discriminated by the `type` field in config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HookSpec {
    Command {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        /// Seconds; defaults to [`DEFAULT_COMMAND_TIMEOUT_SECS`].
        #[serde(default)]
        timeout: Option<u64>,
        #[serde(default)]
        blocking: bool,
    },
    Url {
        url: String,
        /// HTTP method; defaults to POST.
        #[serde(default)]
        method: Option<String>,
        #[serde(default)]
        headers: HashMap<String, String>,
        /// Seconds; defaults to [`DEFAULT_URL_TIMEOUT_SECS`].
        #[serde(default)]
        timeout: Option<u64>,
        #[serde(default)]
        blocking: bool,
    },
    Prompt {
        prompt: String,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        timeout: Option<u64>,
        #[serde(default)]
        blocking: bool,
    },
    Agent {
        agent_type: String,
        #[serde(default)]
        config: serde_json::Value,
        #[serde(default)]
        timeout: Option<u64>,
        #[serde(default)]
        blocking: bool,
    },
}

impl HookSpec {
    pub fn is_blocking(&self) -> bool {
        match self {
            HookSpec::Command { blocking, .. }
            | HookSpec::Url { blocking, .. }
            | HookSpec::Prompt { blocking, .. }
            | HookSpec::Agent { blocking, .. } => *blocking,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            HookSpec::Command { .. } => "command",
            HookSpec::Url { .. } => "url",
            HookSpec::Prompt { .. } => "prompt",
            HookSpec::Agent { .. } => "agent",
        }
    }
}

/// A hook attached to an event, in registration order.
#[derive(Debug, Clone)]
pub struct RegisteredHook {
    pub event: HookEvent,
    pub matcher: Option<HookMatcher>,
    pub spec: HookSpec,
}

// ─── Dispatch input / output ──────────────────────────────────────────────────

/// The payload handed to every hook (and serialized onto a command hook's
/// stdin).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HookInput {
    pub event: HookEvent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl HookInput {
    pub fn for_event(event: HookEvent) -> Self {
        Self {
            event,
            tool_name: None,
            tool_input: None,
            tool_output: None,
            message: None,
            session_id: None,
        }
    }

    pub fn with_tool(mut self, name: impl Into<String>, input: serde_json::Value) -> Self {
        self.tool_name = Some(name.into());
        self.tool_input = Some(input);
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// What one hook produced.
#[derive(Debug, Clone, Serialize)]
pub struct HookResult {
    /// Which spec type ran (`"command"`, `"url"`, `"prompt"`, `"agent"`).
    pub hook_type: String,
    pub success: bool,
    pub output: String,
    pub blocked: bool,
    /// Permission-request hooks may answer `"allow"` or `"deny"` here.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HookResult {
    pub fn success(hook_type: &str, output: String) -> Self {
        Self {
            hook_type: hook_type.to_string(),
            success: true,
            output,
            blocked: false,
            decision: None,
            error: None,
        }
    }

    pub fn blocked(hook_type: &str, output: String) -> Self {
        Self {
            hook_type: hook_type.to_string(),
            success: false,
            output,
            blocked: true,
            decision: None,
            error: None,
        }
    }

    pub fn failure(hook_type: &str, error: String) -> Self {
        Self {
            hook_type: hook_type.to_string(),
            success: false,
            output: String::new(),
            blocked: false,
            decision: None,
            error: Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_parses_exact_names() {
        assert_eq!(HookEvent::parse("PreToolUse"), Some(HookEvent::PreToolUse));
        assert_eq!(HookEvent::parse("McpConfigsLoaded"), Some(HookEvent::McpConfigsLoaded));
        assert_eq!(HookEvent::parse("pretooluse"), None);
        assert_eq!(HookEvent::parse("NotAnEvent"), None);
    }

    #[test]
    fn literal_matcher_is_equality() {
        let m = HookMatcher::parse("Bash").unwrap();
        assert!(m.matches(Some("Bash")));
        assert!(!m.matches(Some("BashOutput")));
        assert!(!m.matches(None));
    }

    #[test]
    fn slash_wrapped_matcher_is_regex() {
        let m = HookMatcher::parse("/^(Edit|Write)$/").unwrap();
        assert!(m.matches(Some("Edit")));
        assert!(m.matches(Some("Write")));
        assert!(!m.matches(Some("Read")));
    }

    #[test]
    fn invalid_regex_matcher_rejected() {
        assert!(HookMatcher::parse("/([/").is_err());
    }

    #[test]
    fn spec_deserializes_by_type_tag() {
        let spec: HookSpec = serde_json::from_str(
            r#"{ "type": "command", "command": "echo hi", "blocking": true }"#,
        )
        .unwrap();
        assert!(matches!(spec, HookSpec::Command { .. }));
        assert!(spec.is_blocking());

        let spec: HookSpec =
            serde_json::from_str(r#"{ "type": "url", "url": "http://localhost:9" }"#).unwrap();
        assert!(matches!(spec, HookSpec::Url { .. }));
        assert!(!spec.is_blocking());
    }

    #[test]
    fn input_payload_uses_camel_case() {
        let input = HookInput::for_event(HookEvent::PreToolUse)
            .with_tool("Bash", serde_json::json!({ "command": "ls" }))
            .with_session("s-1");
        let json = serde_json::to_value(&input).unwrap();
        assert_eq!(json["event"], "PreToolUse");
        assert_eq!(json["toolName"], "Bash");
        assert_eq!(json["sessionId"], "s-1");
        assert!(json.get("toolOutput").is_none());
    }
}
