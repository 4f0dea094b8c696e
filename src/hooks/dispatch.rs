//! Hook execution — one function per spec type, plus the dispatch loop.
//!
//! Command hooks run through `sh -c` with the JSON payload on stdin and the
//! `CLAUDE_HOOK_*` variables in the environment; expiry of the per-hook
//! deadline kills the child. URL hooks POST the payload. Prompt and agent
//! hooks delegate to the [`HookDelegate`] collaborator.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use super::model::{
    HookInput, HookResult, HookSpec, RegisteredHook, DEFAULT_COMMAND_TIMEOUT_SECS,
    DEFAULT_URL_TIMEOUT_SECS,
};

// ─── Delegate (collaborator) ──────────────────────────────────────────────────

/// Executes prompt- and agent-type hooks. The LLM plumbing lives outside the
/// core; the dispatcher only requires the result shape.
#[async_trait]
pub trait HookDelegate: Send + Sync {
    async fn run_prompt(
        &self,
        prompt: &str,
        model: Option<&str>,
        input: &HookInput,
    ) -> HookResult;

    async fn run_agent(
        &self,
        agent_type: &str,
        config: &serde_json::Value,
        input: &HookInput,
    ) -> HookResult;
}

/// Default delegate: reports success without doing anything.
pub struct NullHookDelegate;

#[async_trait]
impl HookDelegate for NullHookDelegate {
    async fn run_prompt(
        &self,
        _prompt: &str,
        _model: Option<&str>,
        _input: &HookInput,
    ) -> HookResult {
        HookResult::success("prompt", String::new())
    }

    async fn run_agent(
        &self,
        _agent_type: &str,
        _config: &serde_json::Value,
        _input: &HookInput,
    ) -> HookResult {
        HookResult::success("agent", String::new())
    }
}

// ─── Executor ─────────────────────────────────────────────────────────────────

pub(super) struct HookExecutor {
    http: reqwest::Client,
    delegate: Arc<dyn HookDelegate>,
}

impl HookExecutor {
    pub(super) fn new(delegate: Arc<dyn HookDelegate>) -> Self {
        Self {
            http: reqwest::Client::new(),
            delegate,
        }
    }

    pub(super) async fn run(&self, hook: &RegisteredHook, input: &HookInput) -> HookResult {
        match &hook.spec {
            HookSpec::Command {
                command,
                args,
                env,
                timeout,
                ..
            } => {
                self.run_command(command, args, env, *timeout, input)
                    .await
            }
            HookSpec::Url {
                url,
                method,
                headers,
                timeout,
                ..
            } => self.run_url(url, method.as_deref(), headers, *timeout, input).await,
            HookSpec::Prompt { prompt, model, .. } => {
                self.delegate.run_prompt(prompt, model.as_deref(), input).await
            }
            HookSpec::Agent {
                agent_type, config, ..
            } => self.delegate.run_agent(agent_type, config, input).await,
        }
    }

    async fn run_command(
        &self,
        command: &str,
        args: &[String],
        env: &std::collections::HashMap<String, String>,
        timeout: Option<u64>,
        input: &HookInput,
    ) -> HookResult {
        let timeout_secs = timeout.unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS);
        let mut line = substitute(command, input);
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(&line);
        cmd.envs(env);
        cmd.env("CLAUDE_HOOK_EVENT", input.event.as_str());
        cmd.env(
            "CLAUDE_HOOK_TOOL_NAME",
            input.tool_name.as_deref().unwrap_or(""),
        );
        cmd.env(
            "CLAUDE_HOOK_SESSION_ID",
            input.session_id.as_deref().unwrap_or(""),
        );
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the in-flight future on timeout kills the child.
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                return HookResult::failure("command", format!("could not spawn hook: {e}"));
            }
        };

        // Payload on stdin; the hook may ignore it.
        if let Some(mut stdin) = child.stdin.take() {
            let payload = serde_json::to_vec(input).unwrap_or_default();
            let _ = stdin.write_all(&payload).await;
            // Drop closes the pipe so line-reading hooks see EOF.
        }

        let output = match tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            child.wait_with_output(),
        )
        .await
        {
            Err(_) => {
                tracing::warn!(hook = %line, timeout_secs, "command hook timed out — killed");
                return HookResult::failure(
                    "command",
                    format!("hook timed out after {timeout_secs}s"),
                );
            }
            Ok(Err(e)) => {
                return HookResult::failure("command", format!("hook wait failed: {e}"));
            }
            Ok(Ok(out)) => out,
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let parsed: Option<serde_json::Value> = serde_json::from_str(stdout.trim()).ok();
        let decision = parsed
            .as_ref()
            .and_then(|v| v.get("decision"))
            .and_then(|v| v.as_str())
            .map(str::to_string);

        if output.status.success() {
            let mut result = HookResult::success("command", stdout);
            result.decision = decision;
            return result;
        }

        // Nonzero exit with a parseable {"blocked":true} is a block, not a
        // failure.
        let blocked = parsed
            .as_ref()
            .and_then(|v| v.get("blocked"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if blocked {
            let mut result = HookResult::blocked("command", stdout);
            result.decision = decision;
            result
        } else {
            HookResult::failure("command", stderr.trim().to_string())
        }
    }

    async fn run_url(
        &self,
        url: &str,
        method: Option<&str>,
        headers: &std::collections::HashMap<String, String>,
        timeout: Option<u64>,
        input: &HookInput,
    ) -> HookResult {
        let timeout_secs = timeout.unwrap_or(DEFAULT_URL_TIMEOUT_SECS);
        let method = method
            .and_then(|m| reqwest::Method::from_bytes(m.to_uppercase().as_bytes()).ok())
            .unwrap_or(reqwest::Method::POST);

        let mut request = self
            .http
            .request(method, url)
            .timeout(Duration::from_secs(timeout_secs))
            .json(input);
        for (k, v) in headers {
            request = request.header(k.as_str(), v.as_str());
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return HookResult::failure("url", format!("hook timed out after {timeout_secs}s"));
            }
            Err(e) => {
                return HookResult::failure("url", format!("hook request failed: {e}"));
            }
        };

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return HookResult::failure("url", format!("hook returned HTTP {status}"));
        }

        let parsed: Option<serde_json::Value> = serde_json::from_str(&body).ok();
        let decision = parsed
            .as_ref()
            .and_then(|v| v.get("decision"))
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let blocked = parsed
            .as_ref()
            .and_then(|v| v.get("blocked"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let mut result = if blocked {
            HookResult::blocked("url", body)
        } else {
            HookResult::success("url", body)
        };
        result.decision = decision;
        result
    }
}

/// Replace the `$TOOL_NAME`, `$EVENT`, and `$SESSION_ID` placeholders in a
/// command string.
fn substitute(command: &str, input: &HookInput) -> String {
    command
        .replace("$TOOL_NAME", input.tool_name.as_deref().unwrap_or(""))
        .replace("$EVENT", input.event.as_str())
        .replace("$SESSION_ID", input.session_id.as_deref().unwrap_or(""))
}

#[cfg(test)]
mod tests {
    use super::super::model::HookEvent;
    use super::*;

    #[test]
    fn substitution_fills_all_placeholders() {
        let input = HookInput::for_event(HookEvent::PreToolUse)
            .with_tool("Bash", serde_json::json!({}))
            .with_session("sess-9");
        let out = substitute("notify '$EVENT/$TOOL_NAME/$SESSION_ID'", &input);
        assert_eq!(out, "notify 'PreToolUse/Bash/sess-9'");
    }

    #[test]
    fn substitution_of_missing_fields_is_empty() {
        let input = HookInput::for_event(HookEvent::SessionStart);
        assert_eq!(substitute("x $TOOL_NAME y", &input), "x  y");
    }
}
