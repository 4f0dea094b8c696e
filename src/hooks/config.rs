//! Hook discovery from user configuration.
//!
//! Two sources, both under `.claude/`:
//!
//! - `settings.json` `hooks` field — an object keyed by event name, each
//!   value a hook spec or array of hook specs. A legacy array form
//!   `{"hooks": [{event, matcher?, command, …}]}` is normalized to command
//!   hooks.
//! - individual JSON files in `.claude/hooks/` — each a `{event, …spec}`
//!   object or an array of them.
//!
//! Invalid entries are rejected with a warning; the rest still load.

use std::path::Path;

use serde::Deserialize;

use super::model::{HookEvent, HookSpec};
use super::HookRegistry;

/// A spec plus its optional matcher, as written in config.
#[derive(Debug, Deserialize)]
struct RawHook {
    #[serde(default)]
    matcher: Option<String>,
    #[serde(flatten)]
    spec: HookSpec,
}

/// Legacy array entry: a command hook with an inline `event` field.
#[derive(Debug, Deserialize)]
struct LegacyHook {
    event: String,
    #[serde(default)]
    matcher: Option<String>,
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: std::collections::HashMap<String, String>,
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default)]
    blocking: bool,
}

/// Load hooks from a parsed `settings.json` `hooks` value. Returns how many
/// hooks were registered.
pub async fn load_hooks_value(registry: &HookRegistry, hooks: &serde_json::Value) -> usize {
    let mut loaded = 0;

    match hooks {
        // Modern form: object keyed by event name.
        serde_json::Value::Object(by_event) => {
            for (event_name, value) in by_event {
                let Some(event) = HookEvent::parse(event_name) else {
                    tracing::warn!(event = %event_name, "unknown hook event — skipped");
                    continue;
                };
                let specs: Vec<&serde_json::Value> = match value {
                    serde_json::Value::Array(items) => items.iter().collect(),
                    other => vec![other],
                };
                for raw in specs {
                    loaded += register_raw(registry, event, raw).await;
                }
            }
        }
        // Legacy form: flat array with inline event fields.
        serde_json::Value::Array(entries) => {
            for raw in entries {
                match serde_json::from_value::<LegacyHook>(raw.clone()) {
                    Ok(legacy) => {
                        let Some(event) = HookEvent::parse(&legacy.event) else {
                            tracing::warn!(event = %legacy.event, "unknown hook event — skipped");
                            continue;
                        };
                        let spec = HookSpec::Command {
                            command: legacy.command,
                            args: legacy.args,
                            env: legacy.env,
                            timeout: legacy.timeout,
                            blocking: legacy.blocking,
                        };
                        match registry.register(event, legacy.matcher.as_deref(), spec).await {
                            Ok(()) => loaded += 1,
                            Err(e) => tracing::warn!(err = %e, "invalid legacy hook — skipped"),
                        }
                    }
                    Err(e) => tracing::warn!(err = %e, "invalid legacy hook entry — skipped"),
                }
            }
        }
        other => {
            tracing::warn!(kind = ?other, "hooks config must be an object or array");
        }
    }

    loaded
}

/// Load every `*.json` file in `.claude/hooks/` under `base_dir`.
pub async fn load_hooks_dir(registry: &HookRegistry, base_dir: &Path) -> usize {
    let dir = base_dir.join(".claude").join("hooks");
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return 0;
    };

    let mut loaded = 0;
    let mut paths: Vec<_> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
        .collect();
    // Deterministic registration order across platforms.
    paths.sort();

    for path in paths {
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(path = %path.display(), err = %e, "could not read hook file");
                continue;
            }
        };
        let value: serde_json::Value = match serde_json::from_str(&contents) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(path = %path.display(), err = %e, "invalid hook file — skipped");
                continue;
            }
        };
        let items: Vec<serde_json::Value> = match value {
            serde_json::Value::Array(items) => items,
            other => vec![other],
        };
        for item in items {
            let Some(event_name) = item.get("event").and_then(|v| v.as_str()) else {
                tracing::warn!(path = %path.display(), "hook file entry missing 'event' — skipped");
                continue;
            };
            let Some(event) = HookEvent::parse(event_name) else {
                tracing::warn!(path = %path.display(), event = %event_name, "unknown hook event — skipped");
                continue;
            };
            loaded += register_raw(registry, event, &item).await;
        }
    }

    if loaded > 0 {
        tracing::info!(dir = %dir.display(), count = loaded, "hooks loaded from hooks directory");
    }
    loaded
}

async fn register_raw(
    registry: &HookRegistry,
    event: HookEvent,
    raw: &serde_json::Value,
) -> usize {
    match serde_json::from_value::<RawHook>(raw.clone()) {
        Ok(hook) => match registry
            .register(event, hook.matcher.as_deref(), hook.spec)
            .await
        {
            Ok(()) => 1,
            Err(e) => {
                tracing::warn!(event = event.as_str(), err = %e, "invalid hook — skipped");
                0
            }
        },
        Err(e) => {
            tracing::warn!(event = event.as_str(), err = %e, "invalid hook spec — skipped");
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::HookDispatcher;
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn object_form_registers_per_event() {
        let dispatcher = HookDispatcher::default();
        let hooks = json!({
            "PreToolUse": { "type": "command", "command": "echo pre", "matcher": "Bash" },
            "PostToolUse": [
                { "type": "command", "command": "echo one" },
                { "type": "url", "url": "http://localhost:1/hook" }
            ]
        });
        let n = load_hooks_value(dispatcher.registry(), &hooks).await;
        assert_eq!(n, 3);
        assert_eq!(dispatcher.registry().count().await, 3);
    }

    #[tokio::test]
    async fn legacy_array_form_is_normalized() {
        let dispatcher = HookDispatcher::default();
        let hooks = json!([
            { "event": "PreToolUse", "matcher": "Bash", "command": "echo hi", "blocking": true },
            { "event": "Stop", "command": "cleanup.sh" }
        ]);
        let n = load_hooks_value(dispatcher.registry(), &hooks).await;
        assert_eq!(n, 2);
    }

    #[tokio::test]
    async fn invalid_entries_are_skipped_not_fatal() {
        let dispatcher = HookDispatcher::default();
        let hooks = json!({
            "PreToolUse": { "type": "command", "command": "ok" },
            "NoSuchEvent": { "type": "command", "command": "never" },
            "PostToolUse": { "type": "teleport" }
        });
        let n = load_hooks_value(dispatcher.registry(), &hooks).await;
        assert_eq!(n, 1);
    }

    #[tokio::test]
    async fn hooks_dir_files_load_in_sorted_order() {
        let dir = TempDir::new().unwrap();
        let hooks_dir = dir.path().join(".claude").join("hooks");
        std::fs::create_dir_all(&hooks_dir).unwrap();
        std::fs::write(
            hooks_dir.join("10-notify.json"),
            r#"{ "event": "Notification", "type": "command", "command": "notify-send hi" }"#,
        )
        .unwrap();
        std::fs::write(
            hooks_dir.join("20-audit.json"),
            r#"[{ "event": "PostToolUse", "type": "command", "command": "log.sh" }]"#,
        )
        .unwrap();
        std::fs::write(hooks_dir.join("bad.json"), "{ not json").unwrap();

        let dispatcher = HookDispatcher::default();
        let n = load_hooks_dir(dispatcher.registry(), dir.path()).await;
        assert_eq!(n, 2);
    }
}
