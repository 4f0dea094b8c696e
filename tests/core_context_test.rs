//! End-to-end wiring test: one `CoreContext` per data directory, with
//! settings-driven rules and hooks, a live shell engine, and a checkpoint
//! session.

use serde_json::json;
use tempfile::TempDir;

use agentd::config::CoreConfig;
use agentd::hooks::{HookEvent, HookInput};
use agentd::lockdir::DirLock;
use agentd::rules::RuleAction;
use agentd::shell::ExecOptions;
use agentd::CoreContext;

fn config_for(dir: &TempDir) -> CoreConfig {
    let working = dir.path().join("project");
    std::fs::create_dir_all(working.join(".claude")).unwrap();
    std::fs::write(
        working.join(".claude").join("settings.json"),
        r#"{
            "permissions": {
                "allow": ["Bash(echo:*)"],
                "deny": ["Bash(rm -rf:*)"]
            },
            "hooks": {
                "PreToolUse": { "type": "command", "command": "echo hook-ran", "matcher": "Bash" }
            }
        }"#,
    )
    .unwrap();

    CoreConfig::new(
        Some(dir.path().join("data")),
        Some(working),
        Some("warn".to_string()),
    )
}

#[tokio::test]
async fn test_context_wires_settings_rules_hooks_and_engines() {
    let dir = TempDir::new().unwrap();
    let context = CoreContext::initialize(config_for(&dir), Vec::new())
        .await
        .unwrap();

    // Settings rules are live in the gate.
    let allowed = context
        .gate
        .check("Bash", &json!({ "command": "echo hi" }), RuleAction::Deny)
        .await;
    assert!(allowed.allowed());
    let denied = context
        .gate
        .check("Bash", &json!({ "command": "rm -rf build" }), RuleAction::Allow)
        .await;
    assert!(!denied.allowed());

    // Settings hooks are registered and fire.
    let results = context
        .hooks
        .dispatch(&HookInput::for_event(HookEvent::PreToolUse).with_tool("Bash", json!({})))
        .await;
    assert_eq!(results.len(), 1);
    assert!(results[0].output.contains("hook-ran"));

    // Shell and checkpoints are live.
    let out = context
        .shell
        .execute("echo from-context", ExecOptions::default())
        .await
        .unwrap();
    assert!(out.success);

    let file = dir.path().join("project").join("tracked.txt");
    std::fs::write(&file, "first\n").unwrap();
    context
        .checkpoints
        .create_checkpoint(&file, &Default::default())
        .await
        .unwrap();
    assert_eq!(context.checkpoints.chain_len(&file).await, 1);
}

#[tokio::test]
async fn test_second_core_on_same_data_dir_fails_fast() {
    let dir = TempDir::new().unwrap();
    let config = config_for(&dir);

    let _held = DirLock::acquire(&config.data_dir).unwrap();
    let err = CoreContext::initialize(config, Vec::new()).await.unwrap_err();
    assert!(err.to_string().contains("locking data dir"));
}
