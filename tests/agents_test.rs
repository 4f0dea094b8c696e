//! Integration tests for the sub-agent scheduler.
//!
//! Tests cover:
//! 1. Pause → resume reuses the same record and id
//! 2. Resuming a completed agent fails with "completed"
//! 3. Persistence across scheduler instances (recovery)
//! 4. Foreground execution through a custom runner

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use agentd::agents::{
    AgentRecord, AgentRunner, AgentScheduler, AgentStatus, EchoRunner, OutputSink, TaskRequest,
};

struct SlowRunner;

#[async_trait]
impl AgentRunner for SlowRunner {
    async fn run(&self, record: AgentRecord, output: OutputSink) -> Result<String, String> {
        output.append(&format!("working on: {}\n", record.description));
        tokio::time::sleep(Duration::from_secs(600)).await;
        Ok("finished".to_string())
    }
}

fn scheduler(dir: &Path, runner: Arc<dyn AgentRunner>) -> AgentScheduler {
    AgentScheduler::new(dir.join("agents"), runner)
}

async fn wait_for_status(s: &AgentScheduler, id: &str, status: AgentStatus) -> bool {
    for _ in 0..200 {
        if s.get(id).await.map(|r| r.status) == Some(status) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

// ─── Test 1: pause → resume ──────────────────────────────────────────────────

#[tokio::test]
async fn test_pause_resume_cycle_reuses_the_record() {
    let dir = TempDir::new().unwrap();
    let s = scheduler(dir.path(), Arc::new(SlowRunner));

    let started = s
        .task(TaskRequest {
            description: "long haul".to_string(),
            prompt: "dig through the logs".to_string(),
            subagent_type: "explore".to_string(),
            background: true,
            ..Default::default()
        })
        .await
        .unwrap();
    let id = started.agent_id.clone();
    assert!(wait_for_status(&s, &id, AgentStatus::Running).await);

    s.pause(&id).await.unwrap();
    assert_eq!(s.get(&id).await.unwrap().status, AgentStatus::Paused);

    let resumed = s
        .task(TaskRequest {
            resume: Some(id.clone()),
            background: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(resumed.agent_id, id, "resume reuses the same agent id");
    assert!(wait_for_status(&s, &id, AgentStatus::Running).await);

    let record = s.get(&id).await.unwrap();
    assert_eq!(record.description, "long haul");
    let steps: Vec<&str> = record.history.iter().map(|h| h.step.as_str()).collect();
    assert!(steps.contains(&"paused"));
    assert!(steps.contains(&"resumed"));

    s.kill(&id).await.unwrap();
    assert_eq!(s.get(&id).await.unwrap().status, AgentStatus::Killed);
}

// ─── Test 2: completed agents do not resume ──────────────────────────────────

#[tokio::test]
async fn test_resume_of_completed_agent_fails() {
    let dir = TempDir::new().unwrap();
    let s = scheduler(dir.path(), Arc::new(EchoRunner));

    let done = s
        .task(TaskRequest {
            description: "quick".to_string(),
            prompt: "hello".to_string(),
            subagent_type: "general-purpose".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(done.status, AgentStatus::Completed);

    let err = s
        .task(TaskRequest {
            resume: Some(done.agent_id),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("completed"), "got: {err}");
}

// ─── Test 3: recovery across scheduler instances ─────────────────────────────

#[tokio::test]
async fn test_records_survive_restart_and_interrupted_runs_fail() {
    let dir = TempDir::new().unwrap();

    let id = {
        let s = scheduler(dir.path(), Arc::new(SlowRunner));
        let started = s
            .task(TaskRequest {
                description: "doomed".to_string(),
                prompt: "never finishes".to_string(),
                subagent_type: "test".to_string(),
                background: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(wait_for_status(&s, &started.agent_id, AgentStatus::Running).await);
        started.agent_id
        // Scheduler dropped with the record still marked running on disk.
    };

    let fresh = scheduler(dir.path(), Arc::new(EchoRunner));
    let recovered = fresh.recover().await.unwrap();
    assert_eq!(recovered, 1);

    let record = fresh.get(&id).await.unwrap();
    assert_eq!(record.status, AgentStatus::Failed);
    assert!(record.error.unwrap().contains("interrupted"));
}

// ─── Test 4: custom runner output flows into the transcript ──────────────────

#[tokio::test]
async fn test_foreground_transcript_comes_from_the_runner() {
    struct ChattyRunner;

    #[async_trait]
    impl AgentRunner for ChattyRunner {
        async fn run(&self, _record: AgentRecord, output: OutputSink) -> Result<String, String> {
            output.append("step 1\n");
            output.append("step 2\n");
            Ok("two steps".to_string())
        }
    }

    let dir = TempDir::new().unwrap();
    let s = scheduler(dir.path(), Arc::new(ChattyRunner));

    let result = s
        .task(TaskRequest {
            description: "chatty".to_string(),
            prompt: "talk".to_string(),
            subagent_type: "plan".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(result.status, AgentStatus::Completed);
    let output = result.output.unwrap();
    assert!(output.contains("step 1"));
    assert!(output.contains("step 2"));

    let transcript = s
        .task_output(&result.agent_id, false, None, true)
        .await
        .unwrap();
    assert!(transcript.history.unwrap().iter().any(|h| h.detail.as_deref() == Some("two steps")));
}
