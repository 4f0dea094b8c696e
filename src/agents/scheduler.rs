//! The sub-agent scheduler.
//!
//! Agents run through the [`AgentRunner`] collaborator (the LLM conversation
//! loop lives outside the core). The scheduler owns the records, streams
//! runner output into a shared transcript readable while the agent runs,
//! persists every state transition to the agents directory, and recovers
//! records at startup — interrupted `running` records become `failed`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{watch, RwLock};

use super::model::{AgentRecord, AgentStatus, AgentStep, AgentType};
use super::AgentError;

// ─── Collaborator seam ────────────────────────────────────────────────────────

/// Streams runner output into the agent's transcript.
#[derive(Clone)]
pub struct OutputSink {
    buf: Arc<StdMutex<String>>,
}

impl OutputSink {
    pub fn append(&self, text: &str) {
        self.buf.lock().expect("transcript lock").push_str(text);
    }
}

/// Executes one agent to completion. `Ok` carries a final summary appended
/// to the transcript; `Err` carries the failure message.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(&self, record: AgentRecord, output: OutputSink) -> Result<String, String>;
}

/// Default runner: echoes the prompt and succeeds. Stands in until a
/// provider-backed runner is wired.
pub struct EchoRunner;

#[async_trait]
impl AgentRunner for EchoRunner {
    async fn run(&self, record: AgentRecord, output: OutputSink) -> Result<String, String> {
        output.append(&format!(
            "[{}] {}\n",
            record.agent_type.as_str(),
            record.prompt
        ));
        Ok("done".to_string())
    }
}

// ─── Requests & results ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct TaskRequest {
    pub description: String,
    pub prompt: String,
    pub subagent_type: String,
    pub model: Option<String>,
    pub background: bool,
    /// Resume a paused agent by id instead of creating a new one.
    pub resume: Option<String>,
    pub parent_agent_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TaskResult {
    pub agent_id: String,
    pub status: AgentStatus,
    /// Full transcript for foreground runs; `None` for background starts.
    pub output: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AgentTranscript {
    pub agent_id: String,
    pub status: AgentStatus,
    pub transcript: String,
    pub history: Option<Vec<AgentStep>>,
}

// ─── Scheduler ────────────────────────────────────────────────────────────────

struct AgentHandle {
    record: Arc<RwLock<AgentRecord>>,
    transcript: Arc<StdMutex<String>>,
    status_tx: watch::Sender<AgentStatus>,
    task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl AgentHandle {
    fn new(record: AgentRecord) -> Arc<Self> {
        let (status_tx, _) = watch::channel(record.status);
        Arc::new(Self {
            record: Arc::new(RwLock::new(record)),
            transcript: Arc::new(StdMutex::new(String::new())),
            status_tx,
            task: StdMutex::new(None),
        })
    }

    fn snapshot_transcript(&self) -> String {
        self.transcript.lock().expect("transcript lock").clone()
    }
}

pub struct AgentScheduler {
    agents_dir: PathBuf,
    runner: Arc<dyn AgentRunner>,
    agents: RwLock<HashMap<String, Arc<AgentHandle>>>,
}

impl AgentScheduler {
    pub fn new(agents_dir: impl Into<PathBuf>, runner: Arc<dyn AgentRunner>) -> Self {
        Self {
            agents_dir: agents_dir.into(),
            runner,
            agents: RwLock::new(HashMap::new()),
        }
    }

    /// Create (or resume) an agent. Foreground runs to completion;
    /// background returns the id immediately.
    pub async fn task(&self, req: TaskRequest) -> Result<TaskResult, AgentError> {
        if let Some(id) = req.resume.clone() {
            return self.resume(&id, req.background).await;
        }

        let agent_type = AgentType::parse(&req.subagent_type)?;
        let record = AgentRecord::new(
            agent_type,
            req.description,
            req.prompt,
            req.model,
            req.parent_agent_id,
        );
        let agent_id = record.agent_id.clone();
        persist_record(&self.agents_dir, &record).await?;

        let handle = AgentHandle::new(record);
        self.agents
            .write()
            .await
            .insert(agent_id.clone(), Arc::clone(&handle));
        tracing::info!(agent_id = %agent_id, agent_type = agent_type.as_str(), background = req.background, "agent created");

        self.launch(handle, req.background).await
    }

    async fn launch(
        &self,
        handle: Arc<AgentHandle>,
        background: bool,
    ) -> Result<TaskResult, AgentError> {
        let runner = Arc::clone(&self.runner);
        let dir = self.agents_dir.clone();
        let agent_id = handle.record.read().await.agent_id.clone();

        if background {
            let run_handle = Arc::clone(&handle);
            let join = tokio::spawn(async move {
                execute(run_handle, runner, dir).await;
            });
            *handle.task.lock().expect("task lock") = Some(join);
            Ok(TaskResult {
                agent_id,
                status: AgentStatus::Running,
                output: None,
            })
        } else {
            execute(Arc::clone(&handle), runner, dir).await;
            let record = handle.record.read().await;
            Ok(TaskResult {
                agent_id,
                status: record.status,
                output: Some(record.transcript.clone()),
            })
        }
    }

    async fn resume(&self, id: &str, background: bool) -> Result<TaskResult, AgentError> {
        let handle = self
            .agents
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| AgentError::NotFound(id.to_string()))?;

        let status = handle.record.read().await.status;
        match status {
            AgentStatus::Paused => {}
            AgentStatus::Completed => return Err(AgentError::ResumeCompleted(id.to_string())),
            other => {
                return Err(AgentError::NotResumable {
                    id: id.to_string(),
                    status: other,
                })
            }
        }

        {
            let mut record = handle.record.write().await;
            record.push_step("resumed", None);
            persist_record(&self.agents_dir, &record).await?;
        }
        tracing::info!(agent_id = %id, "agent resumed");
        self.launch(handle, background).await
    }

    /// Pause a running agent. The runner task is aborted; the record keeps
    /// its transcript and can be resumed later.
    pub async fn pause(&self, id: &str) -> Result<(), AgentError> {
        let handle = self.handle(id).await?;
        let status = handle.record.read().await.status;
        if status != AgentStatus::Running {
            return Err(AgentError::NotRunning {
                id: id.to_string(),
                status,
            });
        }

        if let Some(task) = handle.task.lock().expect("task lock").take() {
            task.abort();
        }
        let mut record = handle.record.write().await;
        record.status = AgentStatus::Paused;
        record.transcript = handle.snapshot_transcript();
        record.push_step("paused", None);
        persist_record(&self.agents_dir, &record).await?;
        let _ = handle.status_tx.send(AgentStatus::Paused);
        tracing::info!(agent_id = %id, "agent paused");
        Ok(())
    }

    /// Kill a live agent: the runner task is aborted and the record becomes
    /// `killed` (terminal).
    pub async fn kill(&self, id: &str) -> Result<(), AgentError> {
        let handle = self.handle(id).await?;
        let status = handle.record.read().await.status;
        if status.is_terminal() {
            return Err(AgentError::NotRunning {
                id: id.to_string(),
                status,
            });
        }

        if let Some(task) = handle.task.lock().expect("task lock").take() {
            task.abort();
        }
        let mut record = handle.record.write().await;
        record.status = AgentStatus::Killed;
        record.ended_at = Some(Utc::now());
        record.transcript = handle.snapshot_transcript();
        record.push_step("killed", None);
        persist_record(&self.agents_dir, &record).await?;
        let _ = handle.status_tx.send(AgentStatus::Killed);
        tracing::info!(agent_id = %id, "agent killed");
        Ok(())
    }

    /// Current transcript and status; optionally blocks until the agent
    /// reaches a terminal state or the timeout passes.
    pub async fn task_output(
        &self,
        id: &str,
        block: bool,
        timeout: Option<Duration>,
        show_history: bool,
    ) -> Result<AgentTranscript, AgentError> {
        let handle = self.handle(id).await?;

        if block {
            let mut rx = handle.status_tx.subscribe();
            let deadline = timeout.unwrap_or(Duration::from_secs(300));
            // Timeout is not an error: the caller gets the current state.
            let _ = tokio::time::timeout(deadline, async {
                while !rx.borrow_and_update().is_terminal() {
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await;
        }

        let record = handle.record.read().await;
        Ok(AgentTranscript {
            agent_id: record.agent_id.clone(),
            status: record.status,
            transcript: if record.status.is_terminal() {
                record.transcript.clone()
            } else {
                handle.snapshot_transcript()
            },
            history: show_history.then(|| record.history.clone()),
        })
    }

    /// Snapshot of all known records, newest first.
    pub async fn list_agents(
        &self,
        status_filter: Option<AgentStatus>,
        include_completed: bool,
    ) -> Vec<AgentRecord> {
        let agents = self.agents.read().await;
        let mut records = Vec::with_capacity(agents.len());
        for handle in agents.values() {
            let record = handle.record.read().await.clone();
            if !include_completed && record.status == AgentStatus::Completed {
                continue;
            }
            if let Some(filter) = status_filter {
                if record.status != filter {
                    continue;
                }
            }
            records.push(record);
        }
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        records
    }

    pub async fn get(&self, id: &str) -> Option<AgentRecord> {
        let agents = self.agents.read().await;
        match agents.get(id) {
            Some(handle) => Some(handle.record.read().await.clone()),
            None => None,
        }
    }

    /// Remove every terminal record (and its file), preserving live ones.
    pub async fn clear_completed(&self) -> usize {
        let mut agents = self.agents.write().await;
        let mut removed = Vec::new();
        let ids: Vec<String> = agents.keys().cloned().collect();
        for id in ids {
            let terminal = {
                let handle = &agents[&id];
                handle.record.read().await.status.is_terminal()
            };
            if terminal {
                agents.remove(&id);
                removed.push(id);
            }
        }
        drop(agents);

        for id in &removed {
            let _ = tokio::fs::remove_file(self.agents_dir.join(format!("{id}.json"))).await;
        }
        removed.len()
    }

    /// Scan the agents directory at startup. Records are loaded but never
    /// reattached to live processes; a record still marked running was
    /// interrupted and becomes failed.
    pub async fn recover(&self) -> Result<usize, AgentError> {
        tokio::fs::create_dir_all(&self.agents_dir).await?;
        let mut dir = tokio::fs::read_dir(&self.agents_dir).await?;
        let mut recovered = 0;

        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let contents = match tokio::fs::read_to_string(&path).await {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(file = %path.display(), err = %e, "could not read agent record");
                    continue;
                }
            };
            let mut record: AgentRecord = match serde_json::from_str(&contents) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(file = %path.display(), err = %e, "corrupt agent record — skipped");
                    continue;
                }
            };

            if matches!(record.status, AgentStatus::Running | AgentStatus::Pending) {
                record.status = AgentStatus::Failed;
                record.ended_at = Some(Utc::now());
                record.error = Some("interrupted by process shutdown".to_string());
                record.push_step("recovered-as-failed", None);
                persist_record(&self.agents_dir, &record).await?;
                tracing::warn!(agent_id = %record.agent_id, "interrupted agent marked failed");
            }

            let id = record.agent_id.clone();
            let handle = AgentHandle::new(record);
            self.agents.write().await.insert(id, handle);
            recovered += 1;
        }

        Ok(recovered)
    }

    async fn handle(&self, id: &str) -> Result<Arc<AgentHandle>, AgentError> {
        self.agents
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| AgentError::NotFound(id.to_string()))
    }
}

/// Drive one agent run: pending/paused → running → terminal, persisting
/// each transition.
async fn execute(handle: Arc<AgentHandle>, runner: Arc<dyn AgentRunner>, dir: PathBuf) {
    {
        let mut record = handle.record.write().await;
        record.status = AgentStatus::Running;
        record.push_step("running", None);
        if let Err(e) = persist_record(&dir, &record).await {
            tracing::warn!(err = %e, "could not persist agent transition");
        }
    }
    let _ = handle.status_tx.send(AgentStatus::Running);

    let snapshot = handle.record.read().await.clone();
    let sink = OutputSink {
        buf: Arc::clone(&handle.transcript),
    };
    let outcome = runner.run(snapshot, sink).await;

    let mut record = handle.record.write().await;
    record.transcript = handle.snapshot_transcript();
    record.ended_at = Some(Utc::now());
    match outcome {
        Ok(summary) => {
            record.status = AgentStatus::Completed;
            record.push_step("completed", Some(summary));
        }
        Err(message) => {
            record.status = AgentStatus::Failed;
            record.error = Some(message.clone());
            record.push_step("failed", Some(message));
        }
    }
    if let Err(e) = persist_record(&dir, &record).await {
        tracing::warn!(err = %e, "could not persist agent transition");
    }
    let _ = handle.status_tx.send(record.status);
    tracing::info!(agent_id = %record.agent_id, status = ?record.status, "agent finished");
}

async fn persist_record(dir: &Path, record: &AgentRecord) -> Result<(), AgentError> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(format!("{}.json", record.agent_id));
    let json = serde_json::to_string_pretty(record)?;
    tokio::fs::write(&path, json).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Runner that streams, then waits forever until aborted.
    struct StallingRunner;

    #[async_trait]
    impl AgentRunner for StallingRunner {
        async fn run(&self, _record: AgentRecord, output: OutputSink) -> Result<String, String> {
            output.append("started\n");
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok("never".to_string())
        }
    }

    fn scheduler(dir: &Path, runner: Arc<dyn AgentRunner>) -> AgentScheduler {
        AgentScheduler::new(dir.join("agents"), runner)
    }

    fn request(background: bool) -> TaskRequest {
        TaskRequest {
            description: "demo".to_string(),
            prompt: "say hello".to_string(),
            subagent_type: "general-purpose".to_string(),
            background,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn foreground_task_runs_to_completion() {
        let dir = TempDir::new().unwrap();
        let s = scheduler(dir.path(), Arc::new(EchoRunner));

        let result = s.task(request(false)).await.unwrap();
        assert_eq!(result.status, AgentStatus::Completed);
        assert!(result.output.unwrap().contains("say hello"));

        // Persisted record reflects the terminal state.
        let record: AgentRecord = serde_json::from_str(
            &std::fs::read_to_string(
                dir.path().join("agents").join(format!("{}.json", result.agent_id)),
            )
            .unwrap(),
        )
        .unwrap();
        assert_eq!(record.status, AgentStatus::Completed);
        assert!(record.ended_at.is_some());
    }

    #[tokio::test]
    async fn unknown_type_is_rejected_with_accepted_values() {
        let dir = TempDir::new().unwrap();
        let s = scheduler(dir.path(), Arc::new(EchoRunner));
        let mut req = request(false);
        req.subagent_type = "wizard".to_string();

        let err = s.task(req).await.unwrap_err();
        assert!(err.to_string().contains("general-purpose"));
    }

    #[tokio::test]
    async fn background_task_streams_output() {
        let dir = TempDir::new().unwrap();
        let s = scheduler(dir.path(), Arc::new(StallingRunner));

        let result = s.task(request(true)).await.unwrap();
        assert!(result.output.is_none());

        // Stream is visible while the agent is still running.
        let mut saw_output = false;
        for _ in 0..100 {
            let out = s.task_output(&result.agent_id, false, None, false).await.unwrap();
            if out.transcript.contains("started") {
                saw_output = true;
                assert_eq!(out.status, AgentStatus::Running);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(saw_output);

        s.kill(&result.agent_id).await.unwrap();
    }

    #[tokio::test]
    async fn pause_then_resume_reuses_the_record() {
        let dir = TempDir::new().unwrap();
        let s = scheduler(dir.path(), Arc::new(StallingRunner));

        let result = s.task(request(true)).await.unwrap();
        let id = result.agent_id.clone();

        // Wait for Running, then pause.
        for _ in 0..100 {
            if s.get(&id).await.unwrap().status == AgentStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        s.pause(&id).await.unwrap();
        assert_eq!(s.get(&id).await.unwrap().status, AgentStatus::Paused);

        // Resume by id: same record, back to running.
        let resumed = s
            .task(TaskRequest {
                resume: Some(id.clone()),
                background: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(resumed.agent_id, id);
        for _ in 0..100 {
            if s.get(&id).await.unwrap().status == AgentStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(s.get(&id).await.unwrap().status, AgentStatus::Running);
        let history: Vec<String> = s
            .get(&id)
            .await
            .unwrap()
            .history
            .iter()
            .map(|h| h.step.clone())
            .collect();
        assert!(history.contains(&"paused".to_string()));
        assert!(history.contains(&"resumed".to_string()));

        s.kill(&id).await.unwrap();
    }

    #[tokio::test]
    async fn resuming_completed_agent_fails_with_completed() {
        let dir = TempDir::new().unwrap();
        let s = scheduler(dir.path(), Arc::new(EchoRunner));
        let done = s.task(request(false)).await.unwrap();

        let err = s
            .task(TaskRequest {
                resume: Some(done.agent_id),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("completed"));
    }

    #[tokio::test]
    async fn resuming_unknown_agent_is_not_found() {
        let dir = TempDir::new().unwrap();
        let s = scheduler(dir.path(), Arc::new(EchoRunner));
        let err = s
            .task(TaskRequest {
                resume: Some("no-such-id".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::NotFound(_)));
    }

    #[tokio::test]
    async fn blocking_task_output_waits_for_completion() {
        let dir = TempDir::new().unwrap();
        let s = Arc::new(scheduler(dir.path(), Arc::new(EchoRunner)));

        let result = s.task(request(true)).await.unwrap();
        let out = s
            .task_output(&result.agent_id, true, Some(Duration::from_secs(5)), true)
            .await
            .unwrap();
        assert_eq!(out.status, AgentStatus::Completed);
        assert!(out.history.unwrap().iter().any(|h| h.step == "completed"));
    }

    #[tokio::test]
    async fn recovery_fails_interrupted_running_records() {
        let dir = TempDir::new().unwrap();
        let agents_dir = dir.path().join("agents");
        std::fs::create_dir_all(&agents_dir).unwrap();

        // A record left in running state by a dead process.
        let mut record =
            AgentRecord::new(AgentType::Explore, "left over", "scan", None, None);
        record.status = AgentStatus::Running;
        std::fs::write(
            agents_dir.join(format!("{}.json", record.agent_id)),
            serde_json::to_string(&record).unwrap(),
        )
        .unwrap();
        // A completed record and a corrupt file.
        let done = {
            let mut r = AgentRecord::new(AgentType::Test, "ok", "x", None, None);
            r.status = AgentStatus::Completed;
            r
        };
        std::fs::write(
            agents_dir.join(format!("{}.json", done.agent_id)),
            serde_json::to_string(&done).unwrap(),
        )
        .unwrap();
        std::fs::write(agents_dir.join("junk.json"), "{ nope").unwrap();

        let s = scheduler(dir.path(), Arc::new(EchoRunner));
        let recovered = s.recover().await.unwrap();
        assert_eq!(recovered, 2, "corrupt file skipped");

        let interrupted = s.get(&record.agent_id).await.unwrap();
        assert_eq!(interrupted.status, AgentStatus::Failed);
        assert!(interrupted.error.unwrap().contains("interrupted"));
        assert_eq!(s.get(&done.agent_id).await.unwrap().status, AgentStatus::Completed);
    }

    #[tokio::test]
    async fn clear_completed_preserves_live_agents() {
        let dir = TempDir::new().unwrap();
        let s = scheduler(dir.path(), Arc::new(StallingRunner));

        let live = s.task(request(true)).await.unwrap();

        // A terminal record via the echo path, by hand.
        let done = {
            let mut r = AgentRecord::new(AgentType::Plan, "done", "x", None, None);
            r.status = AgentStatus::Completed;
            r
        };
        persist_record(&s.agents_dir, &done).await.unwrap();
        s.agents
            .write()
            .await
            .insert(done.agent_id.clone(), AgentHandle::new(done.clone()));

        let removed = s.clear_completed().await;
        assert_eq!(removed, 1);
        assert!(s.get(&done.agent_id).await.is_none());
        assert!(s.get(&live.agent_id).await.is_some());
        assert!(!s.agents_dir.join(format!("{}.json", done.agent_id)).exists());

        s.kill(&live.agent_id).await.unwrap();
    }

    #[tokio::test]
    async fn list_agents_filters_by_status_and_completion() {
        let dir = TempDir::new().unwrap();
        let s = scheduler(dir.path(), Arc::new(EchoRunner));

        s.task(request(false)).await.unwrap(); // completed
        let listed = s.list_agents(None, false).await;
        assert!(listed.is_empty(), "completed agents hidden by default");

        let listed = s.list_agents(None, true).await;
        assert_eq!(listed.len(), 1);

        let listed = s.list_agents(Some(AgentStatus::Completed), true).await;
        assert_eq!(listed.len(), 1);
        let listed = s.list_agents(Some(AgentStatus::Running), true).await;
        assert!(listed.is_empty());
    }
}
