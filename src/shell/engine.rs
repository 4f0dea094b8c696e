//! The shell execution engine.
//!
//! Foreground commands block the caller until exit or timeout; background
//! commands return a `bash_id` immediately and accumulate output in a
//! bounded buffer until the job exits or is killed. Every completed
//! invocation appends an audit record with the raw (untruncated) output
//! size.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::sync::{oneshot, Mutex, RwLock};

use super::policy::{check_command, CommandVerdict};
use super::{JobState, ShellError, DEFAULT_TIMEOUT_MS, MAX_BACKGROUND_JOBS, MAX_TIMEOUT_MS, MAX_VISIBLE_OUTPUT};

const TRUNCATION_MARKER: &str = "\n[output truncated]";

// ─── Public types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Milliseconds; clamped into `[0, MAX_TIMEOUT_MS]`.
    pub timeout_ms: Option<u64>,
    pub background: bool,
    pub cwd: Option<std::path::PathBuf>,
}

/// Result of `execute`. Background starts carry only `bash_id`.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub success: bool,
    pub output: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub bash_id: Option<String>,
    /// Set when the command failed for a reason other than its exit code
    /// (timeout, kill).
    pub error: Option<String>,
}

/// One line of the in-process execution audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellAuditRecord {
    pub timestamp: DateTime<Utc>,
    pub command: String,
    pub duration_ms: u64,
    pub exit_code: Option<i32>,
    /// Raw combined stdout+stderr byte count, before any truncation.
    pub output_size: u64,
    pub success: bool,
}

// ─── Bounded output buffer ────────────────────────────────────────────────────

/// Accumulates output up to [`MAX_VISIBLE_OUTPUT`] bytes while counting the
/// raw size of everything that arrived.
#[derive(Debug, Default)]
struct Bounded {
    text: String,
    raw_bytes: u64,
    truncated: bool,
}

impl Bounded {
    fn push(&mut self, chunk: &[u8]) {
        self.raw_bytes += chunk.len() as u64;
        if self.truncated {
            return;
        }
        let remaining = MAX_VISIBLE_OUTPUT.saturating_sub(self.text.len());
        let text = String::from_utf8_lossy(chunk);
        if text.len() <= remaining {
            self.text.push_str(&text);
        } else {
            let mut cut = remaining;
            while cut > 0 && !text.is_char_boundary(cut) {
                cut -= 1;
            }
            self.text.push_str(&text[..cut]);
            self.text.push_str(TRUNCATION_MARKER);
            self.truncated = true;
        }
    }

    fn snapshot(&self) -> String {
        self.text.clone()
    }
}

// ─── Background jobs ──────────────────────────────────────────────────────────

struct JobShared {
    state: StdMutex<JobState>,
    exit_code: StdMutex<Option<i32>>,
    stdout: StdMutex<Bounded>,
    stderr: StdMutex<Bounded>,
}

struct BackgroundJob {
    command: String,
    started_at: DateTime<Utc>,
    shared: Arc<JobShared>,
    kill_tx: StdMutex<Option<oneshot::Sender<()>>>,
}

impl BackgroundJob {
    fn state(&self) -> JobState {
        *self.shared.state.lock().expect("job state lock")
    }
}

/// Status snapshot returned by [`ShellEngine::output`].
#[derive(Debug, Clone)]
pub struct JobOutput {
    pub state: JobState,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

// ─── Engine ───────────────────────────────────────────────────────────────────

pub struct ShellEngine {
    jobs: RwLock<HashMap<String, Arc<BackgroundJob>>>,
    audit: Arc<Mutex<Vec<ShellAuditRecord>>>,
    next_job: AtomicU64,
}

impl Default for ShellEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ShellEngine {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            audit: Arc::new(Mutex::new(Vec::new())),
            next_job: AtomicU64::new(1),
        }
    }

    /// Run a command. Foreground waits for exit or timeout; background
    /// returns immediately with `bash_id` set.
    pub async fn execute(
        &self,
        command: &str,
        opts: ExecOptions,
    ) -> Result<ExecOutcome, ShellError> {
        match check_command(command) {
            CommandVerdict::Deny(reason) => {
                tracing::warn!(command, reason = %reason, "command refused by security policy");
                return Err(ShellError::PolicyDenied(reason));
            }
            CommandVerdict::Warn(reason) => {
                tracing::warn!(command, reason = %reason, "risky command — proceeding");
            }
            CommandVerdict::Allow => {}
        }

        if opts.background {
            self.execute_background(command, opts).await
        } else {
            self.execute_foreground(command, opts).await
        }
    }

    async fn execute_foreground(
        &self,
        command: &str,
        opts: ExecOptions,
    ) -> Result<ExecOutcome, ShellError> {
        let timeout_ms = opts.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS).min(MAX_TIMEOUT_MS);
        let started = std::time::Instant::now();

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(command);
        if let Some(cwd) = &opts.cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the in-flight wait on timeout delivers SIGKILL.
            .kill_on_drop(true);

        let child = cmd.spawn()?;

        match tokio::time::timeout(Duration::from_millis(timeout_ms), child.wait_with_output())
            .await
        {
            Err(_) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                tracing::warn!(command, timeout_ms, "command timed out — killed");
                self.append_audit(command, duration_ms, None, 0, false).await;
                Ok(ExecOutcome {
                    success: false,
                    output: String::new(),
                    stderr: String::new(),
                    exit_code: None,
                    bash_id: None,
                    error: Some(format!("command timed out after {timeout_ms}ms")),
                })
            }
            Ok(Err(e)) => Err(ShellError::Spawn(e)),
            Ok(Ok(output)) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                let raw_size = (output.stdout.len() + output.stderr.len()) as u64;
                let exit_code = output.status.code();
                let success = output.status.success();

                let mut stdout = Bounded::default();
                stdout.push(&output.stdout);
                let mut stderr = Bounded::default();
                stderr.push(&output.stderr);

                self.append_audit(command, duration_ms, exit_code, raw_size, success)
                    .await;

                Ok(ExecOutcome {
                    success,
                    output: stdout.snapshot(),
                    stderr: stderr.snapshot(),
                    exit_code,
                    bash_id: None,
                    error: None,
                })
            }
        }
    }

    async fn execute_background(
        &self,
        command: &str,
        opts: ExecOptions,
    ) -> Result<ExecOutcome, ShellError> {
        {
            let jobs = self.jobs.read().await;
            let running = jobs.values().filter(|j| j.state() == JobState::Running).count();
            if running >= MAX_BACKGROUND_JOBS {
                return Err(ShellError::TooManyBackgroundJobs);
            }
        }

        let timeout_ms = opts.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS).min(MAX_TIMEOUT_MS);
        let id = format!("bash_{}", self.next_job.fetch_add(1, Ordering::Relaxed));

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(command);
        if let Some(cwd) = &opts.cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;

        let shared = Arc::new(JobShared {
            state: StdMutex::new(JobState::Running),
            exit_code: StdMutex::new(None),
            stdout: StdMutex::new(Bounded::default()),
            stderr: StdMutex::new(Bounded::default()),
        });
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        // Reader tasks drain the pipes so the child never blocks on a full
        // pipe buffer.
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let stdout_task = spawn_reader(stdout_pipe, Arc::clone(&shared), true);
        let stderr_task = spawn_reader(stderr_pipe, Arc::clone(&shared), false);

        let job = Arc::new(BackgroundJob {
            command: command.to_string(),
            started_at: Utc::now(),
            shared: Arc::clone(&shared),
            kill_tx: StdMutex::new(Some(kill_tx)),
        });
        self.jobs.write().await.insert(id.clone(), Arc::clone(&job));

        // Monitor: wait for exit, kill signal, or timeout.
        let audit = Arc::clone(&self.audit);
        let monitor_command = command.to_string();
        let monitor_id = id.clone();
        tokio::spawn(async move {
            let started = std::time::Instant::now();
            let deadline = tokio::time::sleep(Duration::from_millis(timeout_ms));
            tokio::pin!(deadline);
            let mut kill_rx = kill_rx;

            enum ExitCause {
                Exited(std::io::Result<std::process::ExitStatus>),
                Killed,
                TimedOut,
            }

            // The wait future borrows the child, so the kill/timeout arms
            // only record the cause; the child is handled after select.
            let cause = tokio::select! {
                status = child.wait() => ExitCause::Exited(status),
                _ = &mut kill_rx => ExitCause::Killed,
                _ = &mut deadline => ExitCause::TimedOut,
            };

            let (final_state, exit_code) = match cause {
                ExitCause::Exited(Ok(status)) => {
                    let state = if status.success() { JobState::Completed } else { JobState::Failed };
                    (state, status.code())
                }
                ExitCause::Exited(Err(e)) => {
                    tracing::warn!(id = %monitor_id, err = %e, "background job wait failed");
                    (JobState::Failed, None)
                }
                ExitCause::Killed => {
                    let _ = child.start_kill();
                    let status = child.wait().await.ok();
                    (JobState::Killed, status.and_then(|s| s.code()))
                }
                ExitCause::TimedOut => {
                    tracing::warn!(id = %monitor_id, timeout_ms, "background job timed out — killed");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    (JobState::TimedOut, None)
                }
            };

            // Let the readers finish draining before sizing the audit record.
            let _ = stdout_task.await;
            let _ = stderr_task.await;

            *shared.state.lock().expect("job state lock") = final_state;
            *shared.exit_code.lock().expect("job exit lock") = exit_code;

            let raw_size = shared.stdout.lock().expect("stdout lock").raw_bytes
                + shared.stderr.lock().expect("stderr lock").raw_bytes;
            let record = ShellAuditRecord {
                timestamp: Utc::now(),
                command: monitor_command,
                duration_ms: started.elapsed().as_millis() as u64,
                exit_code,
                output_size: raw_size,
                success: final_state == JobState::Completed,
            };
            audit.lock().await.push(record);
            tracing::debug!(id = %monitor_id, state = ?final_state, "background job finished");
        });

        Ok(ExecOutcome {
            success: true,
            output: String::new(),
            stderr: String::new(),
            exit_code: None,
            bash_id: Some(id),
            error: None,
        })
    }

    /// Accumulated output of a background job, optionally filtered to lines
    /// matching `filter`.
    pub async fn output(&self, id: &str, filter: Option<&str>) -> Result<JobOutput, ShellError> {
        let job = self
            .jobs
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ShellError::NotFound(id.to_string()))?;

        let re = match filter {
            Some(pattern) => {
                Some(Regex::new(pattern).map_err(|e| ShellError::InvalidFilter(e.to_string()))?)
            }
            None => None,
        };

        let stdout = job.shared.stdout.lock().expect("stdout lock").snapshot();
        let stderr = job.shared.stderr.lock().expect("stderr lock").snapshot();
        let (stdout, stderr) = match &re {
            Some(re) => (filter_lines(&stdout, re), filter_lines(&stderr, re)),
            None => (stdout, stderr),
        };

        let exit_code = *job.shared.exit_code.lock().expect("job exit lock");
        Ok(JobOutput {
            state: job.state(),
            stdout,
            stderr,
            exit_code,
        })
    }

    /// SIGKILL a background job and mark it `Killed`.
    pub async fn kill(&self, id: &str) -> Result<(), ShellError> {
        let job = self
            .jobs
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ShellError::NotFound(id.to_string()))?;

        let tx = job.kill_tx.lock().expect("kill lock").take();
        match tx {
            Some(tx) => {
                // Monitor may already have exited; that race is fine.
                let _ = tx.send(());
                Ok(())
            }
            None => Ok(()), // already killed once; idempotent
        }
    }

    /// States of all tracked jobs (running and finished).
    pub async fn jobs(&self) -> Vec<(String, JobState)> {
        self.jobs
            .read()
            .await
            .iter()
            .map(|(id, j)| (id.clone(), j.state()))
            .collect()
    }

    /// How long a job has been tracked. `None` for unknown ids.
    pub async fn job_age(&self, id: &str) -> Option<chrono::Duration> {
        let jobs = self.jobs.read().await;
        jobs.get(id).map(|j| Utc::now() - j.started_at)
    }

    /// The command a job was started with.
    pub async fn job_command(&self, id: &str) -> Option<String> {
        self.jobs.read().await.get(id).map(|j| j.command.clone())
    }

    pub async fn audit_records(&self) -> Vec<ShellAuditRecord> {
        self.audit.lock().await.clone()
    }

    pub async fn clear_audit(&self) {
        self.audit.lock().await.clear();
    }

    async fn append_audit(
        &self,
        command: &str,
        duration_ms: u64,
        exit_code: Option<i32>,
        output_size: u64,
        success: bool,
    ) {
        self.audit.lock().await.push(ShellAuditRecord {
            timestamp: Utc::now(),
            command: command.to_string(),
            duration_ms,
            exit_code,
            output_size,
            success,
        });
    }
}

fn spawn_reader(
    pipe: Option<impl tokio::io::AsyncRead + Unpin + Send + 'static>,
    shared: Arc<JobShared>,
    is_stdout: bool,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let Some(mut pipe) = pipe else { return };
        let mut buf = [0u8; 8192];
        loop {
            match pipe.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let target = if is_stdout { &shared.stdout } else { &shared.stderr };
                    target.lock().expect("reader lock").push(&buf[..n]);
                }
            }
        }
    })
}

fn filter_lines(text: &str, re: &Regex) -> String {
    text.lines()
        .filter(|line| re.is_match(line))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn foreground_captures_output_and_exit_code() {
        let engine = ShellEngine::new();
        let out = engine
            .execute("echo hello; echo oops >&2; exit 3", ExecOptions::default())
            .await
            .unwrap();
        assert!(!out.success);
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.output.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn foreground_timeout_kills_and_reports() {
        let engine = ShellEngine::new();
        let started = std::time::Instant::now();
        let out = engine
            .execute(
                "sleep 30",
                ExecOptions {
                    timeout_ms: Some(100),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!out.success);
        assert!(out.error.as_deref().unwrap().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn denied_command_never_spawns() {
        let engine = ShellEngine::new();
        let err = engine.execute("rm -rf /", ExecOptions::default()).await.unwrap_err();
        assert!(matches!(err, ShellError::PolicyDenied(_)));
        assert!(err.to_string().contains("security"));
        // No audit record: nothing ran.
        assert!(engine.audit_records().await.is_empty());
    }

    #[tokio::test]
    async fn visible_output_is_bounded_but_audit_sees_raw_size() {
        let engine = ShellEngine::new();
        // ~100 KB of output, far over the 30 KB visible cap.
        let out = engine
            .execute(
                "head -c 100000 /dev/zero | tr '\\0' 'a'",
                ExecOptions::default(),
            )
            .await
            .unwrap();
        assert!(out.output.len() <= MAX_VISIBLE_OUTPUT + TRUNCATION_MARKER.len());
        assert!(out.output.ends_with(TRUNCATION_MARKER));

        let audit = engine.audit_records().await;
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].output_size, 100_000);
        assert!(audit[0].success);
    }

    #[tokio::test]
    async fn background_job_streams_and_completes() {
        let engine = ShellEngine::new();
        let out = engine
            .execute(
                "echo line-one; echo line-two",
                ExecOptions {
                    background: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let id = out.bash_id.unwrap();

        // Poll until the job finishes.
        let mut state = JobState::Running;
        for _ in 0..100 {
            state = engine.output(&id, None).await.unwrap().state;
            if state != JobState::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(state, JobState::Completed);

        let output = engine.output(&id, None).await.unwrap();
        assert!(output.stdout.contains("line-one"));
        assert_eq!(output.exit_code, Some(0));

        // Regex filter selects matching lines only.
        let filtered = engine.output(&id, Some("two")).await.unwrap();
        assert_eq!(filtered.stdout.trim(), "line-two");
    }

    #[tokio::test]
    async fn invalid_output_filter_is_an_error() {
        let engine = ShellEngine::new();
        let out = engine
            .execute(
                "echo x",
                ExecOptions {
                    background: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let id = out.bash_id.unwrap();
        let err = engine.output(&id, Some("([")).await.unwrap_err();
        assert!(matches!(err, ShellError::InvalidFilter(_)));
    }

    #[tokio::test]
    async fn background_cap_rejects_then_kill_frees_a_slot() {
        let engine = ShellEngine::new();
        let mut ids = Vec::new();
        for _ in 0..MAX_BACKGROUND_JOBS {
            let out = engine
                .execute(
                    "sleep 10",
                    ExecOptions {
                        background: true,
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            ids.push(out.bash_id.unwrap());
        }

        let err = engine
            .execute(
                "sleep 10",
                ExecOptions {
                    background: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Maximum number of background shells"));

        // Kill one and wait for the slot to free.
        engine.kill(&ids[0]).await.unwrap();
        let mut freed = false;
        for _ in 0..100 {
            if engine.output(&ids[0], None).await.unwrap().state == JobState::Killed {
                freed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(freed, "killed job should leave Running state");

        let out = engine
            .execute(
                "echo replacement",
                ExecOptions {
                    background: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(out.bash_id.is_some());

        // Cleanup.
        for id in &ids[1..] {
            let _ = engine.kill(id).await;
        }
    }

    #[tokio::test]
    async fn kill_unknown_id_is_not_found() {
        let engine = ShellEngine::new();
        assert!(matches!(
            engine.kill("bash_999").await.unwrap_err(),
            ShellError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn clear_audit_resets() {
        let engine = ShellEngine::new();
        engine.execute("true", ExecOptions::default()).await.unwrap();
        assert_eq!(engine.audit_records().await.len(), 1);
        engine.clear_audit().await;
        assert!(engine.audit_records().await.is_empty());
    }
}
