//! One supervised language-server process.
//!
//! An `LspServer` owns its child, the framed stdio transport, the
//! pending-request table, and the open-document table. All outgoing writes
//! funnel through a single writer task so header/body pairs never
//! interleave on the wire; replies may arrive out of order and are routed
//! back to their waiters by id.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};

use super::framing::{encode_frame, FrameBuffer};
use super::model::{file_uri, LspEvent, LspServerConfig, OpenDocument, ServerState, Transport};
use super::{
    LspError, CONTENT_MODIFIED_CODE, DEFAULT_MAX_RESTARTS, MAX_CONTENT_MODIFIED_RETRIES,
    REQUEST_TIMEOUT, RESTART_DELAY, RETRY_BASE_DELAY,
};

type PendingMap = HashMap<u64, oneshot::Sender<Result<Value, LspError>>>;

pub struct LspServer {
    config: LspServerConfig,
    workspace_root: PathBuf,
    state: StdRwLock<ServerState>,
    next_id: AtomicU64,
    pending: Mutex<PendingMap>,
    documents: Mutex<HashMap<String, OpenDocument>>,
    diagnostics: Mutex<HashMap<String, Value>>,
    writer_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    events: broadcast::Sender<LspEvent>,
    restart_count: AtomicU32,
    /// Set while a deliberate `stop` is in flight so the exit monitor does
    /// not treat it as a crash.
    stopping: AtomicBool,
}

impl LspServer {
    pub fn new(config: LspServerConfig, workspace_root: impl Into<PathBuf>) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            config,
            workspace_root: workspace_root.into(),
            state: StdRwLock::new(ServerState::Stopped),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            documents: Mutex::new(HashMap::new()),
            diagnostics: Mutex::new(HashMap::new()),
            writer_tx: Mutex::new(None),
            shutdown_tx: Mutex::new(None),
            events,
            restart_count: AtomicU32::new(0),
            stopping: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &LspServerConfig {
        &self.config
    }

    pub fn state(&self) -> ServerState {
        *self.state.read().expect("state lock")
    }

    fn set_state(&self, state: ServerState) {
        *self.state.write().expect("state lock") = state;
    }

    pub fn restarts(&self) -> u32 {
        self.restart_count.load(Ordering::Relaxed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LspEvent> {
        self.events.subscribe()
    }

    pub fn handles_extension(&self, ext: &str) -> bool {
        self.config.handles_extension(ext)
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────────

    /// Spawn the child, wire the transport, and run the `initialize`
    /// handshake. On success the server is `Ready`; on failure it is
    /// `Error` and the error surfaces to the caller.
    ///
    /// Boxed explicitly (rather than left as an `async fn`) because `start`
    /// and `restart` are mutually recursive through spawned tasks, and the
    /// compiler cannot resolve the opaque `Send` future type of a genuine
    /// cycle — see rust-lang/rust#64552.
    pub fn start(
        self: Arc<Self>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), LspError>> + Send>> {
        Box::pin(self.start_inner())
    }

    async fn start_inner(self: Arc<Self>) -> Result<(), LspError> {
        match self.state() {
            ServerState::Initializing | ServerState::Ready => return Ok(()),
            ServerState::Stopped | ServerState::Error => {}
        }
        self.set_state(ServerState::Initializing);

        let spec = self.config.expanded(&self.workspace_root);
        if spec.transport == Transport::Socket {
            tracing::warn!(server = %spec.name, "socket transport not supported — using stdio");
        }
        if !executable_on_path(&spec.command) {
            tracing::warn!(
                server = %spec.name,
                command = %spec.command,
                "executable not found on PATH — launch will likely fail; install it or set npmPackage bootstrap up"
            );
        }

        let cwd = spec
            .workspace_folder
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.workspace_root.clone());

        let mut cmd = tokio::process::Command::new(&spec.command);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .current_dir(&cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            self.set_state(ServerState::Error);
            LspError::ChildFailed(format!("could not spawn '{}': {e}", spec.command))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| LspError::ChildFailed("child stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LspError::ChildFailed("child stdout unavailable".to_string()))?;
        let stderr = child.stderr.take();

        // Writer task: the only hand that touches stdin.
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        *self.writer_tx.lock().await = Some(tx);
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(bytes) = rx.recv().await {
                if stdin.write_all(&bytes).await.is_err() {
                    break;
                }
                let _ = stdin.flush().await;
            }
        });

        // Forward child stderr to our log at debug.
        if let Some(stderr) = stderr {
            let name = spec.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(server = %name, "{line}");
                }
            });
        }

        // Reader task: accumulate bytes, parse frames, route messages.
        let this = Arc::clone(&self);
        tokio::spawn(async move {
            let mut stdout = stdout;
            let mut frames = FrameBuffer::new();
            let mut chunk = [0u8; 8192];
            loop {
                match stdout.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        frames.extend(&chunk[..n]);
                        loop {
                            match frames.next_frame() {
                                Ok(Some(msg)) => this.route_message(msg).await,
                                Ok(None) => break,
                                Err(e) => {
                                    // The malformed frame was discarded;
                                    // keep parsing from the next one.
                                    tracing::warn!(server = %this.config.name, err = %e, "bad frame");
                                }
                            }
                        }
                    }
                }
            }
        });

        // Exit monitor.
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        *self.shutdown_tx.lock().await = Some(shutdown_tx);
        let this = Arc::clone(&self);
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown_rx;
            // Record only the cause inside select; the wait future borrows
            // the child, so the kill happens after.
            let exited = tokio::select! {
                status = child.wait() => Some(status.ok()),
                _ = &mut shutdown_rx => None,
            };
            let status = match exited {
                Some(status) => status,
                None => {
                    let _ = child.start_kill();
                    child.wait().await.ok()
                }
            };
            this.on_exit(status).await;
        });

        // Initialize handshake.
        let startup = Duration::from_millis(spec.startup_timeout.unwrap_or(30_000));
        let init_params = json!({
            "processId": std::process::id(),
            "rootUri": file_uri(&self.workspace_root),
            "capabilities": {
                "textDocument": {
                    "synchronization": { "didSave": true },
                    "publishDiagnostics": {}
                },
                "workspace": { "configuration": true }
            },
            "initializationOptions": spec.initialization_options,
        });

        match self.raw_request("initialize", init_params, startup).await {
            Ok(_capabilities) => {
                self.set_state(ServerState::Ready);
                self.notify("initialized", json!({})).await?;
                if let Some(settings) = &spec.settings {
                    self.notify(
                        "workspace/didChangeConfiguration",
                        json!({ "settings": settings }),
                    )
                    .await?;
                }
                let _ = self.events.send(LspEvent::Ready { name: spec.name.clone() });
                tracing::info!(server = %spec.name, "language server ready");
                Ok(())
            }
            Err(e) => {
                self.set_state(ServerState::Error);
                let _ = self.events.send(LspEvent::ServerError {
                    name: spec.name.clone(),
                    message: e.to_string(),
                });
                tracing::warn!(server = %spec.name, err = %e, "initialize failed");
                Err(e)
            }
        }
    }

    /// Kill the child and wait for the exit monitor to settle.
    pub async fn stop(&self) {
        let tx = self.shutdown_tx.lock().await.take();
        let Some(tx) = tx else { return };
        self.stopping.store(true, Ordering::SeqCst);
        let _ = tx.send(());

        let deadline = self.config.shutdown_timeout.unwrap_or(2_000);
        let mut waited = 0u64;
        while self.state() != ServerState::Stopped && waited < deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
            waited += 25;
        }
    }

    /// Stop then start, counting against the restart cap.
    pub async fn restart(self: Arc<Self>) -> Result<(), LspError> {
        let count = self.restart_count.fetch_add(1, Ordering::SeqCst) + 1;
        let max = self.config.max_restarts.unwrap_or(DEFAULT_MAX_RESTARTS);
        if count > max {
            self.set_state(ServerState::Error);
            return Err(LspError::RestartLimit(max));
        }
        tracing::info!(server = %self.config.name, attempt = count, max, "restarting language server");
        self.stop().await;
        self.start().await
    }

    async fn on_exit(self: Arc<Self>, status: Option<std::process::ExitStatus>) {
        let code = status.and_then(|s| s.code());
        let was_ready = {
            let mut state = self.state.write().expect("state lock");
            let prev = *state;
            *state = ServerState::Stopped;
            prev == ServerState::Ready
        };

        // Every in-flight request gets exactly one resolution.
        let mut pending = self.pending.lock().await;
        for (_, waiter) in pending.drain() {
            let _ = waiter.send(Err(LspError::ChildFailed(format!(
                "server '{}' exited",
                self.config.name
            ))));
        }
        drop(pending);

        // Open documents do not survive the process.
        self.documents.lock().await.clear();
        *self.writer_tx.lock().await = None;
        *self.shutdown_tx.lock().await = None;

        let _ = self.events.send(LspEvent::Exit {
            name: self.config.name.clone(),
            code,
        });
        tracing::info!(server = %self.config.name, code = ?code, "language server exited");

        let deliberate = self.stopping.swap(false, Ordering::SeqCst);
        let crashed = !deliberate && was_ready && code.map(|c| c != 0).unwrap_or(true);
        if !crashed || !self.config.restart_on_crash.unwrap_or(false) {
            return;
        }

        let max = self.config.max_restarts.unwrap_or(DEFAULT_MAX_RESTARTS);
        if self.restarts() >= max {
            tracing::warn!(server = %self.config.name, max, "crash restart limit reached");
            self.set_state(ServerState::Error);
            return;
        }

        let this = Arc::clone(&self);
        tokio::spawn(async move {
            tokio::time::sleep(RESTART_DELAY).await;
            if let Err(e) = this.restart().await {
                tracing::warn!(err = %e, "crash restart failed");
            }
        });
    }

    // ─── Requests & notifications ───────────────────────────────────────────

    /// Issue a request to a ready server with the standard deadline.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, LspError> {
        let state = self.state();
        if state != ServerState::Ready {
            return Err(LspError::NotReady {
                name: self.config.name.clone(),
                state,
            });
        }
        self.raw_request(method, params, REQUEST_TIMEOUT).await
    }

    /// Request with automatic retry on content-modified replies.
    pub async fn request_with_retry(
        &self,
        method: &str,
        params: Value,
    ) -> Result<Value, LspError> {
        with_content_modified_retry(|| self.request(method, params.clone())).await
    }

    async fn raw_request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, LspError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let msg = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        if let Err(e) = self.send_frame(&msg).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Err(_) => {
                // Deadline fired first: remove the waiter so a late reply is
                // dropped instead of resolving a dead request.
                self.pending.lock().await.remove(&id);
                tracing::warn!(server = %self.config.name, method, id, ?timeout, "request timed out");
                Err(LspError::TimedOut(timeout))
            }
            Ok(Err(_)) => Err(LspError::ChildFailed("request channel closed".to_string())),
            Ok(Ok(outcome)) => outcome,
        }
    }

    /// Send a notification (no id, no reply).
    pub async fn notify(&self, method: &str, params: Value) -> Result<(), LspError> {
        let msg = json!({ "jsonrpc": "2.0", "method": method, "params": params });
        self.send_frame(&msg).await
    }

    async fn send_frame(&self, msg: &Value) -> Result<(), LspError> {
        let tx = self.writer_tx.lock().await.clone();
        let Some(tx) = tx else {
            return Err(LspError::ChildFailed("server not running".to_string()));
        };
        tx.send(encode_frame(msg))
            .map_err(|_| LspError::ChildFailed("writer task gone".to_string()))
    }

    async fn route_message(&self, msg: Value) {
        let id = msg.get("id").and_then(|v| v.as_u64());
        let method = msg.get("method").and_then(|v| v.as_str());

        match (id, method) {
            // Reply to one of our requests.
            (Some(id), None) => {
                let waiter = self.pending.lock().await.remove(&id);
                let Some(waiter) = waiter else {
                    tracing::debug!(server = %self.config.name, id, "reply for unknown request id");
                    return;
                };
                let outcome = if let Some(err) = msg.get("error") {
                    Err(LspError::Rpc {
                        code: err.get("code").and_then(|c| c.as_i64()).unwrap_or(0),
                        message: err
                            .get("message")
                            .and_then(|m| m.as_str())
                            .unwrap_or("unknown server error")
                            .to_string(),
                    })
                } else {
                    Ok(msg.get("result").cloned().unwrap_or(Value::Null))
                };
                let _ = waiter.send(outcome);
            }
            // Server-to-client request: answer null so the server never
            // stalls waiting on us.
            (Some(id), Some(method)) => {
                tracing::debug!(server = %self.config.name, method, "server request — answering null");
                let reply = json!({ "jsonrpc": "2.0", "id": id, "result": null });
                let _ = self.send_frame(&reply).await;
            }
            // Notification.
            (None, Some(method)) => {
                let params = msg.get("params").cloned().unwrap_or(Value::Null);
                if method == "textDocument/publishDiagnostics" {
                    if let Some(uri) = params.get("uri").and_then(|v| v.as_str()) {
                        let diagnostics = params
                            .get("diagnostics")
                            .cloned()
                            .unwrap_or_else(|| Value::Array(vec![]));
                        self.diagnostics
                            .lock()
                            .await
                            .insert(uri.to_string(), diagnostics.clone());
                        let _ = self.events.send(LspEvent::Diagnostics {
                            uri: uri.to_string(),
                            diagnostics,
                        });
                    }
                } else {
                    let _ = self.events.send(LspEvent::Notification {
                        method: method.to_string(),
                        params,
                    });
                }
            }
            (None, None) => {
                tracing::debug!(server = %self.config.name, "frame with neither id nor method — dropped");
            }
        }
    }

    // ─── Documents ──────────────────────────────────────────────────────────

    /// Open a document. A prior open of the same path is closed first so
    /// the server sees a clean didOpen with version 1.
    pub async fn open_document(
        &self,
        path: &Path,
        content: &str,
        language_id: &str,
    ) -> Result<(), LspError> {
        let key = path.to_string_lossy().to_string();
        if self.documents.lock().await.contains_key(&key) {
            self.close_document(path).await?;
        }

        let uri = file_uri(path);
        self.notify(
            "textDocument/didOpen",
            json!({
                "textDocument": {
                    "uri": uri,
                    "languageId": language_id,
                    "version": 1,
                    "text": content
                }
            }),
        )
        .await?;

        self.documents.lock().await.insert(
            key,
            OpenDocument {
                uri,
                language_id: language_id.to_string(),
                version: 1,
                content: content.to_string(),
            },
        );
        Ok(())
    }

    /// Whole-document replacement; bumps the version.
    pub async fn change_document(&self, path: &Path, content: &str) -> Result<(), LspError> {
        let key = path.to_string_lossy().to_string();
        let (uri, version) = {
            let mut documents = self.documents.lock().await;
            let doc = documents
                .get_mut(&key)
                .ok_or_else(|| LspError::DocumentNotOpen(key.clone()))?;
            doc.version += 1;
            doc.content = content.to_string();
            (doc.uri.clone(), doc.version)
        };

        self.notify(
            "textDocument/didChange",
            json!({
                "textDocument": { "uri": uri, "version": version },
                "contentChanges": [{ "text": content }]
            }),
        )
        .await
    }

    pub async fn close_document(&self, path: &Path) -> Result<(), LspError> {
        let key = path.to_string_lossy().to_string();
        let doc = self
            .documents
            .lock()
            .await
            .remove(&key)
            .ok_or_else(|| LspError::DocumentNotOpen(key.clone()))?;
        self.notify(
            "textDocument/didClose",
            json!({ "textDocument": { "uri": doc.uri } }),
        )
        .await
    }

    pub async fn is_document_open(&self, path: &Path) -> bool {
        self.documents
            .lock()
            .await
            .contains_key(path.to_string_lossy().as_ref())
    }

    pub async fn document_version(&self, path: &Path) -> Option<i64> {
        self.documents
            .lock()
            .await
            .get(path.to_string_lossy().as_ref())
            .map(|d| d.version)
    }

    /// Cached diagnostics pushed by the server for a file, if any.
    pub async fn file_diagnostics(&self, path: &Path) -> Option<Value> {
        self.diagnostics.lock().await.get(&file_uri(path)).cloned()
    }

    /// Force a lifecycle state. Test scaffolding; not for production use.
    #[doc(hidden)]
    pub fn force_state_for_test(&self, state: ServerState) {
        self.set_state(state);
    }
}

/// Retry loop for content-modified (−32801) replies: up to three retries
/// with `500ms × 2^attempt` backoff; any other error surfaces immediately.
pub async fn with_content_modified_retry<F, Fut>(mut send: F) -> Result<Value, LspError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<Value, LspError>>,
{
    let mut attempt = 0u32;
    loop {
        match send().await {
            Err(LspError::Rpc { code, .. })
                if code == CONTENT_MODIFIED_CODE && attempt < MAX_CONTENT_MODIFIED_RETRIES =>
            {
                let delay = RETRY_BASE_DELAY * 2u32.pow(attempt);
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "content modified — retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            outcome => return outcome,
        }
    }
}

fn executable_on_path(command: &str) -> bool {
    if command.contains('/') {
        return Path::new(command).exists();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(command).is_file()))
        .unwrap_or(false)
}
