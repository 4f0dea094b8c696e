//! The supervisor: server registry, config discovery, and per-file routing.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;

use super::model::{load_lsp_config, LspServerConfig, ServerState};
use super::server::LspServer;
use super::LspError;

pub struct LspSupervisor {
    workspace_root: PathBuf,
    /// Registration order is routing precedence.
    servers: RwLock<Vec<Arc<LspServer>>>,
}

impl LspSupervisor {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            servers: RwLock::new(Vec::new()),
        }
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    /// Register a server spec. Returns the handle.
    pub async fn register(&self, config: LspServerConfig) -> Arc<LspServer> {
        let server = LspServer::new(config, &self.workspace_root);
        self.servers.write().await.push(Arc::clone(&server));
        server
    }

    /// Discover `.lsp.json` specs and register them, then fill gaps with the
    /// built-in defaults (a discovered server suppresses the default with
    /// the same name). Returns how many servers are registered.
    pub async fn load_configs(&self) -> usize {
        let discovered = load_lsp_config(&self.workspace_root);
        let discovered_names: Vec<String> = discovered.iter().map(|c| c.name.clone()).collect();
        for config in discovered {
            self.register(config).await;
        }
        for config in LspServerConfig::builtin_defaults() {
            if !discovered_names.contains(&config.name) {
                self.register(config).await;
            }
        }
        self.servers.read().await.len()
    }

    /// Start every registered server. Startup failures mark the server
    /// `Error` and are logged, not propagated; the count of ready servers
    /// is returned.
    pub async fn start_all(&self) -> usize {
        let servers = self.servers.read().await.clone();
        let mut ready = 0;
        for server in servers {
            match Arc::clone(&server).start().await {
                Ok(()) => ready += 1,
                Err(e) => {
                    tracing::warn!(server = %server.name(), err = %e, "language server failed to start");
                }
            }
        }
        ready
    }

    pub async fn stop_all(&self) {
        let servers = self.servers.read().await.clone();
        for server in servers {
            server.stop().await;
        }
    }

    pub async fn servers(&self) -> Vec<Arc<LspServer>> {
        self.servers.read().await.clone()
    }

    /// The earliest-registered ready server claiming the file's extension.
    pub async fn server_for_file(&self, path: &Path) -> Option<Arc<LspServer>> {
        let ext = path.extension().and_then(|e| e.to_str())?;
        self.servers
            .read()
            .await
            .iter()
            .find(|s| s.state() == ServerState::Ready && s.handles_extension(ext))
            .cloned()
    }

    /// The server currently holding the document open, regardless of its
    /// state.
    async fn server_owning_document(&self, path: &Path) -> Option<Arc<LspServer>> {
        for server in self.servers.read().await.iter() {
            if server.is_document_open(path).await {
                return Some(Arc::clone(server));
            }
        }
        None
    }

    // ─── Document routing ───────────────────────────────────────────────────

    /// Open a document on the routed server. Any prior open of the path, on
    /// any server, is closed first: a document is open in exactly one
    /// server.
    pub async fn open_document(
        &self,
        path: &Path,
        content: &str,
        language_id: Option<&str>,
    ) -> Result<(), LspError> {
        let server = self
            .server_for_file(path)
            .await
            .ok_or_else(|| LspError::NoServerForFile(path.to_string_lossy().to_string()))?;

        if let Some(holder) = self.server_owning_document(path).await {
            if !Arc::ptr_eq(&holder, &server) {
                let _ = holder.close_document(path).await;
            }
        }

        let language_id = language_id
            .map(str::to_string)
            .unwrap_or_else(|| server.config().language_id_for(path));
        server.open_document(path, content, &language_id).await
    }

    pub async fn change_document(&self, path: &Path, content: &str) -> Result<(), LspError> {
        let server = self
            .server_owning_document(path)
            .await
            .ok_or_else(|| LspError::DocumentNotOpen(path.to_string_lossy().to_string()))?;
        server.change_document(path, content).await
    }

    pub async fn close_document(&self, path: &Path) -> Result<(), LspError> {
        let server = self
            .server_owning_document(path)
            .await
            .ok_or_else(|| LspError::DocumentNotOpen(path.to_string_lossy().to_string()))?;
        server.close_document(path).await
    }

    pub async fn is_document_open(&self, path: &Path) -> bool {
        self.server_owning_document(path).await.is_some()
    }

    /// Route a request to the server handling the file.
    pub async fn request_for_file(
        &self,
        path: &Path,
        method: &str,
        params: Value,
    ) -> Result<Value, LspError> {
        let server = self
            .server_for_file(path)
            .await
            .ok_or_else(|| LspError::NoServerForFile(path.to_string_lossy().to_string()))?;
        server.request_with_retry(method, params).await
    }

    /// Cached diagnostics for a file from whichever server produced them.
    pub async fn file_diagnostics(&self, path: &Path) -> Option<Value> {
        for server in self.servers.read().await.iter() {
            if let Some(diagnostics) = server.file_diagnostics(path).await {
                return Some(diagnostics);
            }
        }
        None
    }
}
