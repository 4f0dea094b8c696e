//! `lsp` — supervision of external language-server child processes.
//!
//! Each registered server owns one child process, its framed stdio
//! transport, a pending-request table keyed by monotonic id, and the set of
//! documents opened against it. The supervisor routes per-file operations to
//! the server whose registered extensions match, in registration order.

pub mod framing;
pub mod model;
pub mod server;
pub mod supervisor;

pub use framing::{encode_frame, FrameBuffer};
pub use model::{
    load_lsp_config, LspEvent, LspServerConfig, OpenDocument, ServerState, Transport,
};
pub use server::{with_content_modified_retry, LspServer};
pub use supervisor::LspSupervisor;

use std::time::Duration;

use thiserror::Error;

/// Deadline for an individual JSON-RPC request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// JSON-RPC error code the server sends when the document changed between
/// request issue and handling. The one error class retried automatically.
pub const CONTENT_MODIFIED_CODE: i64 = -32801;

/// Retries attempted on content-modified, after the initial request.
pub const MAX_CONTENT_MODIFIED_RETRIES: u32 = 3;

/// Backoff base for content-modified retries: `500ms × 2^attempt`.
pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Wait between a crash and the automatic restart.
pub const RESTART_DELAY: Duration = Duration::from_secs(1);

/// Restart cap when the config does not set `maxRestarts`.
pub const DEFAULT_MAX_RESTARTS: u32 = 3;

#[derive(Debug, Error)]
pub enum LspError {
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("request timed out after {0:?}")]
    TimedOut(Duration),
    #[error("language server '{name}' is not ready (state: {state:?})")]
    NotReady { name: String, state: ServerState },
    #[error("language server failed: {0}")]
    ChildFailed(String),
    #[error("server error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("no language server handles '{0}'")]
    NoServerForFile(String),
    #[error("document not open: {0}")]
    DocumentNotOpen(String),
    #[error("restart limit reached ({0})")]
    RestartLimit(u32),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
