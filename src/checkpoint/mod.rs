//! `checkpoint` — per-file edit history with base+delta chains, compression,
//! storage caps, and restoration.
//!
//! Each tracked file owns an ordered chain whose first element always
//! carries full content; later elements carry either a line diff or a full
//! re-base. Reconstruction replays diffs from the nearest preceding full
//! element. A session directory under the configured root holds one JSON
//! file per checkpoint plus `session.json`.

pub mod diff;
pub mod model;
pub mod session;

pub use diff::{apply_diff, line_diff, DiffEntry, DiffOp};
pub use model::{FileCheckpoint, SessionMeta, COMPRESS_THRESHOLD};
pub use session::CheckpointSession;

use std::path::PathBuf;

use thiserror::Error;

/// Chain length cap; overflow removes middle entries, never the base.
pub const MAX_CHECKPOINTS_PER_FILE: usize = 50;

/// Session storage cap in megabytes.
pub const MAX_STORAGE_MB: u64 = 100;

/// Edits tracked on a file before a checkpoint is taken automatically.
pub const DEFAULT_AUTO_CHECKPOINT_EDITS: u32 = 10;

/// Session directories idle longer than this are swept at init.
pub const SESSION_RETENTION_DAYS: u64 = 30;

#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    /// Root under which session directories are created.
    pub root: PathBuf,
    pub max_checkpoints_per_file: usize,
    pub max_storage_mb: u64,
    pub auto_checkpoint_edits: u32,
}

impl CheckpointConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_checkpoints_per_file: MAX_CHECKPOINTS_PER_FILE,
            max_storage_mb: MAX_STORAGE_MB,
            auto_checkpoint_edits: DEFAULT_AUTO_CHECKPOINT_EDITS,
        }
    }
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("no checkpoint chain for '{0}'")]
    NotFound(String),
    #[error("checkpoint index {index} out of range (chain length {len})")]
    BadIndex { index: usize, len: usize },
    #[error("already at the oldest checkpoint")]
    AtOldest,
    #[error("already at the newest checkpoint")]
    AtNewest,
    #[error("checkpoint storage full: {current_bytes} bytes used, limit {limit_bytes}")]
    StorageFull { current_bytes: u64, limit_bytes: u64 },
    #[error("corrupt checkpoint state: {0}")]
    InternalCorruption(String),
    #[error("corrupt checkpoint data: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Options for `create_checkpoint`.
#[derive(Debug, Clone, Default)]
pub struct CheckpointOptions {
    pub name: Option<String>,
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
    /// Store full content even when a diff would do.
    pub force_full_content: bool,
}

/// Options for `restore_checkpoint`.
#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Checkpoint the current file state before overwriting it.
    pub create_backup: bool,
    /// Return the reconstructed content without touching disk.
    pub dry_run: bool,
    /// Restore the recorded file mode (best effort).
    pub preserve_metadata: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            create_backup: true,
            dry_run: false,
            preserve_metadata: true,
        }
    }
}
