//! `shell` — command execution with safety policy, timeouts, bounded output,
//! and tracked background jobs.

pub mod engine;
pub mod policy;

pub use engine::{ExecOptions, ExecOutcome, ShellAuditRecord, ShellEngine};
pub use policy::{check_command, CommandVerdict};

use thiserror::Error;

/// Upper bound on live background jobs per engine.
pub const MAX_BACKGROUND_JOBS: usize = 12;

/// Visible output cap in bytes; overflow is truncated with a marker. The raw
/// size is still tracked in the audit record.
pub const MAX_VISIBLE_OUTPUT: usize = 30_000;

/// Caller timeouts are clamped into `[0, MAX_TIMEOUT_MS]`.
pub const MAX_TIMEOUT_MS: u64 = 600_000;

/// Timeout applied when the caller does not provide one.
pub const DEFAULT_TIMEOUT_MS: u64 = 120_000;

/// Current lifecycle state of a shell job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    Running,
    Completed,
    Failed,
    TimedOut,
    Killed,
}

#[derive(Debug, Error)]
pub enum ShellError {
    /// The command matched the security deny list. No child is spawned.
    #[error("security: command refused by policy: {0}")]
    PolicyDenied(String),
    #[error("Maximum number of background shells reached ({MAX_BACKGROUND_JOBS})")]
    TooManyBackgroundJobs,
    #[error("no background shell with id '{0}'")]
    NotFound(String),
    #[error("invalid output filter regex: {0}")]
    InvalidFilter(String),
    #[error("could not spawn command: {0}")]
    Spawn(#[from] std::io::Error),
}
