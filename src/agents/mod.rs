//! `agents` — sub-agent scheduling, persistence, and output streaming.

pub mod model;
pub mod scheduler;

pub use model::{AgentRecord, AgentStatus, AgentStep, AgentType};
pub use scheduler::{
    AgentRunner, AgentScheduler, AgentTranscript, EchoRunner, OutputSink, TaskRequest, TaskResult,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("unknown agent type '{given}'; accepted values: {accepted}")]
    UnknownType { given: String, accepted: String },
    #[error("no agent with id '{0}'")]
    NotFound(String),
    #[error("agent '{0}' already completed and cannot be resumed")]
    ResumeCompleted(String),
    #[error("agent '{id}' is {status:?}; only paused agents can be resumed")]
    NotResumable { id: String, status: AgentStatus },
    #[error("agent '{id}' is not running (status: {status:?})")]
    NotRunning { id: String, status: AgentStatus },
    #[error("corrupt agent record: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
