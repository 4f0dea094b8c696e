//! Agent record shapes — persisted as one JSON document per agent under the
//! agents directory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::AgentError;

/// The fixed set of sub-agent types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentType {
    GeneralPurpose,
    Explore,
    Plan,
    CodeReview,
    Test,
}

impl AgentType {
    pub const ALL: [AgentType; 5] = [
        AgentType::GeneralPurpose,
        AgentType::Explore,
        AgentType::Plan,
        AgentType::CodeReview,
        AgentType::Test,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::GeneralPurpose => "general-purpose",
            AgentType::Explore => "explore",
            AgentType::Plan => "plan",
            AgentType::CodeReview => "code-review",
            AgentType::Test => "test",
        }
    }

    /// Parse a type name; the error lists every accepted value.
    pub fn parse(s: &str) -> Result<Self, AgentError> {
        Self::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| AgentError::UnknownType {
                given: s.to_string(),
                accepted: Self::ALL
                    .iter()
                    .map(|t| t.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Killed,
}

impl AgentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentStatus::Completed | AgentStatus::Failed | AgentStatus::Killed
        )
    }
}

/// One entry of an agent's execution history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStep {
    pub step: String,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// The persisted record of one sub-agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub agent_type: AgentType,
    pub status: AgentStatus,
    pub description: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_agent_id: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub history: Vec<AgentStep>,
    /// Output accumulated so far (complete once the agent is terminal).
    #[serde(default)]
    pub transcript: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentRecord {
    pub fn new(
        agent_type: AgentType,
        description: impl Into<String>,
        prompt: impl Into<String>,
        model: Option<String>,
        parent_agent_id: Option<String>,
    ) -> Self {
        let mut record = Self {
            agent_id: Uuid::new_v4().to_string(),
            agent_type,
            status: AgentStatus::Pending,
            description: description.into(),
            prompt: prompt.into(),
            model,
            parent_agent_id,
            started_at: Utc::now(),
            ended_at: None,
            history: Vec::new(),
            transcript: String::new(),
            error: None,
        };
        record.push_step("created", None);
        record
    }

    pub fn push_step(&mut self, step: &str, detail: Option<String>) {
        self.history.push(AgentStep {
            step: step.to_string(),
            at: Utc::now(),
            detail,
        });
    }
}
