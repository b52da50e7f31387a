use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Wall-clock milliseconds since the epoch. Every timestamp written to the
/// coordination store uses this clock so that processes can compare them.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Identity of an agent process.
///
/// Compared by value across processes. Deserialization accepts numbers as well
/// as strings so a record written by a differently-typed producer still
/// matches the agent that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into().trim().to_string())
    }

    /// Fresh process-unique identity.
    pub fn generate() -> Self {
        Self(format!("agent_{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for AgentId {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

impl<'de> Deserialize<'de> for AgentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Signed(i64),
            Unsigned(u64),
            Float(f64),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(s) => AgentId::new(s),
            Raw::Signed(n) => AgentId::new(n.to_string()),
            Raw::Unsigned(n) => AgentId::new(n.to_string()),
            Raw::Float(n) => AgentId::new(n.to_string()),
        })
    }
}

/// A url waiting in the commander's priority set for an idle agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingJob {
    pub id: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub priority: i64,
    pub timestamp: i64,
}

impl PendingJob {
    pub fn new(url: impl Into<String>, session_id: Option<String>, priority: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            url: url.into(),
            session_id,
            priority,
            timestamp: now_ms(),
        }
    }

    /// Payload handed to the job queue once an agent has been chosen.
    pub fn into_job_data(self, assigned_to: AgentId) -> ReplayJobData {
        ReplayJobData {
            url: self.url,
            session_id: self.session_id,
            priority: Some(self.priority),
            timestamp: self.timestamp,
            assigned_to: Some(assigned_to),
        }
    }
}

/// Payload carried by a queue job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayJobData {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    pub timestamp: i64,
    /// Authoritative owner. Set once by the commander and never changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<AgentId>,
}

impl ReplayJobData {
    pub fn is_owned_by(&self, agent_id: &AgentId) -> bool {
        self.assigned_to.as_ref() == Some(agent_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
}

impl JobState {
    pub fn is_finished(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Waiting => write!(f, "waiting"),
            JobState::Active => write!(f, "active"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
            JobState::Delayed => write!(f, "delayed"),
        }
    }
}

/// The job queue's own record of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueJob {
    pub id: String,
    pub data: ReplayJobData,
    pub state: JobState,
    pub attempts_made: u32,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_on: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_on: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,
}

impl QueueJob {
    pub fn new(id: impl Into<String>, data: ReplayJobData) -> Self {
        Self {
            id: id.into(),
            data,
            state: JobState::Waiting,
            attempts_made: 0,
            created_at: now_ms(),
            processed_on: None,
            finished_on: None,
            return_value: None,
            failed_reason: None,
        }
    }

    pub fn url(&self) -> &str {
        &self.data.url
    }

    pub fn assigned_to(&self) -> Option<&AgentId> {
        self.data.assigned_to.as_ref()
    }
}
