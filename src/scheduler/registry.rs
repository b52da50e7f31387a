use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::scheduler::job::{now_ms, AgentId};
use crate::store::{keys, Batch, SharedStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Busy,
}

/// Per-agent status record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    pub agent_id: AgentId,
    pub status: AgentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub last_heartbeat: i64,
}

impl AgentRecord {
    pub fn idle(agent_id: AgentId) -> Self {
        Self {
            agent_id,
            status: AgentStatus::Idle,
            job_id: None,
            last_heartbeat: now_ms(),
        }
    }

    pub fn heartbeat_age(&self, now: i64) -> Duration {
        Duration::from_millis(now.saturating_sub(self.last_heartbeat).max(0) as u64)
    }

    /// A stale heartbeat means "not assignable", not "gone".
    pub fn is_alive(&self, timeout: Duration, now: i64) -> bool {
        self.heartbeat_age(now) < timeout
    }
}

/// Registry set plus one status record per agent.
#[derive(Clone)]
pub struct AgentRegistry {
    store: SharedStore,
    heartbeat_timeout: Duration,
}

impl AgentRegistry {
    pub fn new(store: SharedStore, heartbeat_timeout: Duration) -> Self {
        Self {
            store,
            heartbeat_timeout,
        }
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    pub async fn register(&self, agent_id: &AgentId) -> Result<()> {
        let record = AgentRecord::idle(agent_id.clone());
        let batch = Batch::new()
            .sadd(keys::AGENT_REGISTRY, agent_id.as_str())
            .set(
                keys::agent_status(agent_id.as_str()),
                serde_json::to_string(&record)?,
            );
        self.store.exec(batch).await?;
        tracing::info!(agent_id = %agent_id, "Agent registered");
        Ok(())
    }

    pub async fn unregister(&self, agent_id: &AgentId) -> Result<()> {
        let batch = Batch::new()
            .srem(keys::AGENT_REGISTRY, agent_id.as_str())
            .del(keys::agent_status(agent_id.as_str()));
        self.store.exec(batch).await?;
        tracing::info!(agent_id = %agent_id, "Agent unregistered");
        Ok(())
    }

    pub async fn get(&self, agent_id: &AgentId) -> Result<Option<AgentRecord>> {
        match self.store.get(&keys::agent_status(agent_id.as_str())).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, record: &AgentRecord) -> Result<()> {
        self.store
            .set(
                &keys::agent_status(record.agent_id.as_str()),
                &serde_json::to_string(record)?,
                None,
            )
            .await?;
        Ok(())
    }

    /// Change status without touching the heartbeat, so a commander marking a
    /// dead agent busy never makes it look alive.
    pub async fn set_status(
        &self,
        agent_id: &AgentId,
        status: AgentStatus,
        job_id: Option<&str>,
    ) -> Result<()> {
        let mut record = self
            .get(agent_id)
            .await?
            .unwrap_or_else(|| AgentRecord::idle(agent_id.clone()));
        record.status = status;
        record.job_id = match status {
            AgentStatus::Busy => job_id.map(str::to_string),
            AgentStatus::Idle => None,
        };
        self.put(&record).await?;
        tracing::debug!(agent_id = %agent_id, ?status, job_id, "Agent status updated");
        Ok(())
    }

    pub async fn set_busy(&self, agent_id: &AgentId, job_id: &str) -> Result<()> {
        self.set_status(agent_id, AgentStatus::Busy, Some(job_id))
            .await
    }

    pub async fn set_idle(&self, agent_id: &AgentId) -> Result<()> {
        self.set_status(agent_id, AgentStatus::Idle, None).await
    }

    /// Refresh `lastHeartbeat`, recreating an idle record if it has gone missing.
    /// Self-owned, so a plain read-modify-write is enough.
    pub async fn heartbeat(&self, agent_id: &AgentId) -> Result<()> {
        let record = match self.get(agent_id).await? {
            Some(mut record) => {
                record.last_heartbeat = now_ms();
                record
            }
            None => {
                tracing::warn!(agent_id = %agent_id, "Status record missing, recreating");
                self.store
                    .sadd(keys::AGENT_REGISTRY, agent_id.as_str())
                    .await?;
                AgentRecord::idle(agent_id.clone())
            }
        };
        self.put(&record).await
    }

    /// Every registered agent that still has a status record.
    pub async fn list(&self) -> Result<Vec<AgentRecord>> {
        let ids = self.store.smembers(keys::AGENT_REGISTRY).await?;
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.get(&AgentId::from(id)).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Idle agents with a fresh heartbeat.
    pub async fn available(&self) -> Result<Vec<AgentId>> {
        let now = now_ms();
        let available = self
            .list()
            .await?
            .into_iter()
            .filter(|r| r.status == AgentStatus::Idle)
            .filter(|r| {
                let alive = r.is_alive(self.heartbeat_timeout, now);
                if !alive {
                    tracing::debug!(agent_id = %r.agent_id, "Skipping agent with stale heartbeat");
                }
                alive
            })
            .map(|r| r.agent_id)
            .collect();
        Ok(available)
    }

    /// True when the agent has a status record with a fresh heartbeat.
    pub async fn is_live(&self, agent_id: &AgentId) -> Result<bool> {
        Ok(self
            .get(agent_id)
            .await?
            .is_some_and(|r| r.is_alive(self.heartbeat_timeout, now_ms())))
    }
}
