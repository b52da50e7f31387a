use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::scheduler::job::AgentId;
use crate::scheduler::registry::AgentRegistry;

/// Periodically refreshes an agent's `lastHeartbeat` until cancelled.
pub struct HeartbeatEmitter {
    registry: AgentRegistry,
    agent_id: AgentId,
    interval: Duration,
}

impl HeartbeatEmitter {
    pub fn new(registry: AgentRegistry, agent_id: AgentId, interval: Duration) -> Self {
        Self {
            registry,
            agent_id,
            interval,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    match self.registry.heartbeat(&self.agent_id).await {
                        Ok(()) => tracing::debug!(agent_id = %self.agent_id, "Heartbeat"),
                        Err(e) => tracing::warn!(agent_id = %self.agent_id, error = %e, "Heartbeat failed"),
                    }
                }
            }
        }
        tracing::debug!(agent_id = %self.agent_id, "Heartbeat stopped");
    }
}
