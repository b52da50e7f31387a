use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::dashboard::{run_api, ApiState};
use crate::error::{CommanderError, Result};
use crate::ratelimit::{LockManager, RateLimiter};
use crate::scheduler::{Commander, JobQueue};
use crate::service::ReplayService;
use crate::store::{self, SharedStore};
use crate::worker::{Agent, CommandFetcher, ReplayFetcher};

/// One process of the fleet. Which subsystems run is decided by the
/// configured role; all of them share a single store handle.
pub struct Node {
    pub config: NodeConfig,
    store: SharedStore,
    commander: Commander,
    limiter: RateLimiter,
    fetcher: Option<Arc<dyn ReplayFetcher>>,
}

impl Node {
    pub async fn connect(config: NodeConfig) -> Result<Self> {
        let store = store::connect(&config.store.url).await?;
        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: NodeConfig, store: SharedStore) -> Self {
        let queue = JobQueue::new(store.clone(), config.queue.clone());
        let limiter = RateLimiter::new(store.clone(), config.rate_limit.clone());
        let commander = Commander::new(
            store.clone(),
            queue,
            limiter.clone(),
            config.commander.clone(),
        );
        Self {
            config,
            store,
            commander,
            limiter,
            fetcher: None,
        }
    }

    /// Use this scraper instead of the configured command.
    pub fn with_fetcher(mut self, fetcher: Arc<dyn ReplayFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn commander(&self) -> &Commander {
        &self.commander
    }

    pub fn service(&self) -> ReplayService {
        ReplayService::new(self.commander.clone(), LockManager::new(self.store.clone()))
    }

    fn resolve_fetcher(&self) -> Result<Arc<dyn ReplayFetcher>> {
        if let Some(fetcher) = &self.fetcher {
            return Ok(fetcher.clone());
        }
        let line = self.config.scraper_command.as_deref().ok_or_else(|| {
            CommanderError::Internal("agent role requires a scraper command".to_string())
        })?;
        let fetcher = CommandFetcher::from_command_line(line).ok_or_else(|| {
            CommanderError::Internal("scraper command is empty".to_string())
        })?;
        Ok(Arc::new(fetcher))
    }

    /// Run every subsystem of this role until `cancel` fires, then wait for
    /// them to wind down.
    ///
    /// # Errors
    ///
    /// Fails before starting anything if an agent role has no scraper.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let role = self.config.role;
        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        let agent = if role.runs_agent() {
            Some(Arc::new(Agent::new(
                self.commander.clone(),
                self.limiter.clone(),
                self.resolve_fetcher()?,
                self.config.agent.clone(),
            )))
        } else {
            None
        };

        if role.runs_commander() {
            let commander = Arc::new(self.commander.clone());
            let cancel = cancel.clone();
            tasks.push((
                "commander",
                tokio::spawn(async move { commander.run(cancel).await }),
            ));
        }

        if let Some(agent) = agent {
            let cancel = cancel.clone();
            tasks.push((
                "agent",
                tokio::spawn(async move {
                    let agent_id = agent.id().clone();
                    if let Err(e) = agent.run(cancel).await {
                        tracing::error!(agent_id = %agent_id, error = %e, "Agent failed to start");
                    }
                }),
            ));
        }

        if let Some(addr) = self.config.api_addr {
            let state = ApiState::new(self.service());
            let cancel = cancel.clone();
            tasks.push(("api", tokio::spawn(run_api(addr, state, cancel))));
        }

        tracing::info!(
            ?role,
            api_addr = ?self.config.api_addr,
            store = %self.config.store.url,
            "Node running"
        );

        cancel.cancelled().await;
        for (name, task) in tasks {
            if let Err(e) = task.await {
                tracing::warn!(task = name, error = %e, "Task ended abnormally");
            }
        }
        tracing::info!("Node stopped");
        Ok(())
    }
}
