use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::error::{CommanderError, Result};
use crate::ratelimit::{Admission, RateLimiter};
use crate::scheduler::commander::Commander;
use crate::scheduler::job::{AgentId, QueueJob};
use crate::scheduler::queue::{Delivery, EventRecord, JobQueue, QueueEvent};
use crate::scheduler::registry::AgentRegistry;
use crate::worker::executor::{FetchExecutor, ReplayFetcher};
use crate::worker::heartbeat::HeartbeatEmitter;

/// What the processor did with one delivered job.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// Owned by another agent; resolved locally as `{skipped: true, assignedTo}`.
    Skipped { job_id: String, result: Value },
    Completed { job_id: String },
    Failed { job_id: String, error: String },
}

/// One worker process. Runs only the jobs whose `assignedTo` is its own id.
pub struct Agent {
    id: AgentId,
    registry: AgentRegistry,
    queue: JobQueue,
    limiter: RateLimiter,
    commander: Commander,
    executor: FetchExecutor,
    config: AgentConfig,
    heartbeat_cancel: CancellationToken,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
}

impl Agent {
    pub fn new(
        commander: Commander,
        limiter: RateLimiter,
        fetcher: Arc<dyn ReplayFetcher>,
        config: AgentConfig,
    ) -> Self {
        Self::with_id(AgentId::generate(), commander, limiter, fetcher, config)
    }

    pub fn with_id(
        id: AgentId,
        commander: Commander,
        limiter: RateLimiter,
        fetcher: Arc<dyn ReplayFetcher>,
        config: AgentConfig,
    ) -> Self {
        Self {
            id,
            registry: commander.registry().clone(),
            queue: commander.queue().clone(),
            executor: FetchExecutor::new(fetcher, config.max_fetch_attempts),
            limiter,
            commander,
            config,
            heartbeat_cancel: CancellationToken::new(),
            heartbeat_task: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &AgentId {
        &self.id
    }

    /// Register as idle and start emitting heartbeats.
    pub async fn start(&self) -> Result<()> {
        self.registry.register(&self.id).await?;
        let emitter = HeartbeatEmitter::new(
            self.registry.clone(),
            self.id.clone(),
            self.config.heartbeat_interval,
        );
        let cancel = self.heartbeat_cancel.clone();
        let task = tokio::spawn(async move { emitter.run(cancel).await });
        *self.heartbeat_task.lock().await = Some(task);
        tracing::info!(agent_id = %self.id, "Agent started");
        Ok(())
    }

    /// Stop heartbeats and deregister. Best effort; errors are logged.
    pub async fn stop(&self) {
        self.heartbeat_cancel.cancel();
        // A heartbeat landing after deregistration would recreate the record.
        if let Some(task) = self.heartbeat_task.lock().await.take() {
            if let Err(e) = task.await {
                tracing::warn!(agent_id = %self.id, error = %e, "Heartbeat task failed");
            }
        }
        if let Err(e) = self.registry.unregister(&self.id).await {
            tracing::warn!(agent_id = %self.id, error = %e, "Failed to deregister agent");
        }
        tracing::info!(agent_id = %self.id, "Agent stopped");
    }

    /// Take the next delivery from the queue and deal with it. `Ok(None)`
    /// means there was nothing new for this agent.
    pub async fn process_next(&self) -> Result<Option<ProcessOutcome>> {
        let outcome = match self.queue.next_delivery(&self.id).await? {
            None => None,
            Some(Delivery::Foreign(job)) => Some(self.skip(&job)),
            Some(Delivery::Owned(job)) => Some(self.run_owned(job).await),
        };
        Ok(outcome)
    }

    fn skip(&self, job: &QueueJob) -> ProcessOutcome {
        tracing::debug!(
            agent_id = %self.id,
            job_id = %job.id,
            assigned_to = ?job.assigned_to(),
            "Skipping job assigned to another agent"
        );
        ProcessOutcome::Skipped {
            job_id: job.id.clone(),
            result: json!({ "skipped": true, "assignedTo": job.assigned_to() }),
        }
    }

    async fn run_owned(&self, job: QueueJob) -> ProcessOutcome {
        let job_id = job.id.clone();
        match self.fetch_workflow(&job).await {
            Ok(()) => ProcessOutcome::Completed { job_id },
            Err(e) => ProcessOutcome::Failed {
                job_id,
                error: e.to_string(),
            },
        }
    }

    async fn fetch_workflow(&self, job: &QueueJob) -> Result<()> {
        let url = job.url();
        let session_id = job.data.session_id.as_deref();
        tracing::info!(agent_id = %self.id, job_id = %job.id, url, "Processing job");

        if let Err(e) = self.registry.set_busy(&self.id, &job.id).await {
            tracing::warn!(agent_id = %self.id, error = %e, "Failed to mark agent busy");
        }
        self.report_progress(&job.id, 10).await;

        let ticket = self.limiter.wait_for_next_slot(Some(&job.id)).await;
        if let Admission::FailOpen(reason) = ticket.admission {
            tracing::warn!(job_id = %job.id, ?reason, "Proceeding without a rate limit slot");
        }
        self.report_progress(&job.id, 20).await;

        let worker_id = format!("worker_{}", job.id);
        let token = self.limiter.acquire_request_token(&worker_id).await;
        let outcome = self.executor.execute(&job.id, url, session_id).await;
        if token.is_granted() {
            if let Err(e) = self.limiter.release_request_token(&worker_id).await {
                tracing::warn!(worker_id = %worker_id, error = %e, "Failed to release request token");
            }
        }

        match outcome.result {
            Ok(value) => {
                self.report_progress(&job.id, 100).await;
                let completed = self.queue.complete(&job.id, value).await;
                self.set_idle().await;
                if !completed? {
                    tracing::warn!(job_id = %job.id, "Job was no longer active when it finished");
                }
                tracing::info!(job_id = %job.id, attempts = outcome.attempts, "Job finished");
                Ok(())
            }
            Err(scrape_error) => {
                self.set_idle().await;
                let handed_off = match self
                    .commander
                    .mark_job_failed(url, session_id, Some(&job.id))
                    .await
                {
                    Ok(_) => true,
                    Err(e) => {
                        tracing::error!(job_id = %job.id, error = %e, "Could not requeue url, leaving retry to the queue");
                        false
                    }
                };
                self.queue
                    .fail(&job.id, &scrape_error.message, !handed_off)
                    .await?;
                Err(CommanderError::Scrape(scrape_error))
            }
        }
    }

    async fn report_progress(&self, job_id: &str, progress: u8) {
        if let Err(e) = self.queue.update_progress(job_id, progress).await {
            tracing::warn!(job_id, progress, error = %e, "Failed to report progress");
        }
    }

    async fn set_idle(&self) {
        if let Err(e) = self.registry.set_idle(&self.id).await {
            tracing::warn!(agent_id = %self.id, error = %e, "Failed to mark agent idle");
        }
    }

    /// Cleanup for terminal events of jobs this agent owns. Safe to call twice.
    pub async fn handle_event(&self, record: &EventRecord) -> Result<()> {
        let (job_id, url, assigned_to, terminal) = match &record.event {
            QueueEvent::Completed {
                job_id,
                url,
                assigned_to,
                ..
            } => (job_id, url, assigned_to, true),
            QueueEvent::Failed {
                job_id,
                url,
                assigned_to,
                will_retry,
                ..
            } => (job_id, url, assigned_to, !will_retry),
            _ => return Ok(()),
        };
        if assigned_to.as_ref() != Some(&self.id) {
            return Ok(());
        }

        if terminal {
            self.commander.release_finished(job_id, url).await?;
        }
        // Only go idle if we are not already busy with a newer job.
        let current = self.registry.get(&self.id).await?;
        if current.map_or(true, |r| r.job_id.as_deref() == Some(job_id.as_str())) {
            self.registry.set_idle(&self.id).await?;
        }
        Ok(())
    }

    /// Register, then process deliveries one at a time until cancelled, then
    /// deregister.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        self.start().await?;

        let listener = {
            let agent = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { agent.run_event_listener(cancel).await })
        };

        loop {
            // A job in progress is always finished before shutdown.
            if cancel.is_cancelled() {
                break;
            }
            match self.process_next().await {
                Ok(Some(outcome)) => {
                    tracing::debug!(agent_id = %self.id, ?outcome, "Delivery handled");
                    continue;
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(agent_id = %self.id, error = %e, "Failed to poll queue"),
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        if let Err(e) = listener.await {
            tracing::warn!(agent_id = %self.id, error = %e, "Event listener task failed");
        }
        self.stop().await;
        Ok(())
    }

    async fn run_event_listener(&self, cancel: CancellationToken) {
        let mut cursor = self.queue.event_cursor().await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Could not read event cursor, starting from zero");
            0
        });
        let mut interval = tokio::time::interval(self.config.event_poll_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let events = match self.queue.events_after(cursor).await {
                        Ok(events) => events,
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to read queue events");
                            continue;
                        }
                    };
                    for record in events {
                        cursor = record.seq;
                        if let Err(e) = self.handle_event(&record).await {
                            tracing::warn!(job_id = %record.event.job_id(), error = %e, "Agent event cleanup failed");
                        }
                    }
                }
            }
        }
    }
}
