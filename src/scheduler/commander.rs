use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::CommanderConfig;
use crate::error::Result;
use crate::ratelimit::{LockManager, RateLimiter};
use crate::scheduler::job::{now_ms, AgentId, JobState, PendingJob, QueueJob};
use crate::scheduler::queue::{EventRecord, JobQueue, QueueEvent};
use crate::scheduler::registry::AgentRegistry;
use crate::store::{keys, SharedStore};

/// What one assignment tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Another process holds the commander lock.
    LockBusy,
    RateLimited,
    NoAgents,
    NoPendingJobs,
    Assigned { job_id: String, agent_id: AgentId },
    /// The top pending entry belonged to a queue job that had already
    /// finished; the entry was dropped and nobody was assigned.
    Discarded { job_id: String },
}

/// Matches pending urls to idle agents, one per tick, and recovers work
/// left behind by failed or vanished agents.
///
/// Any number of processes may run a commander; the commander lock makes
/// sure only one of them assigns at a time.
#[derive(Clone)]
pub struct Commander {
    store: SharedStore,
    registry: AgentRegistry,
    queue: JobQueue,
    limiter: RateLimiter,
    locks: LockManager,
    config: CommanderConfig,
}

impl Commander {
    pub fn new(
        store: SharedStore,
        queue: JobQueue,
        limiter: RateLimiter,
        config: CommanderConfig,
    ) -> Self {
        Self {
            registry: AgentRegistry::new(store.clone(), config.heartbeat_timeout),
            locks: LockManager::new(store.clone()),
            store,
            queue,
            limiter,
            config,
        }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub async fn add_pending_job(
        &self,
        url: &str,
        session_id: Option<&str>,
        priority: i64,
    ) -> Result<String> {
        let job = PendingJob::new(url, session_id.map(str::to_string), priority);
        let member = serde_json::to_string(&job)?;
        self.store
            .zadd(keys::PENDING_JOBS, priority as f64, &member)
            .await?;
        tracing::info!(job_id = %job.id, url, priority, "Pending job added");
        Ok(job.id)
    }

    pub async fn add_pending_jobs(
        &self,
        urls: &[String],
        session_id: Option<&str>,
        priority: i64,
    ) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(urls.len());
        for url in urls {
            ids.push(self.add_pending_job(url, session_id, priority).await?);
        }
        Ok(ids)
    }

    /// Pending jobs, highest priority first.
    pub async fn pending_jobs(&self) -> Result<Vec<PendingJob>> {
        let members = self.store.zrevrange(keys::PENDING_JOBS, 0, -1).await?;
        let mut jobs = Vec::with_capacity(members.len());
        for member in members {
            match serde_json::from_str(&member) {
                Ok(job) => jobs.push(job),
                Err(e) => tracing::warn!(error = %e, "Ignoring malformed pending entry"),
            }
        }
        Ok(jobs)
    }

    pub async fn pending_count(&self) -> Result<u64> {
        Ok(self.store.zcard(keys::PENDING_JOBS).await?)
    }

    pub async fn find_pending_by_url(&self, url: &str) -> Result<Option<PendingJob>> {
        Ok(self.pending_jobs().await?.into_iter().find(|j| j.url == url))
    }

    pub async fn find_pending_by_id(&self, id: &str) -> Result<Option<PendingJob>> {
        Ok(self.pending_jobs().await?.into_iter().find(|j| j.id == id))
    }

    /// Run one assignment tick under the commander lock.
    pub async fn assign_next(&self) -> Result<TickOutcome> {
        let outcome = self
            .locks
            .with_lock(keys::COMMANDER_LOCK, self.config.lock_ttl, || {
                self.assign_locked()
            })
            .await?;
        outcome.unwrap_or(Ok(TickOutcome::LockBusy))
    }

    async fn assign_locked(&self) -> Result<TickOutcome> {
        if !self.limiter.interval_elapsed().await? {
            return Ok(TickOutcome::RateLimited);
        }

        let Some(agent_id) = self.registry.available().await?.into_iter().next() else {
            return Ok(TickOutcome::NoAgents);
        };

        let Some(member) = self
            .store
            .zrevrange(keys::PENDING_JOBS, 0, 0)
            .await?
            .into_iter()
            .next()
        else {
            return Ok(TickOutcome::NoPendingJobs);
        };

        let job: PendingJob = match serde_json::from_str(&member) {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(error = %e, "Dropping malformed pending entry");
                self.store.zrem(keys::PENDING_JOBS, &member).await?;
                return Err(e.into());
            }
        };

        match self.hand_off(&job, &member, &agent_id).await {
            Ok(None) => Ok(TickOutcome::Discarded { job_id: job.id }),
            Ok(Some(owner)) => {
                tracing::info!(job_id = %job.id, agent_id = %owner, url = %job.url, "Job assigned");
                Ok(TickOutcome::Assigned {
                    job_id: job.id,
                    agent_id: owner,
                })
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, agent_id = %agent_id, error = %e, "Assignment failed");
                if let Err(rollback) = self.registry.set_idle(&agent_id).await {
                    tracing::error!(agent_id = %agent_id, error = %rollback, "Failed to roll agent back to idle");
                }
                Err(e)
            }
        }
    }

    /// Queue the job for `agent_id` and do the bookkeeping. The pending entry
    /// is removed last, so a failure anywhere leaves it to be retried.
    ///
    /// Returns the owner, or `None` when the entry was left over from an
    /// interrupted hand-off whose job has since finished.
    async fn hand_off(
        &self,
        job: &PendingJob,
        member: &str,
        agent_id: &AgentId,
    ) -> Result<Option<AgentId>> {
        let data = job.clone().into_job_data(agent_id.clone());
        let owner = if self.queue.add(&job.id, data).await? {
            agent_id.clone()
        } else {
            // Left over from an interrupted hand-off; its owner is fixed.
            let existing = self.queue.get(&job.id).await?;
            if let Some(done) = existing.as_ref().filter(|j| j.state.is_finished()) {
                tracing::warn!(job_id = %job.id, state = %done.state, "Dropping pending entry of a finished job");
                self.store.zrem(keys::PENDING_JOBS, member).await?;
                return Ok(None);
            }
            match existing.and_then(|j| j.data.assigned_to) {
                Some(owner) => owner,
                None => agent_id.clone(),
            }
        };

        self.registry.set_busy(&owner, &job.id).await?;
        self.store
            .set(
                &keys::assignment(&job.id),
                owner.as_str(),
                Some(self.config.assignment_ttl),
            )
            .await?;
        self.store
            .set(keys::LAST_PROCESSED, &now_ms().to_string(), None)
            .await?;
        self.mark_in_flight(&job.url).await?;
        self.store.zrem(keys::PENDING_JOBS, member).await?;
        Ok(Some(owner))
    }

    /// Clear bookkeeping for a job that reached a terminal state.
    pub async fn handle_event(&self, record: &EventRecord) -> Result<()> {
        match &record.event {
            QueueEvent::Completed { job_id, url, .. } => {
                self.clear_in_flight(job_id, url).await?;
                tracing::info!(job_id = %job_id, url = %url, "Job completed");
            }
            QueueEvent::Failed {
                job_id,
                url,
                will_retry: false,
                reason,
                ..
            } => {
                self.clear_in_flight(job_id, url).await?;
                tracing::info!(job_id = %job_id, url = %url, reason = %reason, "Job failed");
            }
            _ => {}
        }
        Ok(())
    }

    async fn clear_in_flight(&self, job_id: &str, url: &str) -> Result<()> {
        self.release_finished(job_id, url).await?;
        self.store.del(&keys::assignment(job_id)).await?;
        Ok(())
    }

    /// Drop the in-flight marker for `url` now that `job_id` has finished,
    /// unless newer work for the url is pending or live. Idempotent.
    pub async fn release_finished(&self, job_id: &str, url: &str) -> Result<bool> {
        if let Some(pending) = self.find_pending_by_url(url).await? {
            tracing::debug!(job_id, url, pending_id = %pending.id, "Url pending again, keeping marker");
            return Ok(false);
        }
        if let Some(live) = self.queue.find_live_by_url(url).await? {
            if live.id != job_id {
                tracing::debug!(job_id, url, live_id = %live.id, "Url has a newer live job, keeping marker");
                return Ok(false);
            }
        }
        self.release_url(url).await
    }

    /// Drop the in-flight marker for `url`. Idempotent.
    pub async fn release_url(&self, url: &str) -> Result<bool> {
        Ok(self.store.srem(keys::PROCESSING_URLS, url).await?)
    }

    pub async fn mark_in_flight(&self, url: &str) -> Result<bool> {
        Ok(self.store.sadd(keys::PROCESSING_URLS, url).await?)
    }

    pub async fn is_in_flight(&self, url: &str) -> Result<bool> {
        Ok(self.store.sismember(keys::PROCESSING_URLS, url).await?)
    }

    pub async fn in_flight_urls(&self) -> Result<Vec<String>> {
        Ok(self.store.smembers(keys::PROCESSING_URLS).await?)
    }

    /// Requeue a url whose processing failed, with elevated priority.
    ///
    /// `failed_job_id` is the queue job that is failing right now; it does not
    /// count as live work for the url. The in-flight marker passes to the new
    /// pending job.
    pub async fn mark_job_failed(
        &self,
        url: &str,
        session_id: Option<&str>,
        failed_job_id: Option<&str>,
    ) -> Result<Option<String>> {
        self.resubmit(url, session_id, failed_job_id).await
    }

    /// The single resubmission path. Under a per-url lock, adds a new pending
    /// job unless the url is already pending or has a live queue job.
    /// Either way the url stays marked in flight.
    /// Returns the new pending id, or `None` when nothing was added.
    pub async fn resubmit(
        &self,
        url: &str,
        session_id: Option<&str>,
        ignore_job_id: Option<&str>,
    ) -> Result<Option<String>> {
        let outcome = self
            .locks
            .with_lock(&keys::resubmit_lock(url), self.config.lock_ttl, || {
                self.resubmit_locked(url, session_id, ignore_job_id)
            })
            .await?;
        match outcome {
            Some(result) => result,
            None => {
                tracing::debug!(url, "Resubmission already in progress elsewhere");
                Ok(None)
            }
        }
    }

    async fn resubmit_locked(
        &self,
        url: &str,
        session_id: Option<&str>,
        ignore_job_id: Option<&str>,
    ) -> Result<Option<String>> {
        if self.find_pending_by_url(url).await?.is_some() {
            tracing::debug!(url, "Url already pending, not resubmitting");
            self.mark_in_flight(url).await?;
            return Ok(None);
        }
        if let Some(live) = self.queue.find_live_by_url(url).await? {
            if Some(live.id.as_str()) != ignore_job_id {
                tracing::debug!(url, job_id = %live.id, "Url has a live queue job, not resubmitting");
                self.mark_in_flight(url).await?;
                return Ok(None);
            }
        }
        let id = self
            .add_pending_job(url, session_id, self.config.retry_priority_boost)
            .await?;
        self.mark_in_flight(url).await?;
        tracing::warn!(job_id = %id, url, "Url resubmitted after failure");
        Ok(Some(id))
    }

    /// Resubmit in-flight urls that have no live queue job behind them.
    /// Returns the urls that were resubmitted.
    pub async fn sweep_stuck(&self) -> Result<Vec<String>> {
        let mut resubmitted = Vec::new();
        for url in self.in_flight_urls().await? {
            if self.queue.find_live_by_url(&url).await?.is_some() {
                continue;
            }
            if self.find_pending_by_url(&url).await?.is_some() {
                continue;
            }

            let finished = self.latest_finished_for(&url).await?;
            if let Some(job) = finished.as_ref().filter(|j| j.state == JobState::Completed) {
                tracing::info!(url = %url, job_id = %job.id, "Clearing marker for completed url");
                self.release_url(&url).await?;
                continue;
            }

            let session_id = finished.and_then(|j| j.data.session_id);
            tracing::warn!(url = %url, "Found stuck url with no live job");
            if self
                .resubmit(&url, session_id.as_deref(), None)
                .await?
                .is_some()
            {
                resubmitted.push(url);
            }
        }
        Ok(resubmitted)
    }

    async fn latest_finished_for(&self, url: &str) -> Result<Option<QueueJob>> {
        let mut finished: Vec<QueueJob> = Vec::new();
        for state in [JobState::Completed, JobState::Failed] {
            finished.extend(
                self.queue
                    .jobs_in(state)
                    .await?
                    .into_iter()
                    .filter(|j| j.data.url == url),
            );
        }
        Ok(finished.into_iter().max_by_key(|j| j.finished_on))
    }

    /// Fail and resubmit queue jobs that can no longer finish: active past
    /// their deadline, or assigned to an agent whose heartbeat went stale.
    /// Returns how many jobs were reaped.
    pub async fn reap(&self) -> Result<usize> {
        let mut reaped = 0;

        let mut expired: Vec<(QueueJob, &str)> = self
            .queue
            .expired_active()
            .await?
            .into_iter()
            .map(|j| (j, "job timed out"))
            .collect();
        for job in self.queue.jobs_in(JobState::Active).await? {
            if expired.iter().any(|(e, _)| e.id == job.id) {
                continue;
            }
            if !self.assignee_is_live(&job).await? {
                expired.push((job, "assigned agent stopped heartbeating"));
            }
        }
        for (job, reason) in expired {
            if self.queue.fail(&job.id, reason, false).await?.is_some() {
                self.recover(&job, reason).await?;
                reaped += 1;
            }
        }

        for state in [JobState::Waiting, JobState::Delayed] {
            for job in self.queue.jobs_in(state).await? {
                if self.assignee_is_live(&job).await? {
                    continue;
                }
                let reason = "assigned agent is gone";
                if self.queue.fail_unclaimed(&job.id, reason).await? {
                    self.recover(&job, reason).await?;
                    reaped += 1;
                }
            }
        }
        Ok(reaped)
    }

    async fn assignee_is_live(&self, job: &QueueJob) -> Result<bool> {
        match job.assigned_to() {
            Some(agent_id) => self.registry.is_live(agent_id).await,
            None => Ok(false),
        }
    }

    async fn recover(&self, job: &QueueJob, reason: &str) -> Result<()> {
        tracing::warn!(job_id = %job.id, url = %job.data.url, reason, "Reaped queue job");
        self.store.del(&keys::assignment(&job.id)).await?;
        self.resubmit(&job.data.url, job.data.session_id.as_deref(), None)
            .await?;
        Ok(())
    }

    /// Run the assignment, maintenance and event loops until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!(
            assign_interval_ms = self.config.assign_interval.as_millis() as u64,
            sweep_interval_ms = self.config.sweep_interval.as_millis() as u64,
            "Commander started"
        );
        tokio::join!(
            self.run_assignment_loop(cancel.clone()),
            self.run_maintenance_loop(cancel.clone()),
            self.run_event_listener(cancel),
        );
        tracing::info!("Commander stopped");
    }

    async fn run_assignment_loop(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.assign_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    match self.assign_next().await {
                        Ok(TickOutcome::Assigned { .. }) => {}
                        Ok(outcome) => tracing::debug!(?outcome, "Assignment tick"),
                        Err(e) if e.is_store_unavailable() => {
                            tracing::warn!(error = %e, "Store unavailable, skipping assignment tick");
                        }
                        Err(e) => tracing::error!(error = %e, "Assignment tick failed"),
                    }
                }
            }
        }
    }

    async fn run_maintenance_loop(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        // The first tick fires immediately; give agents a heartbeat round first.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    match self.reap().await {
                        Ok(0) => {}
                        Ok(reaped) => tracing::info!(reaped, "Reaped abandoned jobs"),
                        Err(e) => tracing::error!(error = %e, "Reaper tick failed"),
                    }
                    match self.sweep_stuck().await {
                        Ok(urls) if urls.is_empty() => {}
                        Ok(urls) => tracing::info!(count = urls.len(), "Recovered stuck urls"),
                        Err(e) => tracing::error!(error = %e, "Stuck job sweep failed"),
                    }
                }
            }
        }
    }

    async fn run_event_listener(&self, cancel: CancellationToken) {
        let mut cursor = match self.queue.event_cursor().await {
            Ok(cursor) => cursor,
            Err(e) => {
                tracing::warn!(error = %e, "Could not read event cursor, starting from zero");
                0
            }
        };
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
                            tracing::error!(job_id = %record.event.job_id(), error = %e, "Event handler failed");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::{QueueConfig, RateLimitConfig};
    use crate::store::MemoryStore;

    fn commander() -> Commander {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let queue = JobQueue::new(store.clone(), QueueConfig::default());
        let limiter = RateLimiter::new(
            store.clone(),
            RateLimitConfig::default().with_min_request_interval(Duration::ZERO),
        );
        Commander::new(store, queue, limiter, CommanderConfig::default())
    }

    #[tokio::test]
    async fn pending_jobs_are_ordered_by_priority() {
        let c = commander();
        c.add_pending_job("low", None, 0).await.unwrap();
        c.add_pending_job("high", None, 10).await.unwrap();
        let urls: Vec<_> = c
            .pending_jobs()
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.url)
            .collect();
        assert_eq!(urls, vec!["high", "low"]);
    }

    #[tokio::test]
    async fn batch_submission_shares_session() {
        let c = commander();
        let urls = vec!["a".to_string(), "b".to_string()];
        let ids = c.add_pending_jobs(&urls, Some("s1"), 0).await.unwrap();
        assert_eq!(ids.len(), 2);
        assert!(c
            .pending_jobs()
            .await
            .unwrap()
            .iter()
            .all(|j| j.session_id.as_deref() == Some("s1")));
    }

    #[tokio::test]
    async fn tick_without_agents_leaves_pending_untouched() {
        let c = commander();
        c.add_pending_job("u", None, 0).await.unwrap();
        assert_eq!(c.assign_next().await.unwrap(), TickOutcome::NoAgents);
        assert_eq!(c.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn tick_skips_while_lock_is_held() {
        let c = commander();
        let locks = LockManager::new(c.store.clone());
        locks
            .acquire(keys::COMMANDER_LOCK, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(c.assign_next().await.unwrap(), TickOutcome::LockBusy);
    }

    #[tokio::test]
    async fn resubmission_is_deduplicated_by_url() {
        let c = commander();
        let first = c.mark_job_failed("u", Some("s"), None).await.unwrap();
        assert!(first.is_some());
        let second = c.mark_job_failed("u", Some("s"), None).await.unwrap();
        assert!(second.is_none());

        let pending = c.pending_jobs().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].priority, 10);
        assert_eq!(pending[0].session_id.as_deref(), Some("s"));
    }
}
