use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::QueueConfig;
use crate::error::Result;
use crate::scheduler::job::{now_ms, AgentId, JobState, QueueJob, ReplayJobData};
use crate::store::keys::QueueKeys;
use crate::store::{Batch, SharedStore};

/// Job records outlive any realistic retry schedule; finished jobs are
/// trimmed well before this.
const JOB_RECORD_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// A job handed to one agent process.
#[derive(Debug, Clone)]
pub enum Delivery {
    /// Assigned to the receiving agent and now active.
    Owned(QueueJob),
    /// Assigned elsewhere; the receiver has recorded its skip and must not run it.
    Foreign(QueueJob),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum QueueEvent {
    Active {
        job_id: String,
        url: String,
        assigned_to: Option<AgentId>,
    },
    Progress {
        job_id: String,
        progress: u8,
    },
    Completed {
        job_id: String,
        url: String,
        assigned_to: Option<AgentId>,
        result: Value,
    },
    Failed {
        job_id: String,
        url: String,
        assigned_to: Option<AgentId>,
        reason: String,
        will_retry: bool,
    },
}

impl QueueEvent {
    pub fn job_id(&self) -> &str {
        match self {
            QueueEvent::Active { job_id, .. }
            | QueueEvent::Progress { job_id, .. }
            | QueueEvent::Completed { job_id, .. }
            | QueueEvent::Failed { job_id, .. } => job_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub seq: i64,
    pub at: i64,
    #[serde(flatten)]
    pub event: QueueEvent,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
}

/// Persistent at-least-once job queue living entirely in the coordination store.
///
/// Each job is a JSON record plus membership in exactly one state set. Moving
/// a job out of a state set with ZREM is the atomic claim for every
/// transition, so two processes racing on the same job never both win.
#[derive(Clone)]
pub struct JobQueue {
    store: SharedStore,
    keys: QueueKeys,
    config: QueueConfig,
}

impl JobQueue {
    pub fn new(store: SharedStore, config: QueueConfig) -> Self {
        Self {
            keys: QueueKeys::new(&config.name),
            store,
            config,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Add a waiting job under the caller's id. Returns false when a job with
    /// that id already exists, leaving it untouched.
    pub async fn add(&self, id: &str, data: ReplayJobData) -> Result<bool> {
        let job = QueueJob::new(id, data);
        let record = serde_json::to_string(&job)?;
        if !self
            .store
            .set_nx(&self.keys.job(id), &record, JOB_RECORD_TTL)
            .await?
        {
            tracing::debug!(job_id = id, "Queue job already exists");
            return Ok(false);
        }
        self.store
            .zadd(&self.keys.waiting(), job.created_at as f64, id)
            .await?;
        tracing::debug!(job_id = id, url = %job.data.url, "Job queued");
        Ok(true)
    }

    pub async fn get(&self, id: &str) -> Result<Option<QueueJob>> {
        match self.store.get(&self.keys.job(id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn progress(&self, id: &str) -> Result<u8> {
        Ok(self
            .store
            .get(&self.keys.progress(id))
            .await?
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0))
    }

    /// Next job this agent has not yet seen, oldest first.
    ///
    /// Every agent sees every waiting job once. The owner claims it and it
    /// becomes active; anyone else records a skip marker for itself and gets
    /// it back as [`Delivery::Foreign`].
    pub async fn next_delivery(&self, agent_id: &AgentId) -> Result<Option<Delivery>> {
        self.promote_delayed().await?;

        let waiting = self.store.zrange(&self.keys.waiting(), 0, -1).await?;
        for id in waiting {
            let skipped_key = self.keys.skipped(&id);
            if self.store.sismember(&skipped_key, agent_id.as_str()).await? {
                continue;
            }
            let Some(mut job) = self.get(&id).await? else {
                // Record trimmed or expired underneath the waiting entry.
                self.store.zrem(&self.keys.waiting(), &id).await?;
                continue;
            };

            if job.data.is_owned_by(agent_id) {
                if !self.store.zrem(&self.keys.waiting(), &id).await? {
                    continue;
                }
                let now = now_ms();
                job.state = JobState::Active;
                job.processed_on = Some(now);
                let deadline = now + self.config.job_timeout.as_millis() as i64;
                let batch = Batch::new()
                    .set_px(
                        self.keys.job(&id),
                        serde_json::to_string(&job)?,
                        JOB_RECORD_TTL,
                    )
                    .set_px(self.keys.progress(&id), "0", JOB_RECORD_TTL)
                    .zadd(self.keys.active(), deadline as f64, id.as_str());
                self.store.exec(batch).await?;
                self.emit(QueueEvent::Active {
                    job_id: id.clone(),
                    url: job.data.url.clone(),
                    assigned_to: job.data.assigned_to.clone(),
                })
                .await?;
                return Ok(Some(Delivery::Owned(job)));
            }

            if self.store.sadd(&skipped_key, agent_id.as_str()).await? {
                return Ok(Some(Delivery::Foreign(job)));
            }
        }
        Ok(None)
    }

    pub async fn update_progress(&self, id: &str, progress: u8) -> Result<()> {
        let progress = progress.min(100);
        self.store
            .set(
                &self.keys.progress(id),
                &progress.to_string(),
                Some(JOB_RECORD_TTL),
            )
            .await?;
        self.emit(QueueEvent::Progress {
            job_id: id.to_string(),
            progress,
        })
        .await
    }

    /// Move an active job to completed. Returns false when the job was no
    /// longer active (already reaped or finished).
    pub async fn complete(&self, id: &str, result: Value) -> Result<bool> {
        if !self.store.zrem(&self.keys.active(), id).await? {
            return Ok(false);
        }
        let Some(mut job) = self.get(id).await? else {
            return Ok(false);
        };
        let now = now_ms();
        job.state = JobState::Completed;
        job.finished_on = Some(now);
        job.return_value = Some(result.clone());

        let batch = Batch::new()
            .set_px(self.keys.job(id), serde_json::to_string(&job)?, JOB_RECORD_TTL)
            .set_px(self.keys.progress(id), "100", JOB_RECORD_TTL)
            .zadd(self.keys.completed(), now as f64, id);
        self.store.exec(batch).await?;

        self.emit(QueueEvent::Completed {
            job_id: id.to_string(),
            url: job.data.url.clone(),
            assigned_to: job.data.assigned_to.clone(),
            result,
        })
        .await?;
        self.trim(&self.keys.completed(), self.config.keep_completed)
            .await?;
        Ok(true)
    }

    /// Fail an active job.
    ///
    /// With `retry` set and attempts left, the job is delayed with exponential
    /// backoff and comes back to its owner; otherwise it lands in the failed
    /// set. Returns the resulting state, or `None` when the job was no longer
    /// active.
    pub async fn fail(&self, id: &str, reason: &str, retry: bool) -> Result<Option<JobState>> {
        if !self.store.zrem(&self.keys.active(), id).await? {
            return Ok(None);
        }
        let Some(job) = self.get(id).await? else {
            return Ok(None);
        };
        self.record_failure(job, reason, retry).await.map(Some)
    }

    /// Fail a job that never became active (waiting or delayed). Returns false
    /// when it was in neither state.
    pub async fn fail_unclaimed(&self, id: &str, reason: &str) -> Result<bool> {
        let claimed = self.store.zrem(&self.keys.waiting(), id).await?
            || self.store.zrem(&self.keys.delayed(), id).await?;
        if !claimed {
            return Ok(false);
        }
        let Some(job) = self.get(id).await? else {
            return Ok(false);
        };
        self.record_failure(job, reason, false).await?;
        Ok(true)
    }

    async fn record_failure(
        &self,
        mut job: QueueJob,
        reason: &str,
        retry: bool,
    ) -> Result<JobState> {
        let now = now_ms();
        job.attempts_made += 1;
        job.failed_reason = Some(reason.to_string());

        let will_retry = retry && job.attempts_made < self.config.attempts;
        let batch = if will_retry {
            job.state = JobState::Delayed;
            let due = now + self.config.backoff_for(job.attempts_made).as_millis() as i64;
            Batch::new()
                .set_px(
                    self.keys.job(&job.id),
                    serde_json::to_string(&job)?,
                    JOB_RECORD_TTL,
                )
                .zadd(self.keys.delayed(), due as f64, job.id.as_str())
        } else {
            job.state = JobState::Failed;
            job.finished_on = Some(now);
            Batch::new()
                .set_px(
                    self.keys.job(&job.id),
                    serde_json::to_string(&job)?,
                    JOB_RECORD_TTL,
                )
                .zadd(self.keys.failed(), now as f64, job.id.as_str())
        };
        self.store.exec(batch).await?;

        tracing::info!(
            job_id = %job.id,
            url = %job.data.url,
            attempts = job.attempts_made,
            will_retry,
            reason,
            "Queue job failed"
        );
        self.emit(QueueEvent::Failed {
            job_id: job.id.clone(),
            url: job.data.url.clone(),
            assigned_to: job.data.assigned_to.clone(),
            reason: reason.to_string(),
            will_retry,
        })
        .await?;
        if !will_retry {
            self.trim(&self.keys.failed(), self.config.keep_failed)
                .await?;
        }
        Ok(job.state)
    }

    /// Move delayed jobs whose backoff has elapsed back to waiting.
    pub async fn promote_delayed(&self) -> Result<usize> {
        let now = now_ms();
        let due = self
            .store
            .zrange_by_score(&self.keys.delayed(), f64::NEG_INFINITY, now as f64)
            .await?;
        let mut promoted = 0;
        for (id, _) in due {
            if !self.store.zrem(&self.keys.delayed(), &id).await? {
                continue;
            }
            let Some(mut job) = self.get(&id).await? else {
                continue;
            };
            job.state = JobState::Waiting;
            let batch = Batch::new()
                .set_px(self.keys.job(&id), serde_json::to_string(&job)?, JOB_RECORD_TTL)
                .zadd(self.keys.waiting(), now as f64, id.as_str());
            self.store.exec(batch).await?;
            promoted += 1;
        }
        if promoted > 0 {
            tracing::debug!(promoted, "Promoted delayed jobs");
        }
        Ok(promoted)
    }

    /// Active jobs whose deadline has passed.
    pub async fn expired_active(&self) -> Result<Vec<QueueJob>> {
        let expired = self
            .store
            .zrange_by_score(&self.keys.active(), f64::NEG_INFINITY, now_ms() as f64)
            .await?;
        let mut jobs = Vec::with_capacity(expired.len());
        for (id, _) in expired {
            if let Some(job) = self.get(&id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    /// Jobs currently in `state`, oldest first.
    pub async fn jobs_in(&self, state: JobState) -> Result<Vec<QueueJob>> {
        let ids = self.store.zrange(&self.state_key(state), 0, -1).await?;
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = self.get(&id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    /// A waiting, active or delayed job for `url`, if any.
    pub async fn find_live_by_url(&self, url: &str) -> Result<Option<QueueJob>> {
        for state in [JobState::Active, JobState::Waiting, JobState::Delayed] {
            if let Some(job) = self
                .jobs_in(state)
                .await?
                .into_iter()
                .find(|job| job.data.url == url)
            {
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    pub async fn counts(&self) -> Result<QueueCounts> {
        Ok(QueueCounts {
            waiting: self.store.zcard(&self.keys.waiting()).await?,
            active: self.store.zcard(&self.keys.active()).await?,
            completed: self.store.zcard(&self.keys.completed()).await?,
            failed: self.store.zcard(&self.keys.failed()).await?,
            delayed: self.store.zcard(&self.keys.delayed()).await?,
        })
    }

    /// Sequence number of the newest event; listeners start reading after it.
    pub async fn event_cursor(&self) -> Result<i64> {
        Ok(self
            .store
            .get(&self.keys.event_seq())
            .await?
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0))
    }

    /// Events with a sequence number greater than `cursor`, in order.
    pub async fn events_after(&self, cursor: i64) -> Result<Vec<EventRecord>> {
        let raw = self
            .store
            .zrange_by_score(&self.keys.events(), (cursor + 1) as f64, f64::INFINITY)
            .await?;
        let mut events = Vec::with_capacity(raw.len());
        for (member, _) in raw {
            match serde_json::from_str::<EventRecord>(&member) {
                Ok(record) => events.push(record),
                Err(e) => tracing::warn!(error = %e, "Skipping malformed queue event"),
            }
        }
        Ok(events)
    }

    async fn emit(&self, event: QueueEvent) -> Result<()> {
        let seq = self.store.incr(&self.keys.event_seq()).await?;
        let record = EventRecord {
            seq,
            at: now_ms(),
            event,
        };
        let member = serde_json::to_string(&record)?;
        self.store
            .zadd(&self.keys.events(), seq as f64, &member)
            .await?;
        let keep = self.config.event_retention as isize;
        self.store
            .zremrangebyrank(&self.keys.events(), 0, -(keep + 1))
            .await?;
        Ok(())
    }

    /// Keep only the newest `keep` jobs of a finished state set.
    async fn trim(&self, set_key: &str, keep: u64) -> Result<()> {
        let len = self.store.zcard(set_key).await?;
        if len <= keep {
            return Ok(());
        }
        let excess = (len - keep) as isize;
        let stale = self.store.zrange(set_key, 0, excess - 1).await?;
        for id in &stale {
            let batch = Batch::new()
                .zrem(set_key, id.as_str())
                .del(self.keys.job(id))
                .del(self.keys.progress(id))
                .del(self.keys.skipped(id));
            self.store.exec(batch).await?;
        }
        tracing::debug!(removed = stale.len(), set = set_key, "Trimmed finished jobs");
        Ok(())
    }

    fn state_key(&self, state: JobState) -> String {
        match state {
            JobState::Waiting => self.keys.waiting(),
            JobState::Active => self.keys.active(),
            JobState::Completed => self.keys.completed(),
            JobState::Failed => self.keys.failed(),
            JobState::Delayed => self.keys.delayed(),
        }
    }
}
