use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::error::Result;
use crate::ratelimit::LockManager;
use crate::scheduler::commander::Commander;
use crate::scheduler::job::{now_ms, JobState};
use crate::store::keys;

const SUBMIT_LOCK_TTL: Duration = Duration::from_secs(10);
const SUBMIT_LOCK_WAIT: Duration = Duration::from_secs(2);
const SUBMIT_LOCK_RETRY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusReport {
    pub id: String,
    pub status: String,
    pub progress: u8,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl JobStatusReport {
    fn bare(id: &str, status: &str) -> Self {
        Self {
            id: id.to_string(),
            status: status.to_string(),
            progress: 0,
            result: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
    pub total: u64,
}

/// Submission and status glue in front of the commander and the job queue.
#[derive(Clone)]
pub struct ReplayService {
    commander: Commander,
    locks: LockManager,
}

impl ReplayService {
    pub fn new(commander: Commander, locks: LockManager) -> Self {
        Self { commander, locks }
    }

    pub fn commander(&self) -> &Commander {
        &self.commander
    }

    /// Submit a url for processing.
    ///
    /// A url that is already in flight is not submitted again; the id of the
    /// job already handling it comes back instead (`existing_<ms>` when that
    /// job cannot be found).
    pub async fn add_replay_job(
        &self,
        url: &str,
        session_id: Option<&str>,
        priority: i64,
    ) -> Result<String> {
        let lock = keys::submit_lock(url);
        let locked = match self
            .locks
            .acquire_within(&lock, SUBMIT_LOCK_TTL, SUBMIT_LOCK_WAIT, SUBMIT_LOCK_RETRY)
            .await
        {
            Ok(true) => true,
            Ok(false) => {
                tracing::warn!(url, "Submission lock busy, proceeding without it");
                false
            }
            Err(e) => {
                tracing::warn!(url, error = %e, "Submission lock unavailable, proceeding without it");
                false
            }
        };

        let result = self.submit(url, session_id, priority).await;

        if locked {
            if let Err(e) = self.locks.release(&lock).await {
                tracing::warn!(url, error = %e, "Failed to release submission lock");
            }
        }
        result
    }

    async fn submit(&self, url: &str, session_id: Option<&str>, priority: i64) -> Result<String> {
        if self.commander.is_in_flight(url).await? {
            tracing::info!(url, "Url already being processed");
            if let Some(job) = self.commander.queue().find_live_by_url(url).await? {
                return Ok(job.id);
            }
            if let Some(job) = self.commander.find_pending_by_url(url).await? {
                return Ok(job.id);
            }
            return Ok(format!("existing_{}", now_ms()));
        }

        let id = self
            .commander
            .add_pending_job(url, session_id, priority)
            .await?;
        self.commander.mark_in_flight(url).await?;
        Ok(id)
    }

    /// Submit several urls under one shared session id.
    pub async fn add_replay_jobs(
        &self,
        urls: &[String],
        session_id: Option<&str>,
        priority: i64,
    ) -> Result<Vec<String>> {
        tracing::info!(count = urls.len(), session_id, "Adding batch of replay jobs");
        let mut ids = Vec::with_capacity(urls.len());
        for url in urls {
            ids.push(self.add_replay_job(url, session_id, priority).await?);
        }
        Ok(ids)
    }

    pub async fn get_job_status(&self, id: &str) -> Result<JobStatusReport> {
        let queue = self.commander.queue();
        let Some(job) = queue.get(id).await? else {
            if self.commander.find_pending_by_id(id).await?.is_some() {
                return Ok(JobStatusReport::bare(id, "pending"));
            }
            return Ok(JobStatusReport::bare(id, "not_found"));
        };

        let progress = queue.progress(id).await?;
        let (result, error) = match job.state {
            JobState::Completed => (job.return_value, None),
            JobState::Failed => (
                None,
                Some(
                    job.failed_reason
                        .unwrap_or_else(|| "Unknown error".to_string()),
                ),
            ),
            _ => (None, None),
        };
        Ok(JobStatusReport {
            id: id.to_string(),
            status: job.state.to_string(),
            progress,
            result,
            error,
        })
    }

    pub async fn get_jobs_status(&self, ids: &[String]) -> Result<Vec<JobStatusReport>> {
        let mut reports = Vec::with_capacity(ids.len());
        for id in ids {
            reports.push(self.get_job_status(id).await?);
        }
        Ok(reports)
    }

    pub async fn get_queue_stats(&self) -> Result<QueueStats> {
        let counts = self.commander.queue().counts().await?;
        let pending = self.commander.pending_count().await?;
        Ok(QueueStats {
            pending,
            waiting: counts.waiting,
            active: counts.active,
            completed: counts.completed,
            failed: counts.failed,
            delayed: counts.delayed,
            total: pending
                + counts.waiting
                + counts.active
                + counts.completed
                + counts.failed
                + counts.delayed,
        })
    }
}
