//! Key layout in the coordination store.
//!
//! One prefix per concern: `commander:` for assignment bookkeeping,
//! `ratelimit:` for the limiter, `lock:` for named locks and `queue:<name>:`
//! for the job queue runtime.

pub const AGENT_REGISTRY: &str = "commander:agent:registry";
pub const AGENT_STATUS_PREFIX: &str = "commander:agent:status:";
pub const PENDING_JOBS: &str = "commander:url:pending";
pub const ASSIGNED_JOB_PREFIX: &str = "commander:job:assigned:";
pub const LAST_PROCESSED: &str = "commander:url:last_processed";
pub const PROCESSING_URLS: &str = "commander:urls:processing";

pub const LOCK_PREFIX: &str = "lock:";

pub const RESERVATIONS: &str = "ratelimit:reservations";
pub const LAST_REQUEST_TIME: &str = "ratelimit:last_request_time";
pub const REQUEST_TOKEN: &str = "ratelimit:request:token";
pub const REQUEST_TOKEN_COOLDOWN: &str = "ratelimit:request:token:cooldown";
pub const LAST_LOGIN_RETRY: &str = "ratelimit:login:last_retry_time";

/// Lock names (prefixed with [`LOCK_PREFIX`] by the lock manager).
pub const COMMANDER_LOCK: &str = "commander";
pub const LOGIN_RETRY_LOCK: &str = "ratelimit:login_retry";
pub const GRANT_LOCK: &str = "ratelimit:grant";

pub fn agent_status(agent_id: &str) -> String {
    format!("{AGENT_STATUS_PREFIX}{agent_id}")
}

pub fn assignment(job_id: &str) -> String {
    format!("{ASSIGNED_JOB_PREFIX}{job_id}")
}

pub fn lock(name: &str) -> String {
    format!("{LOCK_PREFIX}{name}")
}

pub fn submit_lock(url: &str) -> String {
    format!("submit:{url}")
}

pub fn resubmit_lock(url: &str) -> String {
    format!("resubmit:{url}")
}

/// Keys owned by one named job queue.
#[derive(Debug, Clone)]
pub struct QueueKeys {
    prefix: String,
}

impl QueueKeys {
    pub fn new(queue_name: &str) -> Self {
        Self {
            prefix: format!("queue:{queue_name}:"),
        }
    }

    pub fn job(&self, id: &str) -> String {
        format!("{}job:{id}", self.prefix)
    }

    pub fn progress(&self, id: &str) -> String {
        format!("{}job:{id}:progress", self.prefix)
    }

    pub fn skipped(&self, id: &str) -> String {
        format!("{}job:{id}:skipped", self.prefix)
    }

    pub fn waiting(&self) -> String {
        format!("{}waiting", self.prefix)
    }

    pub fn active(&self) -> String {
        format!("{}active", self.prefix)
    }

    pub fn delayed(&self) -> String {
        format!("{}delayed", self.prefix)
    }

    pub fn completed(&self) -> String {
        format!("{}completed", self.prefix)
    }

    pub fn failed(&self) -> String {
        format!("{}failed", self.prefix)
    }

    pub fn events(&self) -> String {
        format!("{}events", self.prefix)
    }

    pub fn event_seq(&self) -> String {
        format!("{}events:seq", self.prefix)
    }
}
