use std::net::SocketAddr;
use std::time::Duration;

/// Spacing and timeouts for the fleet-wide rate limiter.
///
/// Every agent process must run with the same values; the limiter has no way
/// to reconcile processes that disagree on the interval.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Minimum gap between two granted external requests, fleet-wide.
    pub min_request_interval: Duration,
    /// Longest a reservation waits for its slot before proceeding anyway.
    pub max_wait: Duration,
    /// Delay between slot checks while waiting in the reservation queue.
    pub poll_interval: Duration,
    /// Expiry of the request token if its holder never releases it.
    pub token_ttl: Duration,
    /// How long to keep retrying the request token before proceeding anyway.
    pub token_timeout: Duration,
    /// Delay between request token attempts.
    pub token_retry: Duration,
    /// Quiet period after a token release before the next holder may take it.
    pub token_cooldown: Duration,
    /// Minimum gap between two login retries, fleet-wide.
    pub login_retry_interval: Duration,
    /// TTL of the short locks guarding check-then-set sections.
    pub lock_ttl: Duration,
    /// Waiting loops log at most once per this interval.
    pub log_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            min_request_interval: Duration::from_secs(15),
            max_wait: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            token_ttl: Duration::from_secs(30),
            token_timeout: Duration::from_secs(30),
            token_retry: Duration::from_millis(500),
            token_cooldown: Duration::from_secs(1),
            login_retry_interval: Duration::from_secs(60),
            lock_ttl: Duration::from_secs(10),
            log_interval: Duration::from_secs(5),
        }
    }
}

impl RateLimitConfig {
    pub fn with_min_request_interval(mut self, interval: Duration) -> Self {
        self.min_request_interval = interval;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }
}

#[derive(Debug, Clone)]
pub struct CommanderConfig {
    pub assign_interval: Duration,
    pub sweep_interval: Duration,
    pub lock_ttl: Duration,
    /// Agents whose last heartbeat is older than this are never assigned work.
    pub heartbeat_timeout: Duration,
    pub assignment_ttl: Duration,
    /// Priority added to a url resubmitted after a failure.
    pub retry_priority_boost: i64,
    pub event_poll_interval: Duration,
}

impl Default for CommanderConfig {
    fn default() -> Self {
        Self {
            assign_interval: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(60),
            lock_ttl: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(30),
            assignment_ttl: Duration::from_secs(60),
            retry_priority_boost: 10,
            event_poll_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub heartbeat_interval: Duration,
    pub poll_interval: Duration,
    /// Scrape attempts per job while holding the request token.
    pub max_fetch_attempts: u32,
    pub event_poll_interval: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            poll_interval: Duration::from_secs(1),
            max_fetch_attempts: 3,
            event_poll_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub name: String,
    /// Queue-level attempts before a job is left in the failed state.
    pub attempts: u32,
    /// First retry delay; doubles on every further attempt.
    pub backoff: Duration,
    pub job_timeout: Duration,
    pub keep_completed: u64,
    pub keep_failed: u64,
    pub event_retention: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "replay-processing".to_string(),
            attempts: 3,
            backoff: Duration::from_secs(60),
            job_timeout: Duration::from_secs(5 * 60),
            keep_completed: 100,
            keep_failed: 100,
            event_retention: 1000,
        }
    }
}

impl QueueConfig {
    /// Delay before retry number `attempts_made` (1-based), doubling each time.
    pub fn backoff_for(&self, attempts_made: u32) -> Duration {
        let exponent = attempts_made.saturating_sub(1).min(16);
        self.backoff.saturating_mul(1u32 << exponent)
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// `redis://host:port[/db]`, or `memory://` for a single-process store.
    pub url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

/// Which subsystems a process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Commander,
    Agent,
    Api,
    All,
}

impl Role {
    pub fn runs_commander(self) -> bool {
        matches!(self, Role::Commander | Role::All)
    }

    pub fn runs_agent(self) -> bool {
        matches!(self, Role::Agent | Role::All)
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub role: Role,
    pub api_addr: Option<SocketAddr>,
    pub store: StoreConfig,
    pub rate_limit: RateLimitConfig,
    pub commander: CommanderConfig,
    pub agent: AgentConfig,
    pub queue: QueueConfig,
    /// External scraper command for agents (see `CommandFetcher`).
    pub scraper_command: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            role: Role::All,
            api_addr: None,
            store: StoreConfig::default(),
            rate_limit: RateLimitConfig::default(),
            commander: CommanderConfig::default(),
            agent: AgentConfig::default(),
            queue: QueueConfig::default(),
            scraper_command: None,
        }
    }
}

impl NodeConfig {
    pub fn new(role: Role, store_url: impl Into<String>) -> Self {
        Self {
            role,
            store: StoreConfig {
                url: store_url.into(),
            },
            ..Default::default()
        }
    }

    pub fn with_api_addr(mut self, addr: SocketAddr) -> Self {
        self.api_addr = Some(addr);
        self
    }
}
