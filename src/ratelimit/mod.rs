//! Fleet-wide rate limiting over the coordination store.
//!
//! Two mechanisms compose. The reservation queue decides who goes next and
//! enforces the minimum spacing between grants. The request token guarantees
//! that only one external request is in flight at any instant. Every
//! primitive fails open: a broken store slows the pipeline down but never
//! wedges it.

pub mod lock;

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::config::RateLimitConfig;
use crate::scheduler::job::now_ms;
use crate::store::{keys, Batch, SharedStore, StoreResult};

pub use lock::LockManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOpenReason {
    StoreUnavailable,
    TimedOut,
}

/// Outcome of a wait. Callers proceed on both variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Granted,
    FailOpen(FailOpenReason),
}

impl Admission {
    pub fn is_granted(self) -> bool {
        matches!(self, Admission::Granted)
    }
}

/// Result of waiting in the reservation queue.
#[derive(Debug, Clone)]
pub struct SlotTicket {
    pub request_id: String,
    pub admission: Admission,
    /// Store-clock time of the grant, when one happened.
    pub granted_at: Option<i64>,
    pub waited: Duration,
}

/// Identifier for a slot wait that has no job id of its own.
pub fn generate_request_id() -> String {
    let suffix: u32 = rand::thread_rng().gen();
    format!("req_{}_{:08x}", now_ms(), suffix)
}

/// Delay between login retry checks: 100ms growing by 1.5x per elapsed
/// second, capped at 5s.
pub fn login_backoff(elapsed: Duration) -> Duration {
    let exponent = elapsed.as_secs().min(32) as i32;
    let ms = (100.0 * 1.5f64.powi(exponent)).min(5_000.0);
    Duration::from_millis(ms as u64)
}

#[derive(Clone)]
pub struct RateLimiter {
    store: SharedStore,
    locks: LockManager,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: SharedStore, config: RateLimitConfig) -> Self {
        Self {
            locks: LockManager::new(store.clone()),
            store,
            config,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    async fn last_request_time(&self) -> StoreResult<Option<i64>> {
        Ok(self
            .store
            .get(keys::LAST_REQUEST_TIME)
            .await?
            .and_then(|raw| raw.parse().ok()))
    }

    fn interval_ms(&self) -> i64 {
        self.config.min_request_interval.as_millis() as i64
    }

    /// True when at least the minimum interval has passed since the last grant.
    pub async fn interval_elapsed(&self) -> StoreResult<bool> {
        let now = now_ms();
        Ok(match self.last_request_time().await? {
            Some(last) => now - last >= self.interval_ms(),
            None => true,
        })
    }

    /// Time left until the interval has elapsed.
    pub async fn time_until_next_slot(&self) -> StoreResult<Duration> {
        let Some(last) = self.last_request_time().await? else {
            return Ok(Duration::ZERO);
        };
        let remaining = (last + self.interval_ms() - now_ms()).max(0);
        Ok(Duration::from_millis(remaining as u64))
    }

    /// Join the reservation queue. Re-reserving keeps the original place.
    pub async fn reserve(&self, request_id: &str) -> StoreResult<()> {
        if self
            .store
            .zscore(keys::RESERVATIONS, request_id)
            .await?
            .is_none()
        {
            self.store
                .zadd(keys::RESERVATIONS, now_ms() as f64, request_id)
                .await?;
        }
        Ok(())
    }

    pub async fn cancel_reservation(&self, request_id: &str) -> StoreResult<bool> {
        self.store.zrem(keys::RESERVATIONS, request_id).await
    }

    /// Zero-based place in the reservation queue.
    pub async fn position(&self, request_id: &str) -> StoreResult<Option<u64>> {
        self.store.zrank(keys::RESERVATIONS, request_id).await
    }

    async fn is_front(&self, request_id: &str) -> StoreResult<bool> {
        let front = self.store.zrange(keys::RESERVATIONS, 0, 0).await?;
        Ok(front.first().map(String::as_str) == Some(request_id))
    }

    /// Drop reservations left behind by holders that crashed mid-wait.
    async fn prune_abandoned(&self, own: &str) -> StoreResult<()> {
        let cutoff = now_ms() - 2 * self.config.max_wait.as_millis() as i64;
        let stale = self
            .store
            .zrange_by_score(keys::RESERVATIONS, f64::NEG_INFINITY, cutoff as f64)
            .await?;
        for (id, _) in stale {
            if id != own && self.store.zrem(keys::RESERVATIONS, &id).await? {
                tracing::warn!(request_id = %id, "Pruned abandoned reservation");
            }
        }
        Ok(())
    }

    /// Grant the slot to `request_id` if it is at the front and the interval
    /// has passed. Returns the grant time on success.
    ///
    /// Grants are serialized by a short lock and re-checked under it; the
    /// last-request stamp and the reservation removal land in one batch.
    pub async fn try_grant(&self, request_id: &str) -> StoreResult<Option<i64>> {
        self.prune_abandoned(request_id).await?;
        if !self.is_front(request_id).await? || !self.interval_elapsed().await? {
            return Ok(None);
        }

        let granted = self
            .locks
            .with_lock(keys::GRANT_LOCK, self.config.lock_ttl, || {
                self.grant_locked(request_id)
            })
            .await?;
        granted.unwrap_or(Ok(None))
    }

    async fn grant_locked(&self, request_id: &str) -> StoreResult<Option<i64>> {
        if !self.is_front(request_id).await? {
            return Ok(None);
        }
        let now = now_ms();
        if let Some(last) = self.last_request_time().await? {
            if now - last < self.interval_ms() {
                return Ok(None);
            }
        }
        let batch = Batch::new()
            .set(keys::LAST_REQUEST_TIME, now.to_string())
            .zrem(keys::RESERVATIONS, request_id);
        self.store.exec(batch).await?;
        Ok(Some(now))
    }

    /// Wait in FIFO order for the next slot, up to `max_wait`.
    ///
    /// Never fails: store errors and timeouts come back as
    /// [`Admission::FailOpen`] and the caller proceeds anyway.
    pub async fn wait_for_next_slot(&self, job_id: Option<&str>) -> SlotTicket {
        let request_id = job_id
            .map(str::to_string)
            .unwrap_or_else(generate_request_id);
        let started = Instant::now();
        let ticket = |admission, granted_at| SlotTicket {
            request_id: request_id.clone(),
            admission,
            granted_at,
            waited: started.elapsed(),
        };

        if let Err(e) = self.reserve(&request_id).await {
            tracing::warn!(request_id = %request_id, error = %e, "Reservation failed, proceeding without slot");
            return ticket(Admission::FailOpen(FailOpenReason::StoreUnavailable), None);
        }

        let mut last_log = Instant::now();
        loop {
            match self.try_grant(&request_id).await {
                Ok(Some(granted_at)) => {
                    tracing::info!(
                        request_id = %request_id,
                        waited_ms = started.elapsed().as_millis() as u64,
                        "Rate limit slot granted"
                    );
                    return ticket(Admission::Granted, Some(granted_at));
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(request_id = %request_id, error = %e, "Slot check failed, proceeding without slot");
                    if let Err(e) = self.cancel_reservation(&request_id).await {
                        tracing::warn!(request_id = %request_id, error = %e, "Failed to drop reservation");
                    }
                    return ticket(Admission::FailOpen(FailOpenReason::StoreUnavailable), None);
                }
            }

            if started.elapsed() >= self.config.max_wait {
                tracing::warn!(
                    request_id = %request_id,
                    max_wait_ms = self.config.max_wait.as_millis() as u64,
                    "Slot wait timed out, proceeding without slot"
                );
                if let Err(e) = self.cancel_reservation(&request_id).await {
                    tracing::warn!(request_id = %request_id, error = %e, "Failed to drop reservation");
                }
                return ticket(Admission::FailOpen(FailOpenReason::TimedOut), None);
            }

            if last_log.elapsed() >= self.config.log_interval {
                let position = self.position(&request_id).await.ok().flatten();
                tracing::info!(request_id = %request_id, ?position, "Waiting for rate limit slot");
                last_log = Instant::now();
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Take the global request token for `holder`, retrying until the token
    /// timeout. A release cool-down in progress counts as held.
    pub async fn acquire_request_token(&self, holder: &str) -> Admission {
        let started = Instant::now();
        let mut last_log = Instant::now();
        loop {
            match self.try_acquire_request_token(holder).await {
                Ok(true) => {
                    tracing::debug!(holder, "Request token acquired");
                    return Admission::Granted;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(holder, error = %e, "Request token unavailable, proceeding without it");
                    return Admission::FailOpen(FailOpenReason::StoreUnavailable);
                }
            }
            if started.elapsed() >= self.config.token_timeout {
                tracing::warn!(holder, "Request token wait timed out, proceeding without it");
                return Admission::FailOpen(FailOpenReason::TimedOut);
            }
            if last_log.elapsed() >= self.config.log_interval {
                tracing::info!(holder, "Waiting for request token");
                last_log = Instant::now();
            }
            tokio::time::sleep(self.config.token_retry).await;
        }
    }

    async fn try_acquire_request_token(&self, holder: &str) -> StoreResult<bool> {
        if self.store.get(keys::REQUEST_TOKEN_COOLDOWN).await?.is_some() {
            return Ok(false);
        }
        self.store
            .set_nx(keys::REQUEST_TOKEN, holder, self.config.token_ttl)
            .await
    }

    /// Current token holder, if any.
    pub async fn request_token_holder(&self) -> StoreResult<Option<String>> {
        self.store.get(keys::REQUEST_TOKEN).await
    }

    /// Release the token if `holder` still owns it, then start the cool-down.
    /// A release by anyone else leaves the token untouched.
    pub async fn release_request_token(&self, holder: &str) -> StoreResult<bool> {
        if self
            .store
            .compare_and_delete(keys::REQUEST_TOKEN, holder)
            .await?
        {
            self.store
                .set(
                    keys::REQUEST_TOKEN_COOLDOWN,
                    holder,
                    Some(self.config.token_cooldown),
                )
                .await?;
            tracing::debug!(holder, "Request token released");
            return Ok(true);
        }
        let current = self.request_token_holder().await?;
        tracing::warn!(
            holder,
            current = current.as_deref().unwrap_or("<none>"),
            "Refusing to release a request token held by someone else"
        );
        Ok(false)
    }

    /// Check the interval, then take `lock` and check again before stamping.
    async fn check_then_stamp(
        &self,
        stamp_key: &str,
        lock: &str,
        interval: Duration,
    ) -> StoreResult<bool> {
        if !self.stamp_elapsed(stamp_key, interval).await? {
            return Ok(false);
        }
        let stamped = self
            .locks
            .with_lock(lock, self.config.lock_ttl, || {
                self.stamp_if_elapsed(stamp_key, interval)
            })
            .await?;
        stamped.unwrap_or(Ok(false))
    }

    async fn stamp_elapsed(&self, stamp_key: &str, interval: Duration) -> StoreResult<bool> {
        let last = self
            .store
            .get(stamp_key)
            .await?
            .and_then(|raw| raw.parse::<i64>().ok());
        Ok(last.map_or(true, |last| now_ms() - last >= interval.as_millis() as i64))
    }

    async fn stamp_if_elapsed(&self, stamp_key: &str, interval: Duration) -> StoreResult<bool> {
        if !self.stamp_elapsed(stamp_key, interval).await? {
            return Ok(false);
        }
        self.store
            .set(stamp_key, &now_ms().to_string(), None)
            .await?;
        Ok(true)
    }

    /// Single-shot gate for an external request outside the reservation
    /// queue. Store errors admit the request.
    pub async fn can_make_request(&self) -> bool {
        match self
            .check_then_stamp(
                keys::LAST_REQUEST_TIME,
                keys::GRANT_LOCK,
                self.config.min_request_interval,
            )
            .await
        {
            Ok(allowed) => allowed,
            Err(e) => {
                tracing::warn!(error = %e, "Request gate unavailable, allowing request");
                true
            }
        }
    }

    /// Single-shot gate for a login retry. Store errors admit the retry.
    pub async fn can_retry_login(&self) -> bool {
        match self.try_login_retry().await {
            Ok(allowed) => allowed,
            Err(e) => {
                tracing::warn!(error = %e, "Login retry gate unavailable, allowing retry");
                true
            }
        }
    }

    async fn try_login_retry(&self) -> StoreResult<bool> {
        self.check_then_stamp(
            keys::LAST_LOGIN_RETRY,
            keys::LOGIN_RETRY_LOCK,
            self.config.login_retry_interval,
        )
        .await
    }

    /// Wait until a login retry is allowed, backing off between checks.
    pub async fn wait_for_login_retry_slot(&self) -> Admission {
        let started = Instant::now();
        let mut last_log = Instant::now();
        loop {
            match self.try_login_retry().await {
                Ok(true) => {
                    tracing::info!("Login retry slot granted");
                    return Admission::Granted;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Login retry gate unavailable, proceeding");
                    return Admission::FailOpen(FailOpenReason::StoreUnavailable);
                }
            }
            let elapsed = started.elapsed();
            if elapsed >= self.config.max_wait {
                tracing::warn!("Login retry wait timed out, proceeding");
                return Admission::FailOpen(FailOpenReason::TimedOut);
            }
            if last_log.elapsed() >= self.config.log_interval {
                tracing::info!(
                    waited_ms = elapsed.as_millis() as u64,
                    "Waiting for login retry slot"
                );
                last_log = Instant::now();
            }
            tokio::time::sleep(login_backoff(elapsed)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::store::MemoryStore;

    fn fast_config() -> RateLimitConfig {
        RateLimitConfig {
            min_request_interval: Duration::from_millis(100),
            max_wait: Duration::from_secs(2),
            poll_interval: Duration::from_millis(10),
            token_ttl: Duration::from_secs(5),
            token_timeout: Duration::from_millis(200),
            token_retry: Duration::from_millis(10),
            token_cooldown: Duration::from_millis(30),
            login_retry_interval: Duration::from_millis(100),
            ..RateLimitConfig::default()
        }
    }

    fn limiter() -> RateLimiter {
        RateLimiter::new(Arc::new(MemoryStore::new()), fast_config())
    }

    #[test]
    fn login_backoff_grows_and_caps() {
        assert_eq!(login_backoff(Duration::ZERO), Duration::from_millis(100));
        assert_eq!(login_backoff(Duration::from_secs(1)), Duration::from_millis(150));
        assert_eq!(login_backoff(Duration::from_millis(2500)), Duration::from_millis(225));
        assert_eq!(login_backoff(Duration::from_secs(60)), Duration::from_secs(5));
    }

    #[test]
    fn request_ids_are_prefixed_and_unique() {
        let a = generate_request_id();
        let b = generate_request_id();
        assert!(a.starts_with("req_"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn first_request_is_granted_immediately() {
        let limiter = limiter();
        let ticket = limiter.wait_for_next_slot(Some("job-1")).await;
        assert_eq!(ticket.admission, Admission::Granted);
        assert!(ticket.granted_at.is_some());
        assert_eq!(limiter.position("job-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn only_the_front_reservation_is_granted() {
        let limiter = limiter();
        limiter.reserve("a").await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        limiter.reserve("b").await.unwrap();

        assert_eq!(limiter.try_grant("b").await.unwrap(), None);
        assert!(limiter.try_grant("a").await.unwrap().is_some());
        // interval not yet elapsed
        assert_eq!(limiter.try_grant("b").await.unwrap(), None);
        tokio::time::sleep(Duration::from_millis(110)).await;
        assert!(limiter.try_grant("b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn reserving_twice_keeps_the_original_place() {
        let limiter = limiter();
        limiter.reserve("a").await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        limiter.reserve("b").await.unwrap();
        limiter.reserve("a").await.unwrap();
        assert_eq!(limiter.position("a").await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn slot_wait_times_out_open_and_leaves_the_queue() {
        let config = RateLimitConfig {
            max_wait: Duration::from_millis(50),
            ..fast_config()
        };
        let limiter = RateLimiter::new(Arc::new(MemoryStore::new()), config);
        limiter.reserve("blocker").await.unwrap();

        let ticket = limiter.wait_for_next_slot(Some("late")).await;
        assert_eq!(
            ticket.admission,
            Admission::FailOpen(FailOpenReason::TimedOut)
        );
        assert_eq!(limiter.position("late").await.unwrap(), None);
    }

    #[tokio::test]
    async fn token_is_exclusive_and_owner_released() {
        let limiter = limiter();
        assert_eq!(limiter.acquire_request_token("w1").await, Admission::Granted);
        assert_eq!(
            limiter.acquire_request_token("w2").await,
            Admission::FailOpen(FailOpenReason::TimedOut)
        );

        assert!(!limiter.release_request_token("w2").await.unwrap());
        assert_eq!(
            limiter.request_token_holder().await.unwrap().as_deref(),
            Some("w1")
        );

        assert!(limiter.release_request_token("w1").await.unwrap());
        assert!(limiter.request_token_holder().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cooldown_delays_the_next_holder() {
        let limiter = limiter();
        assert_eq!(limiter.acquire_request_token("w1").await, Admission::Granted);
        limiter.release_request_token("w1").await.unwrap();

        let started = Instant::now();
        assert_eq!(limiter.acquire_request_token("w2").await, Admission::Granted);
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn login_retry_is_spaced() {
        let limiter = limiter();
        assert!(limiter.can_retry_login().await);
        assert!(!limiter.can_retry_login().await);
        assert_eq!(limiter.wait_for_login_retry_slot().await, Admission::Granted);
    }

    #[tokio::test]
    async fn legacy_request_gate_stamps_last_request_time() {
        let limiter = limiter();
        assert!(limiter.can_make_request().await);
        assert!(!limiter.can_make_request().await);
        assert!(!limiter.interval_elapsed().await.unwrap());
        assert!(limiter.time_until_next_slot().await.unwrap() > Duration::ZERO);
    }
}
