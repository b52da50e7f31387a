use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use crate::store::{keys, SharedStore, StoreResult};

/// Named advisory locks: a conditional set with TTL, released by an
/// unconditional delete.
#[derive(Clone)]
pub struct LockManager {
    store: SharedStore,
    holder: String,
}

impl LockManager {
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            holder: format!("{}:{}", std::process::id(), Uuid::new_v4()),
        }
    }

    /// Returns false when someone else holds the lock. Contention is not an error.
    pub async fn acquire(&self, name: &str, ttl: Duration) -> StoreResult<bool> {
        self.store.set_nx(&keys::lock(name), &self.holder, ttl).await
    }

    pub async fn release(&self, name: &str) -> StoreResult<()> {
        self.store.del(&keys::lock(name)).await?;
        Ok(())
    }

    /// Poll for the lock every `interval` until `timeout` elapses.
    pub async fn acquire_within(
        &self,
        name: &str,
        ttl: Duration,
        timeout: Duration,
        interval: Duration,
    ) -> StoreResult<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.acquire(name, ttl).await? {
                return Ok(true);
            }
            if Instant::now() + interval > deadline {
                return Ok(false);
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Run `f` while holding the lock, releasing it afterwards whatever `f`
    /// returned. `Ok(None)` means the lock was taken.
    pub async fn with_lock<F, Fut, T>(
        &self,
        name: &str,
        ttl: Duration,
        f: F,
    ) -> StoreResult<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if !self.acquire(name, ttl).await? {
            return Ok(None);
        }
        let out = f().await;
        if let Err(e) = self.release(name).await {
            tracing::warn!(lock = name, error = %e, "Failed to release lock; it will expire");
        }
        Ok(Some(out))
    }
}
