//! Coordination store abstraction.
//!
//! Every cross-process interaction in the fleet goes through this narrow
//! interface. Each method maps to a single atomic operation on the backing
//! store; `exec` applies a batch of writes atomically (MULTI/EXEC on Redis).
//!
//! # Backends
//!
//! - [`MemoryStore`]: in-process, used by tests and single-node runs
//! - [`RedisStore`]: the production backend shared by every process

pub mod keys;
pub mod memory;
pub mod redis_store;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("unexpected store reply: {0}")]
    Protocol(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// One write inside an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOp {
    Set {
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    Del {
        key: String,
    },
    ZAdd {
        key: String,
        score: f64,
        member: String,
    },
    ZRem {
        key: String,
        member: String,
    },
    SAdd {
        key: String,
        member: String,
    },
    SRem {
        key: String,
        member: String,
    },
}

/// Builder for an atomic batch of writes.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    ops: Vec<BatchOp>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ops.push(BatchOp::Set {
            key: key.into(),
            value: value.into(),
            ttl: None,
        });
        self
    }

    pub fn set_px(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        self.ops.push(BatchOp::Set {
            key: key.into(),
            value: value.into(),
            ttl: Some(ttl),
        });
        self
    }

    pub fn del(mut self, key: impl Into<String>) -> Self {
        self.ops.push(BatchOp::Del { key: key.into() });
        self
    }

    pub fn zadd(mut self, key: impl Into<String>, score: f64, member: impl Into<String>) -> Self {
        self.ops.push(BatchOp::ZAdd {
            key: key.into(),
            score,
            member: member.into(),
        });
        self
    }

    pub fn zrem(mut self, key: impl Into<String>, member: impl Into<String>) -> Self {
        self.ops.push(BatchOp::ZRem {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn sadd(mut self, key: impl Into<String>, member: impl Into<String>) -> Self {
        self.ops.push(BatchOp::SAdd {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn srem(mut self, key: impl Into<String>, member: impl Into<String>) -> Self {
        self.ops.push(BatchOp::SRem {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Atomic key-value primitives shared by every commander and agent process.
///
/// Ordered-set ranges are inclusive and accept negative indices counted from
/// the end, as Redis does. Members with equal scores are ordered
/// lexicographically.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Unconditional set, with an optional expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Set only if the key is absent. Returns true when this call created the key.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    /// Returns true when a key was removed.
    async fn del(&self, key: &str) -> StoreResult<bool>;

    /// Delete `key` only if it currently holds `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool>;

    async fn incr(&self, key: &str) -> StoreResult<i64>;

    /// Returns true when the member was newly inserted.
    async fn zadd(&self, key: &str, score: f64, member: &str) -> StoreResult<bool>;

    async fn zrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>>;

    async fn zrevrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>>;

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> StoreResult<Vec<(String, f64)>>;

    async fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>>;

    async fn zrank(&self, key: &str, member: &str) -> StoreResult<Option<u64>>;

    /// Returns true when the member was present and removed.
    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool>;

    async fn zremrangebyrank(&self, key: &str, start: isize, stop: isize) -> StoreResult<u64>;

    async fn zcard(&self, key: &str) -> StoreResult<u64>;

    /// Returns true when the member was newly added.
    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool>;

    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool>;

    async fn sismember(&self, key: &str, member: &str) -> StoreResult<bool>;

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>>;

    /// Apply every op in the batch atomically.
    async fn exec(&self, batch: Batch) -> StoreResult<()>;
}

pub type SharedStore = Arc<dyn CoordinationStore>;

/// Open a store from a URL: `memory://` or `redis://host:port[/db]`.
pub async fn connect(url: &str) -> StoreResult<SharedStore> {
    if url.starts_with("memory://") {
        tracing::warn!("Using in-process memory store; coordination is limited to this process");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let store = RedisStore::connect(url).await?;
    Ok(Arc::new(store))
}

/// Resolve an inclusive `[start, stop]` range with negative indices against `len`.
pub(crate) fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let len_i = len as isize;
    let start = if start < 0 { (len_i + start).max(0) } else { start };
    let stop = if stop < 0 { len_i + stop } else { stop.min(len_i - 1) };
    if start > stop || start >= len_i || stop < 0 {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_range_handles_negative_indices() {
        assert_eq!(resolve_range(5, 0, -1), Some((0, 4)));
        assert_eq!(resolve_range(5, 0, 0), Some((0, 0)));
        assert_eq!(resolve_range(5, -2, -1), Some((3, 4)));
        assert_eq!(resolve_range(5, 2, 100), Some((2, 4)));
        assert_eq!(resolve_range(5, 4, 2), None);
        assert_eq!(resolve_range(0, 0, -1), None);
        assert_eq!(resolve_range(3, 0, -5), None);
    }

    #[test]
    fn batch_builder_keeps_order() {
        let batch = Batch::new()
            .set("a", "1")
            .zrem("z", "m")
            .sadd("s", "x");
        assert_eq!(batch.ops().len(), 3);
        assert!(matches!(batch.ops()[0], BatchOp::Set { .. }));
        assert!(matches!(batch.ops()[1], BatchOp::ZRem { .. }));
        assert!(matches!(batch.ops()[2], BatchOp::SAdd { .. }));
    }
}
