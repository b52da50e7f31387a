use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{resolve_range, Batch, BatchOp, CoordinationStore, StoreError, StoreResult};

/// Score wrapper giving `f64` a total order.
#[derive(Debug, Clone, Copy)]
struct Score(f64);

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

#[derive(Debug, Default)]
struct SortedSet {
    by_member: HashMap<String, f64>,
    ordered: BTreeSet<(Score, String)>,
}

impl SortedSet {
    fn insert(&mut self, score: f64, member: &str) -> bool {
        let fresh = match self.by_member.insert(member.to_string(), score) {
            Some(old) => {
                self.ordered.remove(&(Score(old), member.to_string()));
                false
            }
            None => true,
        };
        self.ordered.insert((Score(score), member.to_string()));
        fresh
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.by_member.remove(member) {
            Some(score) => {
                self.ordered.remove(&(Score(score), member.to_string()));
                true
            }
            None => false,
        }
    }

    fn members(&self) -> Vec<(String, f64)> {
        self.ordered
            .iter()
            .map(|(score, member)| (member.clone(), score.0))
            .collect()
    }

    fn len(&self) -> usize {
        self.by_member.len()
    }
}

#[derive(Debug)]
enum Value {
    Str(String),
    Sorted(SortedSet),
    Set(HashSet<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Str,
    Sorted,
    Set,
}

impl Value {
    fn kind(&self) -> Kind {
        match self {
            Value::Str(_) => Kind::Str,
            Value::Sorted(_) => Kind::Sorted,
            Value::Set(_) => Kind::Set,
        }
    }
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Entry>,
}

impl Inner {
    /// Drop the key if its TTL has elapsed, then return it.
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let now = Instant::now();
        if self.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn get_str(&mut self, key: &str) -> StoreResult<Option<String>> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn set_str(&mut self, key: &str, value: &str, ttl: Option<Duration>) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
    }

    fn sorted(&mut self, key: &str) -> StoreResult<Option<&mut SortedSet>> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Sorted(z),
                ..
            }) => Ok(Some(z)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn sorted_or_create(&mut self, key: &str) -> StoreResult<&mut SortedSet> {
        if self.sorted(key)?.is_none() {
            self.entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Sorted(SortedSet::default()),
                    expires_at: None,
                },
            );
        }
        match self.entries.get_mut(key) {
            Some(Entry {
                value: Value::Sorted(z),
                ..
            }) => Ok(z),
            _ => Err(wrong_type(key)),
        }
    }

    fn set(&mut self, key: &str) -> StoreResult<Option<&mut HashSet<String>>> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Set(s),
                ..
            }) => Ok(Some(s)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn set_or_create(&mut self, key: &str) -> StoreResult<&mut HashSet<String>> {
        if self.set(key)?.is_none() {
            self.entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Set(HashSet::new()),
                    expires_at: None,
                },
            );
        }
        match self.entries.get_mut(key) {
            Some(Entry {
                value: Value::Set(s),
                ..
            }) => Ok(s),
            _ => Err(wrong_type(key)),
        }
    }

    fn zadd(&mut self, key: &str, score: f64, member: &str) -> StoreResult<bool> {
        Ok(self.sorted_or_create(key)?.insert(score, member))
    }

    fn zrem(&mut self, key: &str, member: &str) -> StoreResult<bool> {
        let (removed, empty) = match self.sorted(key)? {
            Some(z) => (z.remove(member), z.len() == 0),
            None => return Ok(false),
        };
        if empty {
            self.entries.remove(key);
        }
        Ok(removed)
    }

    fn sadd(&mut self, key: &str, member: &str) -> StoreResult<bool> {
        Ok(self.set_or_create(key)?.insert(member.to_string()))
    }

    fn srem(&mut self, key: &str, member: &str) -> StoreResult<bool> {
        let (removed, empty) = match self.set(key)? {
            Some(s) => (s.remove(member), s.is_empty()),
            None => return Ok(false),
        };
        if empty {
            self.entries.remove(key);
        }
        Ok(removed)
    }

    fn del(&mut self, key: &str) -> bool {
        self.live(key);
        self.entries.remove(key).is_some()
    }

    fn kind(&mut self, key: &str) -> Option<Kind> {
        self.live(key).map(|e| e.value.kind())
    }

    /// Type-check a whole batch without applying it, tracking the type each
    /// key will hold after the ops before it.
    ///
    /// A removal that would empty a collection is assumed to leave it in
    /// place, so a batch relying on that to retype the key is rejected.
    fn check(&mut self, ops: &[BatchOp]) -> StoreResult<()> {
        let mut staged: HashMap<&str, Option<Kind>> = HashMap::new();
        for op in ops {
            let (key, next) = match op {
                BatchOp::Set { key, .. } => (key, Some(Kind::Str)),
                BatchOp::Del { key } => (key, None),
                BatchOp::ZAdd { key, .. } | BatchOp::ZRem { key, .. } => (key, Some(Kind::Sorted)),
                BatchOp::SAdd { key, .. } | BatchOp::SRem { key, .. } => (key, Some(Kind::Set)),
            };
            let current = match staged.get(key.as_str()) {
                Some(kind) => *kind,
                None => self.kind(key),
            };
            let overwrites = matches!(op, BatchOp::Set { .. } | BatchOp::Del { .. });
            if !overwrites && current.is_some_and(|kind| Some(kind) != next) {
                return Err(wrong_type(key));
            }
            let after = match op {
                BatchOp::ZRem { .. } | BatchOp::SRem { .. } => current,
                _ => next,
            };
            staged.insert(key.as_str(), after);
        }
        Ok(())
    }

    fn apply(&mut self, op: BatchOp) -> StoreResult<()> {
        match op {
            BatchOp::Set { key, value, ttl } => self.set_str(&key, &value, ttl),
            BatchOp::Del { key } => {
                self.del(&key);
            }
            BatchOp::ZAdd { key, score, member } => {
                self.zadd(&key, score, &member)?;
            }
            BatchOp::ZRem { key, member } => {
                self.zrem(&key, &member)?;
            }
            BatchOp::SAdd { key, member } => {
                self.sadd(&key, &member)?;
            }
            BatchOp::SRem { key, member } => {
                self.srem(&key, &member)?;
            }
        }
        Ok(())
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Protocol(format!(
        "WRONGTYPE operation against key {key} holding the wrong kind of value"
    ))
}

/// In-process coordination store.
///
/// Mirrors the Redis semantics the fleet relies on (NX sets with expiry,
/// lexicographic tie-breaking in sorted sets, atomic batches) behind a single
/// mutex. Clone the surrounding `Arc` to share it between roles in one process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.inner.lock().await.get_str(key)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.inner.lock().await.set_str(key, value, ttl);
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        if inner.live(key).is_some() {
            return Ok(false);
        }
        inner.set_str(key, value, Some(ttl));
        Ok(true)
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        Ok(self.inner.lock().await.del(key))
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        match inner.get_str(key)? {
            Some(current) if current == expected => Ok(inner.del(key)),
            _ => Ok(false),
        }
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        let mut inner = self.inner.lock().await;
        let current = match inner.get_str(key)? {
            Some(raw) => raw.parse::<i64>().map_err(|_| {
                StoreError::Protocol(format!("value at {key} is not an integer"))
            })?,
            None => 0,
        };
        let next = current + 1;
        let expires_at = inner.live(key).and_then(|e| e.expires_at);
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(next.to_string()),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> StoreResult<bool> {
        self.inner.lock().await.zadd(key, score, member)
    }

    async fn zrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>> {
        let mut inner = self.inner.lock().await;
        let Some(z) = inner.sorted(key)? else {
            return Ok(Vec::new());
        };
        let members = z.members();
        Ok(match resolve_range(members.len(), start, stop) {
            Some((from, to)) => members[from..=to].iter().map(|(m, _)| m.clone()).collect(),
            None => Vec::new(),
        })
    }

    async fn zrevrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>> {
        let mut inner = self.inner.lock().await;
        let Some(z) = inner.sorted(key)? else {
            return Ok(Vec::new());
        };
        let mut members = z.members();
        members.reverse();
        Ok(match resolve_range(members.len(), start, stop) {
            Some((from, to)) => members[from..=to].iter().map(|(m, _)| m.clone()).collect(),
            None => Vec::new(),
        })
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> StoreResult<Vec<(String, f64)>> {
        let mut inner = self.inner.lock().await;
        let Some(z) = inner.sorted(key)? else {
            return Ok(Vec::new());
        };
        Ok(z
            .members()
            .into_iter()
            .filter(|(_, score)| *score >= min && *score <= max)
            .collect())
    }

    async fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>> {
        let mut inner = self.inner.lock().await;
        Ok(inner
            .sorted(key)?
            .and_then(|z| z.by_member.get(member).copied()))
    }

    async fn zrank(&self, key: &str, member: &str) -> StoreResult<Option<u64>> {
        let mut inner = self.inner.lock().await;
        let Some(z) = inner.sorted(key)? else {
            return Ok(None);
        };
        Ok(z
            .ordered
            .iter()
            .position(|(_, m)| m == member)
            .map(|rank| rank as u64))
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.inner.lock().await.zrem(key, member)
    }

    async fn zremrangebyrank(&self, key: &str, start: isize, stop: isize) -> StoreResult<u64> {
        let mut inner = self.inner.lock().await;
        let doomed: Vec<String> = match inner.sorted(key)? {
            Some(z) => {
                let members = z.members();
                match resolve_range(members.len(), start, stop) {
                    Some((from, to)) => members[from..=to].iter().map(|(m, _)| m.clone()).collect(),
                    None => Vec::new(),
                }
            }
            None => Vec::new(),
        };
        for member in &doomed {
            inner.zrem(key, member)?;
        }
        Ok(doomed.len() as u64)
    }

    async fn zcard(&self, key: &str) -> StoreResult<u64> {
        let mut inner = self.inner.lock().await;
        Ok(inner.sorted(key)?.map(|z| z.len() as u64).unwrap_or(0))
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.inner.lock().await.sadd(key, member)
    }

    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.inner.lock().await.srem(key, member)
    }

    async fn sismember(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        Ok(inner.set(key)?.is_some_and(|s| s.contains(member)))
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut inner = self.inner.lock().await;
        let mut members: Vec<String> = inner
            .set(key)?
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        Ok(members)
    }

    async fn exec(&self, batch: Batch) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        // Reject the whole batch up front so a type error cannot leave it half applied.
        inner.check(batch.ops())?;
        for op in batch.into_ops() {
            inner.apply(op)?;
        }
        Ok(())
    }
}
