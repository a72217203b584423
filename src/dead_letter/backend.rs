use crate::clock::{Clock, SystemClock};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Failure reported by a dead-letter backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("backend error: {0}")]
    Other(String),
}

/// Iteration order for index range queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Ascending,
    Descending,
}

/// Storage capabilities the dead letter store relies on.
///
/// Each call must be atomic for the key (or index member) it touches. No cross-key transactions
/// are assumed: a record and its index entry are written by two separate calls.
#[async_trait]
pub trait DeadLetterBackend: Send + Sync + fmt::Debug {
    /// Insert or replace `key`. A `ttl` makes the key invisible once it elapses.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), BackendError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool, BackendError>;

    /// Insert `member` into `index` with `score`, replacing any previous score.
    async fn index_insert(&self, index: &str, member: &str, score: i64) -> Result<(), BackendError>;

    /// Returns whether the member existed.
    async fn index_remove(&self, index: &str, member: &str) -> Result<bool, BackendError>;

    /// Members whose score lies in `min..=max`, in score order (ties broken by member), skipping
    /// `offset` and returning at most `limit` entries.
    async fn index_range_by_score(
        &self,
        index: &str,
        min: i64,
        max: i64,
        order: Order,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<Vec<(String, i64)>, BackendError>;

    async fn index_len(&self, index: &str) -> Result<usize, BackendError>;
}

#[derive(Debug, Default)]
struct ScoreIndex {
    scores: HashMap<String, i64>,
    ordered: BTreeSet<(i64, String)>,
}

#[derive(Debug, Default)]
struct Tables {
    values: HashMap<String, (Vec<u8>, Option<u64>)>,
    indexes: HashMap<String, ScoreIndex>,
}

/// In-process backend: a hash map with lazy TTL expiry plus ordered sets for the indexes.
///
/// Clones share the same tables.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    tables: Arc<Mutex<Tables>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self { tables: Arc::new(Mutex::new(Tables::default())), clock: Arc::new(SystemClock) }
    }

    /// Clock used for TTL expiry.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Number of live keys.
    pub fn key_count(&self) -> usize {
        let now = self.clock.now_millis();
        self.tables.lock().values.values().filter(|(_, exp)| exp.map_or(true, |e| e > now)).count()
    }
}

#[async_trait]
impl DeadLetterBackend for MemoryBackend {
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), BackendError> {
        let expires_at = ttl.map(|t| {
            let millis = u64::try_from(t.as_millis()).unwrap_or(u64::MAX);
            self.clock.now_millis().saturating_add(millis)
        });
        self.tables.lock().values.insert(key.to_string(), (value, expires_at));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        let now = self.clock.now_millis();
        let mut tables = self.tables.lock();
        match tables.values.get(key) {
            None => return Ok(None),
            Some((value, exp)) if exp.map_or(true, |e| e > now) => return Ok(Some(value.clone())),
            Some(_) => {}
        }
        tables.values.remove(key);
        Ok(None)
    }

    async fn delete(&self, key: &str) -> Result<bool, BackendError> {
        let now = self.clock.now_millis();
        let removed = self.tables.lock().values.remove(key);
        Ok(removed.is_some_and(|(_, exp)| exp.map_or(true, |e| e > now)))
    }

    async fn index_insert(&self, index: &str, member: &str, score: i64) -> Result<(), BackendError> {
        let mut tables = self.tables.lock();
        let idx = tables.indexes.entry(index.to_string()).or_default();
        if let Some(old) = idx.scores.insert(member.to_string(), score) {
            idx.ordered.remove(&(old, member.to_string()));
        }
        idx.ordered.insert((score, member.to_string()));
        Ok(())
    }

    async fn index_remove(&self, index: &str, member: &str) -> Result<bool, BackendError> {
        let mut tables = self.tables.lock();
        let Some(idx) = tables.indexes.get_mut(index) else {
            return Ok(false);
        };
        match idx.scores.remove(member) {
            Some(score) => {
                idx.ordered.remove(&(score, member.to_string()));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn index_range_by_score(
        &self,
        index: &str,
        min: i64,
        max: i64,
        order: Order,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<Vec<(String, i64)>, BackendError> {
        if min > max {
            return Ok(Vec::new());
        }
        let tables = self.tables.lock();
        let Some(idx) = tables.indexes.get(index) else {
            return Ok(Vec::new());
        };
        let range = idx.ordered.range((min, String::new())..).take_while(|(s, _)| *s <= max);
        let take = limit.unwrap_or(usize::MAX);
        let out = match order {
            Order::Ascending => {
                range.skip(offset).take(take).map(|(s, m)| (m.clone(), *s)).collect()
            }
            Order::Descending => {
                let all: Vec<_> = range.collect();
                all.into_iter().rev().skip(offset).take(take).map(|(s, m)| (m.clone(), *s)).collect()
            }
        };
        Ok(out)
    }

    async fn index_len(&self, index: &str) -> Result<usize, BackendError> {
        Ok(self.tables.lock().indexes.get(index).map_or(0, |i| i.scores.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[tokio::test]
    async fn set_get_delete() {
        let backend = MemoryBackend::new();
        backend.set("a", b"one".to_vec(), None).await.unwrap();
        assert_eq!(backend.get("a").await.unwrap(), Some(b"one".to_vec()));

        backend.set("a", b"two".to_vec(), None).await.unwrap();
        assert_eq!(backend.get("a").await.unwrap(), Some(b"two".to_vec()));

        assert!(backend.delete("a").await.unwrap());
        assert!(!backend.delete("a").await.unwrap());
        assert_eq!(backend.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn keys_expire_after_ttl() {
        let clock = ManualClock::new(1_000);
        let backend = MemoryBackend::new().with_clock(clock.clone());
        backend.set("k", vec![1], Some(Duration::from_millis(500))).await.unwrap();

        clock.advance(499);
        assert!(backend.get("k").await.unwrap().is_some());
        assert_eq!(backend.key_count(), 1);

        clock.advance(1);
        assert!(backend.get("k").await.unwrap().is_none());
        assert_eq!(backend.key_count(), 0);
    }

    #[tokio::test]
    async fn index_orders_by_score_then_member() {
        let backend = MemoryBackend::new();
        backend.index_insert("idx", "b", 20).await.unwrap();
        backend.index_insert("idx", "a", 10).await.unwrap();
        backend.index_insert("idx", "c", 20).await.unwrap();

        let asc = backend
            .index_range_by_score("idx", i64::MIN, i64::MAX, Order::Ascending, 0, None)
            .await
            .unwrap();
        assert_eq!(asc, vec![("a".into(), 10), ("b".into(), 20), ("c".into(), 20)]);

        let desc = backend
            .index_range_by_score("idx", i64::MIN, i64::MAX, Order::Descending, 1, Some(1))
            .await
            .unwrap();
        assert_eq!(desc, vec![("b".to_string(), 20)]);
    }

    #[tokio::test]
    async fn index_reinsert_replaces_score() {
        let backend = MemoryBackend::new();
        backend.index_insert("idx", "x", 1).await.unwrap();
        backend.index_insert("idx", "x", 5).await.unwrap();
        assert_eq!(backend.index_len("idx").await.unwrap(), 1);

        let low = backend.index_range_by_score("idx", 0, 4, Order::Ascending, 0, None).await.unwrap();
        assert!(low.is_empty());
        assert!(backend.index_remove("idx", "x").await.unwrap());
        assert!(!backend.index_remove("idx", "x").await.unwrap());
        assert!(!backend.index_remove("missing", "x").await.unwrap());
    }

    #[tokio::test]
    async fn range_bounds_are_inclusive() {
        let backend = MemoryBackend::new();
        for (m, s) in [("a", 1), ("b", 2), ("c", 3)] {
            backend.index_insert("idx", m, s).await.unwrap();
        }
        let mid = backend.index_range_by_score("idx", 2, 3, Order::Ascending, 0, None).await.unwrap();
        assert_eq!(mid, vec![("b".into(), 2), ("c".into(), 3)]);
        assert!(backend
            .index_range_by_score("idx", 3, 2, Order::Ascending, 0, None)
            .await
            .unwrap()
            .is_empty());
    }
}
