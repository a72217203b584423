use super::backend::{BackendError, DeadLetterBackend, Order};
use crate::clock::{Clock, SystemClock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default retention for dead-letter records (7 days).
pub const DEFAULT_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

const PAGE: usize = 64;

/// An operation that exhausted its retries.
///
/// Timestamps are unix milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedOperation {
    pub id: String,
    pub client_id: String,
    pub operation_kind: String,
    pub endpoint: String,
    pub request_payload: serde_json::Value,
    pub last_error: String,
    /// Retries made after the first attempt.
    pub retry_count: u32,
    pub created_at: u64,
    pub last_attempt: u64,
}

/// Errors returned by [`DeadLetterStore`].
#[derive(Debug, thiserror::Error)]
pub enum DeadLetterError {
    #[error("dead letter `{0}` not found")]
    NotFound(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("failed to encode or decode dead letter: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Key layout and retention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterConfig {
    ttl: Duration,
    key_prefix: String,
    index_key: String,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self { ttl: DEFAULT_TTL, key_prefix: "dlq:op:".to_string(), index_key: "dlq:index".to_string() }
    }
}

impl DeadLetterConfig {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Prefix prepended to every record id to form its key.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Name of the time-ordered index.
    pub fn with_index_key(mut self, index: impl Into<String>) -> Self {
        self.index_key = index.into();
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    pub fn index_key(&self) -> &str {
        &self.index_key
    }
}

/// Aggregate view of the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeadLetterStats {
    pub total: usize,
    pub by_kind: BTreeMap<String, usize>,
    /// Oldest `last_attempt`, unix millis.
    pub oldest: Option<u64>,
    /// Newest `last_attempt`, unix millis.
    pub newest: Option<u64>,
}

/// Score-keyed position in the index.
///
/// Each page starts at the last score seen, skipping the members already returned at that
/// score, so entries inserted between page reads never shift earlier results into later pages.
#[derive(Debug)]
struct Cursor {
    order: Order,
    bound: i64,
    skip: usize,
    seen: HashSet<String>,
}

impl Cursor {
    fn new(order: Order) -> Self {
        let bound = match order {
            Order::Ascending => i64::MIN,
            Order::Descending => i64::MAX,
        };
        Self { order, bound, skip: 0, seen: HashSet::new() }
    }

    fn advance(&mut self, page: Vec<(String, i64)>) -> Vec<String> {
        let Some(last) = page.last().map(|(_, score)| *score) else {
            return Vec::new();
        };
        let at_last = page.iter().filter(|(_, score)| *score == last).count();
        self.skip = if last == self.bound { self.skip + at_last } else { at_last };
        self.bound = last;
        page.into_iter().map(|(id, _)| id).filter(|id| self.seen.insert(id.clone())).collect()
    }
}

/// Queryable store of failed operations.
///
/// Records live under `key_prefix + id` with the configured TTL; the index scores each id by
/// `last_attempt`. Index entries whose record has expired are removed lazily by the queries
/// that encounter them. Clones share the backend.
#[derive(Debug, Clone)]
pub struct DeadLetterStore {
    backend: Arc<dyn DeadLetterBackend>,
    config: DeadLetterConfig,
    clock: Arc<dyn Clock>,
    seq: Arc<AtomicU64>,
}

impl DeadLetterStore {
    pub fn new(backend: Arc<dyn DeadLetterBackend>, config: DeadLetterConfig) -> Self {
        Self { backend, config, clock: Arc::new(SystemClock), seq: Arc::new(AtomicU64::new(0)) }
    }

    /// Wall clock for timestamps and cleanup cutoffs.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn config(&self) -> &DeadLetterConfig {
        &self.config
    }

    pub fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    /// Fresh id for a failed operation: `kind:client:millis-seq`.
    pub fn next_id(&self, operation_kind: &str, client_id: &str) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("{}:{}:{}-{}", operation_kind, client_id, self.clock.now_millis(), seq)
    }

    fn key(&self, id: &str) -> String {
        format!("{}{}", self.config.key_prefix, id)
    }

    fn index(&self) -> &str {
        &self.config.index_key
    }

    /// Insert or replace a record and its index entry.
    pub async fn store(&self, op: &FailedOperation) -> Result<(), DeadLetterError> {
        let bytes = serde_json::to_vec(op)?;
        self.backend.set(&self.key(&op.id), bytes, Some(self.config.ttl)).await?;
        let score = i64::try_from(op.last_attempt).unwrap_or(i64::MAX);
        self.backend.index_insert(self.index(), &op.id, score).await?;
        tracing::debug!(id = %op.id, operation = %op.operation_kind, "stored dead letter");
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<FailedOperation>, DeadLetterError> {
        match self.backend.get(&self.key(id)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn get(&self, id: &str) -> Result<FailedOperation, DeadLetterError> {
        self.load(id).await?.ok_or_else(|| DeadLetterError::NotFound(id.to_string()))
    }

    /// Most recently attempted records, newest first.
    pub async fn list(&self, limit: usize) -> Result<Vec<FailedOperation>, DeadLetterError> {
        self.recent(limit, |_| true).await
    }

    pub async fn by_operation_kind(
        &self,
        kind: &str,
        limit: usize,
    ) -> Result<Vec<FailedOperation>, DeadLetterError> {
        self.recent(limit, |op| op.operation_kind == kind).await
    }

    pub async fn by_client_id(
        &self,
        client_id: &str,
        limit: usize,
    ) -> Result<Vec<FailedOperation>, DeadLetterError> {
        self.recent(limit, |op| op.client_id == client_id).await
    }

    /// Remove a record and its index entry. Returns whether either existed.
    pub async fn delete(&self, id: &str) -> Result<bool, DeadLetterError> {
        let had_record = self.backend.delete(&self.key(id)).await?;
        let had_index = self.backend.index_remove(self.index(), id).await?;
        Ok(had_record || had_index)
    }

    /// Remove every record whose `last_attempt` precedes `now - older_than`.
    ///
    /// Returns the number of index entries removed.
    pub async fn cleanup(&self, older_than: Duration) -> Result<usize, DeadLetterError> {
        let older = u64::try_from(older_than.as_millis()).unwrap_or(u64::MAX);
        let cutoff = self.clock.now_millis().saturating_sub(older);
        let cutoff = i64::try_from(cutoff).unwrap_or(i64::MAX);
        let stale = self
            .backend
            .index_range_by_score(self.index(), i64::MIN, cutoff - 1, Order::Ascending, 0, None)
            .await?;

        let mut removed = 0;
        for (id, _) in &stale {
            self.backend.delete(&self.key(id)).await?;
            if self.backend.index_remove(self.index(), id).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, cutoff_ms = cutoff, "dead letter cleanup");
        }
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<DeadLetterStats, DeadLetterError> {
        let mut stats = DeadLetterStats::default();
        let mut dangling = Vec::new();
        let mut cursor = Cursor::new(Order::Ascending);
        loop {
            let Some(page) = self.next_page(&mut cursor, PAGE).await? else {
                break;
            };
            for id in page {
                match self.load(&id).await? {
                    Some(op) => {
                        stats.total += 1;
                        *stats.by_kind.entry(op.operation_kind).or_insert(0) += 1;
                        stats.oldest = Some(stats.oldest.map_or(op.last_attempt, |o| o.min(op.last_attempt)));
                        stats.newest = Some(stats.newest.map_or(op.last_attempt, |n| n.max(op.last_attempt)));
                    }
                    None => dangling.push(id),
                }
            }
        }
        self.prune(dangling).await?;
        Ok(stats)
    }

    /// Index entries, including any whose record expired and has not been pruned yet.
    pub async fn len(&self) -> Result<usize, DeadLetterError> {
        Ok(self.backend.index_len(self.index()).await?)
    }

    pub async fn is_empty(&self) -> Result<bool, DeadLetterError> {
        Ok(self.len().await? == 0)
    }

    async fn recent<F>(&self, limit: usize, keep: F) -> Result<Vec<FailedOperation>, DeadLetterError>
    where
        F: Fn(&FailedOperation) -> bool,
    {
        let mut out = Vec::new();
        let mut dangling = Vec::new();
        let mut cursor = Cursor::new(Order::Descending);
        while out.len() < limit {
            let Some(page) = self.next_page(&mut cursor, PAGE.max(limit)).await? else {
                break;
            };
            for id in page {
                match self.load(&id).await? {
                    Some(op) if keep(&op) => {
                        out.push(op);
                        if out.len() == limit {
                            break;
                        }
                    }
                    Some(_) => {}
                    None => dangling.push(id),
                }
            }
        }
        self.prune(dangling).await?;
        Ok(out)
    }

    /// Next batch of ids not yet returned by `cursor`; `None` once the index is exhausted.
    async fn next_page(
        &self,
        cursor: &mut Cursor,
        size: usize,
    ) -> Result<Option<Vec<String>>, DeadLetterError> {
        let (min, max) = match cursor.order {
            Order::Ascending => (cursor.bound, i64::MAX),
            Order::Descending => (i64::MIN, cursor.bound),
        };
        let page = self
            .backend
            .index_range_by_score(self.index(), min, max, cursor.order, cursor.skip, Some(size))
            .await?;
        if page.is_empty() {
            return Ok(None);
        }
        Ok(Some(cursor.advance(page)))
    }

    async fn prune(&self, ids: Vec<String>) -> Result<(), DeadLetterError> {
        if ids.is_empty() {
            return Ok(());
        }
        for id in &ids {
            self.backend.index_remove(self.index(), id).await?;
        }
        tracing::debug!(pruned = ids.len(), "removed index entries for expired dead letters");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::dead_letter::MemoryBackend;
    use serde_json::json;

    const DAY_MS: u64 = 24 * 60 * 60 * 1000;

    fn store_at(start: u64) -> (DeadLetterStore, ManualClock) {
        let clock = ManualClock::new(start);
        let backend = MemoryBackend::new().with_clock(clock.clone());
        let store = DeadLetterStore::new(Arc::new(backend), DeadLetterConfig::default())
            .with_clock(clock.clone());
        (store, clock)
    }

    fn failed(id: &str, kind: &str, client: &str, last_attempt: u64) -> FailedOperation {
        FailedOperation {
            id: id.to_string(),
            client_id: client.to_string(),
            operation_kind: kind.to_string(),
            endpoint: format!("http://localhost:8080/{kind}"),
            request_payload: json!({ "tool": "search", "args": { "q": id } }),
            last_error: "503 Service Unavailable".to_string(),
            retry_count: 3,
            created_at: last_attempt.saturating_sub(100),
            last_attempt,
        }
    }

    #[tokio::test]
    async fn store_then_get_round_trips() {
        let (store, _) = store_at(10 * DAY_MS);
        let op = failed("a", "call_tool", "c1", 10 * DAY_MS);
        store.store(&op).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), op);
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let (store, _) = store_at(0);
        assert!(matches!(store.get("nope").await, Err(DeadLetterError::NotFound(id)) if id == "nope"));
    }

    #[tokio::test]
    async fn store_is_an_idempotent_upsert() {
        let (store, _) = store_at(10 * DAY_MS);
        let mut op = failed("a", "connect", "c1", 1_000);
        store.store(&op).await.unwrap();
        op.last_attempt = 2_000;
        op.last_error = "connection reset".to_string();
        store.store(&op).await.unwrap();

        assert_eq!(store.len().await.unwrap(), 1);
        assert_eq!(store.get("a").await.unwrap().last_error, "connection reset");
    }

    #[tokio::test]
    async fn list_returns_newest_first_bounded_by_limit() {
        let (store, _) = store_at(10 * DAY_MS);
        for (i, ts) in [500u64, 100, 900, 300, 700].into_iter().enumerate() {
            store.store(&failed(&format!("op{i}"), "call_tool", "c", ts)).await.unwrap();
        }

        let top: Vec<u64> = store.list(3).await.unwrap().iter().map(|o| o.last_attempt).collect();
        assert_eq!(top, vec![900, 700, 500]);
        assert_eq!(store.list(50).await.unwrap().len(), 5);
        assert!(store.list(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn filters_by_kind_and_client() {
        let (store, _) = store_at(10 * DAY_MS);
        store.store(&failed("1", "connect", "alice", 1)).await.unwrap();
        store.store(&failed("2", "call_tool", "alice", 2)).await.unwrap();
        store.store(&failed("3", "call_tool", "bob", 3)).await.unwrap();
        store.store(&failed("4", "call_tool", "alice", 4)).await.unwrap();

        let ids = |ops: Vec<FailedOperation>| ops.into_iter().map(|o| o.id).collect::<Vec<_>>();
        assert_eq!(ids(store.by_operation_kind("call_tool", 10).await.unwrap()), ["4", "3", "2"]);
        assert_eq!(ids(store.by_operation_kind("call_tool", 1).await.unwrap()), ["4"]);
        assert_eq!(ids(store.by_client_id("alice", 10).await.unwrap()), ["4", "2", "1"]);
        assert!(store.by_client_id("carol", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn filtered_listing_pages_past_non_matching_entries() {
        let (store, _) = store_at(10 * DAY_MS);
        store.store(&failed("old", "connect", "c", 1)).await.unwrap();
        for i in 0..200u64 {
            store.store(&failed(&format!("n{i}"), "call_tool", "c", 10 + i)).await.unwrap();
        }
        let found = store.by_operation_kind("connect", 5).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "old");
    }

    /// Backend that stores one extra, newer record right after the first index read.
    #[derive(Debug)]
    struct InsertAfterFirstRead {
        inner: MemoryBackend,
        pending: parking_lot::Mutex<Option<FailedOperation>>,
    }

    #[async_trait::async_trait]
    impl DeadLetterBackend for InsertAfterFirstRead {
        async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), BackendError> {
            self.inner.set(key, value, ttl).await
        }

        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
            self.inner.get(key).await
        }

        async fn delete(&self, key: &str) -> Result<bool, BackendError> {
            self.inner.delete(key).await
        }

        async fn index_insert(&self, index: &str, member: &str, score: i64) -> Result<(), BackendError> {
            self.inner.index_insert(index, member, score).await
        }

        async fn index_remove(&self, index: &str, member: &str) -> Result<bool, BackendError> {
            self.inner.index_remove(index, member).await
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
            let page = self.inner.index_range_by_score(index, min, max, order, offset, limit).await?;
            let late = self.pending.lock().take();
            if let Some(op) = late {
                let key = format!("{}{}", DeadLetterConfig::default().key_prefix(), op.id);
                let bytes = serde_json::to_vec(&op).expect("encode");
                self.inner.set(&key, bytes, None).await?;
                self.inner.index_insert(index, &op.id, op.last_attempt as i64).await?;
            }
            Ok(page)
        }

        async fn index_len(&self, index: &str) -> Result<usize, BackendError> {
            self.inner.index_len(index).await
        }
    }

    #[tokio::test]
    async fn listing_is_stable_when_records_arrive_between_pages() {
        let backend = Arc::new(InsertAfterFirstRead {
            inner: MemoryBackend::new(),
            pending: parking_lot::Mutex::new(None),
        });
        let store = DeadLetterStore::new(backend.clone(), DeadLetterConfig::default());
        for i in 0..150u64 {
            let kind = if i % 2 == 0 { "call_tool" } else { "connect" };
            store.store(&failed(&format!("n{i:03}"), kind, "alice", 10 + i)).await.unwrap();
        }
        *backend.pending.lock() = Some(failed("late", "call_tool", "alice", 10_000));

        let ids: Vec<String> =
            store.by_operation_kind("call_tool", 70).await.unwrap().into_iter().map(|o| o.id).collect();
        let expected: Vec<String> =
            (0..150u64).rev().filter(|i| i % 2 == 0).take(70).map(|i| format!("n{i:03}")).collect();
        assert_eq!(ids, expected, "no record repeated or skipped across pages");

        *backend.pending.lock() = Some(failed("early", "connect", "bob", 0));
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total, 151);
        assert_eq!(stats.by_kind.get("call_tool"), Some(&76));
        assert_eq!(stats.by_kind.get("connect"), Some(&75));
    }

    #[tokio::test]
    async fn listing_pages_through_equal_scores() {
        let (store, _) = store_at(10 * DAY_MS);
        for i in 0..100u64 {
            store.store(&failed(&format!("t{i:03}"), "call_tool", "c", 5)).await.unwrap();
        }
        store.store(&failed("older", "call_tool", "c", 1)).await.unwrap();

        let ids: Vec<String> = store.list(200).await.unwrap().into_iter().map(|o| o.id).collect();
        assert_eq!(ids.len(), 101);
        assert_eq!(ids.last().map(String::as_str), Some("older"));
        let unique: std::collections::HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), 101);
    }

    #[tokio::test]
    async fn delete_removes_record_and_index_entry() {
        let (store, _) = store_at(10 * DAY_MS);
        store.store(&failed("a", "connect", "c", 1)).await.unwrap();
        assert!(store.delete("a").await.unwrap());
        assert!(!store.delete("a").await.unwrap());
        assert!(store.is_empty().await.unwrap());
        assert!(matches!(store.get("a").await, Err(DeadLetterError::NotFound(_))));
    }

    #[tokio::test]
    async fn cleanup_removes_only_entries_older_than_cutoff() {
        let now = 10 * DAY_MS;
        let (store, _) = store_at(now);
        store.store(&failed("ancient", "connect", "c", now - 3 * DAY_MS)).await.unwrap();
        store.store(&failed("edge", "connect", "c", now - DAY_MS)).await.unwrap();
        store.store(&failed("fresh", "connect", "c", now - 1_000)).await.unwrap();

        let removed = store.cleanup(Duration::from_millis(DAY_MS)).await.unwrap();
        assert_eq!(removed, 1);
        let left: Vec<_> = store.list(10).await.unwrap().into_iter().map(|o| o.id).collect();
        assert_eq!(left, ["fresh", "edge"]);
    }

    #[tokio::test]
    async fn stats_aggregate_counts_and_bounds() {
        let (store, _) = store_at(10 * DAY_MS);
        assert_eq!(store.stats().await.unwrap(), DeadLetterStats::default());

        store.store(&failed("1", "connect", "c", 300)).await.unwrap();
        store.store(&failed("2", "call_tool", "c", 100)).await.unwrap();
        store.store(&failed("3", "call_tool", "c", 200)).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_kind.get("call_tool"), Some(&2));
        assert_eq!(stats.by_kind.get("connect"), Some(&1));
        assert_eq!(stats.oldest, Some(100));
        assert_eq!(stats.newest, Some(300));
    }

    #[tokio::test]
    async fn expired_records_vanish_and_index_is_pruned() {
        let start = 10 * DAY_MS;
        let (store, clock) = store_at(start);
        store.store(&failed("a", "connect", "c", start)).await.unwrap();
        clock.advance(DEFAULT_TTL.as_millis() as u64 - 1);
        store.store(&failed("b", "connect", "c", clock.now_millis())).await.unwrap();

        clock.advance(1);
        assert!(store.get("a").await.is_err());
        assert_eq!(store.len().await.unwrap(), 2, "index still holds the expired id");

        let ids: Vec<_> = store.list(10).await.unwrap().into_iter().map(|o| o.id).collect();
        assert_eq!(ids, ["b"]);
        assert_eq!(store.len().await.unwrap(), 1);
        assert_eq!(store.stats().await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn custom_key_layout_isolates_stores() {
        let backend: Arc<dyn DeadLetterBackend> = Arc::new(MemoryBackend::new());
        let a = DeadLetterStore::new(backend.clone(), DeadLetterConfig::default());
        let b = DeadLetterStore::new(
            backend,
            DeadLetterConfig::default().with_key_prefix("other:op:").with_index_key("other:index"),
        );
        a.store(&failed("x", "connect", "c", 1)).await.unwrap();
        assert_eq!(a.len().await.unwrap(), 1);
        assert!(b.is_empty().await.unwrap());
        assert!(b.get("x").await.is_err());
        assert_eq!(b.config().index_key(), "other:index");
    }

    #[test]
    fn ids_are_unique_within_a_millisecond() {
        let (store, _) = store_at(42);
        let a = store.next_id("call_tool", "c1");
        let b = store.next_id("call_tool", "c1");
        assert_ne!(a, b);
        assert!(a.starts_with("call_tool:c1:42-"));
    }
}
