//! Memory layers over a [`StorageBackend`].
//!
//! | Layer      | Policy                                   | Eviction              |
//! |------------|------------------------------------------|-----------------------|
//! | Working    | entries carry a write timestamp + ttl    | lazily, on read       |
//! | Long-term  | entries carry `added_at` + access count  | explicit [`LongTermMemory::forget`] |
//!
//! Both layers wrap the caller's value in a small JSON envelope before
//! handing it to the backend, so any backend (in-memory, SQLite, …) can hold
//! either layer.  Neither layer runs a background sweep.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::error::{StoreError, StoreResult};
use crate::storage::StorageBackend;

/// Relevance of a case-insensitive key match.
pub const KEY_MATCH_RELEVANCE: f64 = 0.8;

/// Relevance of a case-insensitive match inside the stringified value.
pub const VALUE_MATCH_RELEVANCE: f64 = 0.5;

/// One search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub category: String,
    pub key: String,
    pub value: Value,
    pub relevance: f64,
}

/// Common interface of the memory layers.
#[async_trait]
pub trait Memory: Send + Sync {
    /// Insert or replace `category/key`.
    async fn add(&self, category: &str, key: &str, value: Value) -> StoreResult<()>;

    /// Fetch a live value.
    async fn get(&self, category: &str, key: &str) -> StoreResult<Option<Value>>;

    /// Remove an entry.  Returns whether it existed.
    async fn remove(&self, category: &str, key: &str) -> StoreResult<bool>;

    /// Find entries related to `query`, most relevant first.
    async fn search(
        &self,
        query: &str,
        category: Option<&str>,
        limit: Option<usize>,
    ) -> StoreResult<Vec<SearchHit>>;

    /// Clear one category, or everything.
    async fn clear(&self, category: Option<&str>) -> StoreResult<()>;
}

// ═══════════════════════════════════════════════════════════════════════
//  Shared helpers
// ═══════════════════════════════════════════════════════════════════════

/// Substring relevance: key match beats value match, no match is `None`.
fn substring_relevance(query_lower: &str, key: &str, value: &Value) -> Option<f64> {
    if key.to_lowercase().contains(query_lower) {
        return Some(KEY_MATCH_RELEVANCE);
    }
    let text = match value {
        Value::String(s) => s.to_lowercase(),
        other => other.to_string().to_lowercase(),
    };
    text.contains(query_lower).then_some(VALUE_MATCH_RELEVANCE)
}

fn sort_and_truncate(hits: &mut Vec<SearchHit>, limit: Option<usize>) {
    hits.sort_by(|a, b| {
        b.relevance
            .partial_cmp(&a.relevance)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.category.cmp(&b.category))
            .then_with(|| a.key.cmp(&b.key))
    });
    if let Some(limit) = limit {
        hits.truncate(limit);
    }
}

async fn target_categories(
    storage: &dyn StorageBackend,
    category: Option<&str>,
) -> StoreResult<Vec<String>> {
    match category {
        Some(name) => Ok(vec![name.to_owned()]),
        None => storage.list_categories().await,
    }
}

fn decode<T: for<'de> Deserialize<'de>>(category: &str, key: &str, raw: Value) -> StoreResult<T> {
    serde_json::from_value(raw).map_err(|e| StoreError::CorruptRecord {
        category: category.to_owned(),
        key: key.to_owned(),
        reason: e.to_string(),
    })
}

// ═══════════════════════════════════════════════════════════════════════
//  Working memory
// ═══════════════════════════════════════════════════════════════════════

/// Envelope stored by [`WorkingMemory`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkingRecord {
    pub value: Value,
    pub timestamp: DateTime<Utc>,
    /// Time-to-live in milliseconds; `None` never expires.
    #[serde(default)]
    pub ttl_ms: Option<u64>,
}

impl WorkingRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.ttl_ms {
            Some(ttl) => {
                now.signed_duration_since(self.timestamp).num_milliseconds()
                    > i64::try_from(ttl).unwrap_or(i64::MAX)
            }
            None => false,
        }
    }
}

/// Short-lived key/value memory with per-entry expiry.
///
/// Expiry is checked only when an entry is read (`get`, `search`); an
/// expired entry is deleted from the backend at that moment.
#[derive(Clone)]
pub struct WorkingMemory {
    storage: Arc<dyn StorageBackend>,
    default_ttl: Option<Duration>,
}

impl WorkingMemory {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage,
            default_ttl: None,
        }
    }

    /// Apply `ttl` to entries added without an explicit one.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl
    }

    /// Insert with an explicit ttl (falls back to the instance default).
    #[instrument(skip(self, value))]
    pub async fn add_with_ttl(
        &self,
        category: &str,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> StoreResult<()> {
        let ttl_ms = ttl
            .or(self.default_ttl)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        let record = WorkingRecord {
            value,
            timestamp: Utc::now(),
            ttl_ms,
        };
        debug!("working_memory.add");
        self.storage
            .store(category, key, serde_json::to_value(record)?)
            .await
    }

    /// Read a live record, deleting it if it has expired.
    async fn live_record(&self, category: &str, key: &str) -> StoreResult<Option<WorkingRecord>> {
        let Some(raw) = self.storage.retrieve(category, key).await? else {
            return Ok(None);
        };
        let record: WorkingRecord = decode(category, key, raw)?;
        if record.is_expired_at(Utc::now()) {
            debug!(category = %category, key = %key, "working_memory entry expired");
            self.storage.delete(category, key).await?;
            return Ok(None);
        }
        Ok(Some(record))
    }
}

#[async_trait]
impl Memory for WorkingMemory {
    async fn add(&self, category: &str, key: &str, value: Value) -> StoreResult<()> {
        self.add_with_ttl(category, key, value, None).await
    }

    async fn get(&self, category: &str, key: &str) -> StoreResult<Option<Value>> {
        Ok(self.live_record(category, key).await?.map(|r| r.value))
    }

    async fn remove(&self, category: &str, key: &str) -> StoreResult<bool> {
        self.storage.delete(category, key).await
    }

    async fn search(
        &self,
        query: &str,
        category: Option<&str>,
        limit: Option<usize>,
    ) -> StoreResult<Vec<SearchHit>> {
        let query_lower = query.to_lowercase();
        let mut hits = Vec::new();

        for cat in target_categories(self.storage.as_ref(), category).await? {
            for key in self.storage.list_keys(&cat).await? {
                let Some(record) = self.live_record(&cat, &key).await? else {
                    continue;
                };
                if let Some(relevance) = substring_relevance(&query_lower, &key, &record.value) {
                    hits.push(SearchHit {
                        category: cat.clone(),
                        key,
                        value: record.value,
                        relevance,
                    });
                }
            }
        }

        sort_and_truncate(&mut hits, limit);
        Ok(hits)
    }

    async fn clear(&self, category: Option<&str>) -> StoreResult<()> {
        self.storage.clear(category).await
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Long-term memory
// ═══════════════════════════════════════════════════════════════════════

/// Produces vector embeddings for semantic search.
///
/// Without an embedder, [`LongTermMemory::search`] falls back to the
/// substring heuristic.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> StoreResult<Vec<f32>>;
}

/// Envelope stored by [`LongTermMemory`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LongTermRecord {
    pub value: Value,
    pub added_at: DateTime<Utc>,
    #[serde(default)]
    pub access_count: u64,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
}

impl LongTermRecord {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            added_at: Utc::now(),
            access_count: 0,
            embedding: None,
        }
    }

    /// Importance at `now`; see [`importance_score`].
    pub fn importance_at(&self, now: DateTime<Utc>) -> f64 {
        let age_ms = now.signed_duration_since(self.added_at).num_milliseconds().max(0);
        let age_days = age_ms as f64 / 86_400_000.0;
        importance_score(self.access_count, age_days)
    }
}

/// `min(1, access_count / 10 + 1 / (1 + age_days))`.
///
/// Frequently read entries and fresh entries score high; an untouched entry
/// decays towards zero with age.
pub fn importance_score(access_count: u64, age_days: f64) -> f64 {
    let frequency = access_count as f64 / 10.0;
    let recency = 1.0 / (1.0 + age_days.max(0.0));
    (frequency + recency).min(1.0)
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut na, mut nb) = (0.0_f64, 0.0_f64, 0.0_f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na.sqrt() * nb.sqrt())
    }
}

/// Persistent memory with access-frequency and age based forgetting.
///
/// Every `get` is also a write: it bumps and persists the entry's access
/// count.  All writes (`add`, `get`, `remove`, `clear`, `forget`,
/// `put_record`) are serialized by an internal lock, so a write never lands
/// between the read and write-back of a `get`.
#[derive(Clone)]
pub struct LongTermMemory {
    storage: Arc<dyn StorageBackend>,
    top_k: usize,
    embedder: Option<Arc<dyn Embedder>>,
    write_lock: Arc<Mutex<()>>,
}

impl LongTermMemory {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage,
            top_k: 5,
            embedder: None,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Cap on search results when the caller passes no limit.
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k.max(1);
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Read a record without counting it as an access.
    pub async fn peek(&self, category: &str, key: &str) -> StoreResult<Option<LongTermRecord>> {
        match self.storage.retrieve(category, key).await? {
            Some(raw) => Ok(Some(decode(category, key, raw)?)),
            None => Ok(None),
        }
    }

    /// Store a prepared record as-is (e.g. when importing an archive).
    pub async fn put_record(
        &self,
        category: &str,
        key: &str,
        record: LongTermRecord,
    ) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        self.write_record(category, key, record).await
    }

    /// Caller holds `write_lock`.
    async fn write_record(
        &self,
        category: &str,
        key: &str,
        record: LongTermRecord,
    ) -> StoreResult<()> {
        self.storage
            .store(category, key, serde_json::to_value(record)?)
            .await
    }

    /// Delete every entry whose importance is below `threshold`.
    ///
    /// Returns the number of entries removed.
    #[instrument(skip(self))]
    pub async fn forget(&self, threshold: f64) -> StoreResult<usize> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(StoreError::InvalidArgument(format!(
                "forget threshold must be within [0, 1], got {threshold}"
            )));
        }

        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let mut removed = 0;

        for category in self.storage.list_categories().await? {
            for key in self.storage.list_keys(&category).await? {
                let Some(record) = self.peek(&category, &key).await? else {
                    continue;
                };
                let importance = record.importance_at(now);
                if importance < threshold {
                    debug!(category = %category, key = %key, importance, "forgetting entry");
                    if self.storage.delete(&category, &key).await? {
                        removed += 1;
                    }
                }
            }
        }

        info!(removed, threshold, "long_term_memory.forget");
        Ok(removed)
    }

    fn embeddable_text(value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

#[async_trait]
impl Memory for LongTermMemory {
    async fn add(&self, category: &str, key: &str, value: Value) -> StoreResult<()> {
        let mut record = LongTermRecord::new(value);
        if let Some(embedder) = &self.embedder {
            record.embedding = Some(embedder.embed(&Self::embeddable_text(&record.value)).await?);
        }
        debug!(category = %category, key = %key, "long_term_memory.add");
        self.put_record(category, key, record).await
    }

    async fn get(&self, category: &str, key: &str) -> StoreResult<Option<Value>> {
        let _guard = self.write_lock.lock().await;
        let Some(mut record) = self.peek(category, key).await? else {
            return Ok(None);
        };
        record.access_count += 1;
        let value = record.value.clone();
        self.write_record(category, key, record).await?;
        Ok(Some(value))
    }

    async fn remove(&self, category: &str, key: &str) -> StoreResult<bool> {
        let _guard = self.write_lock.lock().await;
        self.storage.delete(category, key).await
    }

    async fn search(
        &self,
        query: &str,
        category: Option<&str>,
        limit: Option<usize>,
    ) -> StoreResult<Vec<SearchHit>> {
        let limit = Some(limit.unwrap_or(self.top_k));
        let query_embedding = match &self.embedder {
            Some(embedder) => Some(embedder.embed(query).await?),
            None => None,
        };
        let query_lower = query.to_lowercase();
        let mut hits = Vec::new();

        for cat in target_categories(self.storage.as_ref(), category).await? {
            for key in self.storage.list_keys(&cat).await? {
                let Some(record) = self.peek(&cat, &key).await? else {
                    continue;
                };

                let relevance = match (&query_embedding, &record.embedding) {
                    (Some(q), Some(e)) => {
                        let score = cosine_similarity(q, e);
                        (score > 0.0).then_some(score)
                    }
                    _ => substring_relevance(&query_lower, &key, &record.value),
                };

                if let Some(relevance) = relevance {
                    hits.push(SearchHit {
                        category: cat.clone(),
                        key,
                        value: record.value,
                        relevance,
                    });
                }
            }
        }

        sort_and_truncate(&mut hits, limit);
        Ok(hits)
    }

    async fn clear(&self, category: Option<&str>) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        self.storage.clear(category).await
    }
}

// ── tests ────────────────────────────────────────────────────────────
