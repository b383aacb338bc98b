//! Storage backend contract and the in-memory implementation.
//!
//! A [`StorageBackend`] is a two-level key/value store: arbitrary string
//! *categories* (namespaces) each hold string keys mapping to JSON values.
//! The memory layers in [`crate::memory`] implement their policies (expiry,
//! access counting, forgetting) on top of any backend.

use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

use crate::error::StoreResult;

/// Key/category persistence backend.
///
/// Every method is a potential suspension point.  Implementations must be
/// safe to share across tasks.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Insert or replace `category/key`.
    async fn store(&self, category: &str, key: &str, value: Value) -> StoreResult<()>;

    /// Fetch `category/key`, or `None` if absent.
    async fn retrieve(&self, category: &str, key: &str) -> StoreResult<Option<Value>>;

    /// Remove `category/key`.  Returns whether it existed.
    async fn delete(&self, category: &str, key: &str) -> StoreResult<bool>;

    /// Keys in `category`, sorted.  Unknown categories yield an empty list.
    async fn list_keys(&self, category: &str) -> StoreResult<Vec<String>>;

    /// Non-empty categories, sorted.
    async fn list_categories(&self) -> StoreResult<Vec<String>>;

    /// Clear one category, or everything when `category` is `None`.
    async fn clear(&self, category: Option<&str>) -> StoreResult<()>;
}

// ═══════════════════════════════════════════════════════════════════════
//  InMemoryStorage
// ═══════════════════════════════════════════════════════════════════════

/// Process-local backend.  Contents are lost when the process exits.
///
/// Each category lives behind its own [`DashMap`] shard lock, so concurrent
/// writers to different categories never contend.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    categories: DashMap<String, HashMap<String, Value>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of entries across all categories.
    pub fn len(&self) -> usize {
        self.categories.iter().map(|c| c.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StorageBackend for InMemoryStorage {
    async fn store(&self, category: &str, key: &str, value: Value) -> StoreResult<()> {
        self.categories
            .entry(category.to_owned())
            .or_default()
            .insert(key.to_owned(), value);
        Ok(())
    }

    async fn retrieve(&self, category: &str, key: &str) -> StoreResult<Option<Value>> {
        Ok(self
            .categories
            .get(category)
            .and_then(|entries| entries.get(key).cloned()))
    }

    async fn delete(&self, category: &str, key: &str) -> StoreResult<bool> {
        let removed = self
            .categories
            .get_mut(category)
            .map(|mut entries| entries.remove(key).is_some())
            .unwrap_or(false);
        // Drop emptied categories so `list_categories` stays accurate.
        self.categories.remove_if(category, |_, entries| entries.is_empty());
        Ok(removed)
    }

    async fn list_keys(&self, category: &str) -> StoreResult<Vec<String>> {
        let mut keys: Vec<String> = self
            .categories
            .get(category)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        Ok(keys)
    }

    async fn list_categories(&self) -> StoreResult<Vec<String>> {
        let mut names: Vec<String> = self
            .categories
            .iter()
            .filter(|c| !c.value().is_empty())
            .map(|c| c.key().clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn clear(&self, category: Option<&str>) -> StoreResult<()> {
        match category {
            Some(name) => {
                debug!(category = %name, "in_memory_storage.clear");
                self.categories.remove(name);
            }
            None => {
                debug!("in_memory_storage.clear_all");
                self.categories.clear();
            }
        }
        Ok(())
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn store_and_retrieve() {
        let storage = InMemoryStorage::new();
        storage.store("facts", "sky", json!("blue")).await.unwrap();

        assert_eq!(
            storage.retrieve("facts", "sky").await.unwrap(),
            Some(json!("blue"))
        );
        assert_eq!(storage.retrieve("facts", "grass").await.unwrap(), None);
        assert_eq!(storage.retrieve("other", "sky").await.unwrap(), None);
    }

    #[tokio::test]
    async fn keys_are_scoped_by_category() {
        let storage = InMemoryStorage::new();
        storage.store("a", "k", json!(1)).await.unwrap();
        storage.store("b", "k", json!(2)).await.unwrap();

        assert_eq!(storage.retrieve("a", "k").await.unwrap(), Some(json!(1)));
        assert_eq!(storage.retrieve("b", "k").await.unwrap(), Some(json!(2)));
        assert_eq!(storage.len(), 2);
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let storage = InMemoryStorage::new();
        storage.store("a", "k", json!(1)).await.unwrap();

        assert!(storage.delete("a", "k").await.unwrap());
        assert!(!storage.delete("a", "k").await.unwrap());
        assert!(storage.list_categories().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn listing_is_sorted() {
        let storage = InMemoryStorage::new();
        storage.store("z", "2", json!(null)).await.unwrap();
        storage.store("z", "1", json!(null)).await.unwrap();
        storage.store("m", "x", json!(null)).await.unwrap();

        assert_eq!(storage.list_keys("z").await.unwrap(), vec!["1", "2"]);
        assert_eq!(storage.list_categories().await.unwrap(), vec!["m", "z"]);
        assert!(storage.list_keys("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn clear_one_or_all() {
        let storage = InMemoryStorage::new();
        storage.store("a", "k", json!(1)).await.unwrap();
        storage.store("b", "k", json!(2)).await.unwrap();

        storage.clear(Some("a")).await.unwrap();
        assert_eq!(storage.list_categories().await.unwrap(), vec!["b"]);

        storage.clear(None).await.unwrap();
        assert!(storage.is_empty());
    }
}
