//! Durable SQLite storage backend.
//!
//! [`SqliteStorage`] wraps a `rusqlite::Connection` behind an
//! `Arc<Mutex<>>` and runs every statement on the blocking thread pool via
//! `tokio::task::spawn_blocking`, so the async runtime is never stalled by
//! file I/O.  Values are stored as JSON text in a single
//! `memory_entries(category, key, value, updated_at)` table.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::storage::StorageBackend;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS memory_entries (
    category   TEXT    NOT NULL,
    key        TEXT    NOT NULL,
    value      TEXT    NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (category, key)
);
";

/// Thread-safe handle to a SQLite-backed store.
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open (or create) a database at `path`, apply pragmas and the schema.
    ///
    /// This call blocks briefly (file I/O), so call it during startup.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening sqlite storage");

        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Create an in-memory database, mostly for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        debug!("opening in-memory sqlite storage");
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        // WAL mode: concurrent readers, non-blocking writes.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        // Busy timeout so concurrent writers wait instead of failing immediately.
        conn.pragma_update(None, "busy_timeout", 5_000_i32)?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn execute<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|e| StoreError::TaskJoin(format!("mutex poisoned: {e}")))?;
            f(&conn)
        })
        .await?
    }
}

#[async_trait]
impl StorageBackend for SqliteStorage {
    async fn store(&self, category: &str, key: &str, value: Value) -> StoreResult<()> {
        let category = category.to_owned();
        let key = key.to_owned();
        let text = serde_json::to_string(&value)?;
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO memory_entries (category, key, value, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(category, key)
                 DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![category, key, text, Utc::now().timestamp_millis()],
            )?;
            Ok(())
        })
        .await
    }

    async fn retrieve(&self, category: &str, key: &str) -> StoreResult<Option<Value>> {
        let category = category.to_owned();
        let key = key.to_owned();
        let text: Option<String> = self
            .execute(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT value FROM memory_entries WHERE category = ?1 AND key = ?2",
                        params![category, key],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?;

        text.map(|t| serde_json::from_str(&t).map_err(StoreError::from))
            .transpose()
    }

    async fn delete(&self, category: &str, key: &str) -> StoreResult<bool> {
        let category = category.to_owned();
        let key = key.to_owned();
        self.execute(move |conn| {
            let n = conn.execute(
                "DELETE FROM memory_entries WHERE category = ?1 AND key = ?2",
                params![category, key],
            )?;
            Ok(n > 0)
        })
        .await
    }

    async fn list_keys(&self, category: &str) -> StoreResult<Vec<String>> {
        let category = category.to_owned();
        self.execute(move |conn| {
            let mut stmt =
                conn.prepare("SELECT key FROM memory_entries WHERE category = ?1 ORDER BY key")?;
            let keys = stmt
                .query_map(params![category], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(keys)
        })
        .await
    }

    async fn list_categories(&self) -> StoreResult<Vec<String>> {
        self.execute(|conn| {
            let mut stmt = conn
                .prepare("SELECT DISTINCT category FROM memory_entries ORDER BY category")?;
            let names = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(names)
        })
        .await
    }

    async fn clear(&self, category: Option<&str>) -> StoreResult<()> {
        let category = category.map(str::to_owned);
        self.execute(move |conn| {
            match category {
                Some(name) => {
                    conn.execute(
                        "DELETE FROM memory_entries WHERE category = ?1",
                        params![name],
                    )?;
                }
                None => {
                    conn.execute("DELETE FROM memory_entries", [])?;
                }
            }
            Ok(())
        })
        .await
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn crud_in_memory() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage
            .store("facts", "sky", json!({"color": "blue"}))
            .await
            .unwrap();
        storage
            .store("facts", "sky", json!({"color": "grey"}))
            .await
            .unwrap();

        assert_eq!(
            storage.retrieve("facts", "sky").await.unwrap(),
            Some(json!({"color": "grey"}))
        );
        assert!(storage.delete("facts", "sky").await.unwrap());
        assert!(!storage.delete("facts", "sky").await.unwrap());
        assert_eq!(storage.retrieve("facts", "sky").await.unwrap(), None);
    }

    #[tokio::test]
    async fn listing_and_clear() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage.store("b", "2", json!(2)).await.unwrap();
        storage.store("b", "1", json!(1)).await.unwrap();
        storage.store("a", "x", json!(0)).await.unwrap();

        assert_eq!(storage.list_keys("b").await.unwrap(), vec!["1", "2"]);
        assert_eq!(storage.list_categories().await.unwrap(), vec!["a", "b"]);

        storage.clear(Some("b")).await.unwrap();
        assert_eq!(storage.list_categories().await.unwrap(), vec!["a"]);

        storage.clear(None).await.unwrap();
        assert!(storage.list_categories().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.db");

        {
            let storage = SqliteStorage::open(&path).unwrap();
            storage.store("notes", "n1", json!("keep me")).await.unwrap();
        }

        let reopened = SqliteStorage::open(&path).unwrap();
        assert_eq!(
            reopened.retrieve("notes", "n1").await.unwrap(),
            Some(json!("keep me"))
        );
    }
}
