//! # agentkit-store
//!
//! Storage engine for agentkit.
//!
//! Provides a pluggable two-level key/value [`StorageBackend`] (in-memory or
//! SQLite in WAL mode) and two memory layers built on top of it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  WorkingMemory   (ttl, lazy expiry)     │
//! │  LongTermMemory  (access count, forget) │
//! ├─────────────────────────────────────────┤
//! │  StorageBackend                         │
//! │    InMemoryStorage (DashMap)            │
//! │    SqliteStorage   (rusqlite WAL)       │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use std::{sync::Arc, time::Duration};
//! use agentkit_store::{InMemoryStorage, Memory, WorkingMemory};
//!
//! let working = WorkingMemory::new(Arc::new(InMemoryStorage::new()))
//!     .with_default_ttl(Duration::from_secs(60));
//! working.add("scratch", "last_query", serde_json::json!("weather")).await?;
//! ```

pub mod error;
pub mod memory;
pub mod sqlite;
pub mod storage;

// ── re-exports ───────────────────────────────────────────────────────

pub use error::{StoreError, StoreResult};
pub use memory::{
    Embedder, LongTermMemory, LongTermRecord, Memory, SearchHit, WorkingMemory, WorkingRecord,
    importance_score,
};
pub use sqlite::SqliteStorage;
pub use storage::{InMemoryStorage, StorageBackend};
