//! Storage Engine Module
//!
//! This module provides the storage layer behind the dispatcher. Every
//! engine implements the same small capability set, so the rest of the
//! server never knows which one it is talking to.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Arc<dyn Storage>                           │
//! │     search · insert · delete · import · export              │
//! └───────────────┬─────────────────────────────┬───────────────┘
//!                 │                             │
//!                 ▼                             ▼
//! ┌───────────────────────────────┐ ┌───────────────────────────┐
//! │          HashTable            │ │       SqliteStorage       │
//! │ ┌────────┐┌────────┐┌───────┐ │ │  prepared statements over │
//! │ │Bucket 0││Bucket 1││...H-1 │ │ │  one SQLite connection    │
//! │ │RwLock  ││RwLock  ││RwLock │ │ │                           │
//! │ └────────┘└────────┘└───────┘ │ └───────────────────────────┘
//! └───────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Pluggable**: The engine is chosen once at start-up from a config string
//! - **Shared**: One engine instance is handed by reference to every connection
//! - **Cancellable**: Every call receives an [`OpContext`] and checks it
//!
//! ## Example
//!
//! ```
//! use keyval::storage::{HashTable, OpContext, Record, Storage};
//!
//! let table = HashTable::with_buckets(1021);
//! let ctx = OpContext::background();
//!
//! table.insert(&ctx, "name", "value1").unwrap();
//! assert_eq!(table.search(&ctx, "name").unwrap(), "value1");
//!
//! // Absent keys read back as the empty string
//! assert_eq!(table.search(&ctx, "missing").unwrap(), "");
//! ```

pub mod context;
pub mod hash_table;
pub mod sqlite;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

// Re-export commonly used types
pub use context::{CancelOnDrop, OpContext};
pub use hash_table::{HashTable, DEFAULT_BUCKETS};
pub use sqlite::SqliteStorage;

/// A key-value pair, the unit of import and export.
///
/// Serializes as `{"key": "...", "value": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Record {
    pub key: String,
    pub value: String,
}

impl Record {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Errors returned by storage engines.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The caller cancelled the operation
    #[error("operation canceled")]
    Cancelled,

    /// The operation's deadline passed before it finished
    #[error("operation deadline exceeded")]
    DeadlineExceeded,

    /// A thread panicked while holding an engine lock
    #[error("lock poisoned: {0}")]
    LockPoisoned(&'static str),

    /// The relational engine reported a failure
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// No storage kind was configured
    #[error("storage type is undefined")]
    KindUndefined,

    /// The configured storage kind is not recognised
    #[error("storage type is unknown: {0:?}")]
    UnknownKind(String),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// The capability set every storage engine provides.
///
/// Engines are shared by all connections at once, so every method takes
/// `&self` and implementations synchronise internally. Methods may block;
/// async callers run them on a blocking thread.
pub trait Storage: Send + Sync {
    /// Returns the value stored under `key`, or the empty string if absent.
    ///
    /// Absence and an empty value read back the same; neither is an error.
    fn search(&self, ctx: &OpContext, key: &str) -> StorageResult<String>;

    /// Creates or overwrites `key`. Returns whether a row was written.
    fn insert(&self, ctx: &OpContext, key: &str, value: &str) -> StorageResult<bool>;

    /// Removes `key`. Returns `false` without error if it was absent.
    fn delete(&self, ctx: &OpContext, key: &str) -> StorageResult<bool>;

    /// Applies `records` in order through [`Storage::insert`].
    ///
    /// Not transactional: on error, the records before the failing one stay
    /// applied and the rest are skipped.
    fn import(&self, ctx: &OpContext, records: &[Record]) -> StorageResult<bool> {
        for record in records {
            ctx.check()?;
            self.insert(ctx, &record.key, &record.value)?;
        }
        Ok(true)
    }

    /// Returns every record currently stored, in no particular order.
    fn export(&self, ctx: &OpContext) -> StorageResult<Vec<Record>>;

    /// Number of distinct keys.
    fn len(&self) -> StorageResult<usize>;

    fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Short engine name for logs.
    fn name(&self) -> &'static str;
}

/// Which engine to build, parsed from the configuration string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    /// In-process concurrent hash table (`"hash"`)
    Hash,
    /// SQLite-backed store (`"sqlite"`)
    Sqlite,
}

impl FromStr for StorageKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" => Err(StorageError::KindUndefined),
            "hash" => Ok(StorageKind::Hash),
            "sqlite" => Ok(StorageKind::Sqlite),
            other => Err(StorageError::UnknownKind(other.to_string())),
        }
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageKind::Hash => f.write_str("hash"),
            StorageKind::Sqlite => f.write_str("sqlite"),
        }
    }
}

/// Engine construction parameters.
#[derive(Debug, Clone)]
pub struct StorageOptions {
    pub kind: StorageKind,
    /// Database file for the SQLite engine
    pub db_path: PathBuf,
    /// Bucket count for the hash table
    pub buckets: usize,
    /// Load factor that triggers a hash table resize (`None` = fixed size)
    pub max_load_factor: Option<f64>,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            kind: StorageKind::Hash,
            db_path: PathBuf::from("default.db"),
            buckets: DEFAULT_BUCKETS,
            max_load_factor: None,
        }
    }
}

/// Builds the engine described by `options`.
///
/// Called once at start-up; the returned handle is cloned into every
/// connection.
pub fn open_storage(options: &StorageOptions) -> StorageResult<Arc<dyn Storage>> {
    let storage: Arc<dyn Storage> = match options.kind {
        StorageKind::Hash => {
            let table = match options.max_load_factor {
                Some(factor) => HashTable::with_max_load_factor(options.buckets, factor),
                None => HashTable::with_buckets(options.buckets),
            };
            Arc::new(table)
        }
        StorageKind::Sqlite => Arc::new(SqliteStorage::open(&options.db_path)?),
    };

    info!(engine = storage.name(), "Storage engine initialized");
    Ok(storage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_kind_from_str() {
        assert_eq!("hash".parse::<StorageKind>().unwrap(), StorageKind::Hash);
        assert_eq!("sqlite".parse::<StorageKind>().unwrap(), StorageKind::Sqlite);
        assert!(matches!(
            "".parse::<StorageKind>(),
            Err(StorageError::KindUndefined)
        ));
        assert!(matches!(
            "redis".parse::<StorageKind>(),
            Err(StorageError::UnknownKind(k)) if k == "redis"
        ));
    }

    #[test]
    fn test_record_json_shape() {
        let json = serde_json::to_string(&Record::new("a", "b")).unwrap();
        assert_eq!(json, r#"{"key":"a","value":"b"}"#);
    }

    #[test]
    fn test_open_hash_storage() {
        let options = StorageOptions {
            buckets: 101,
            ..StorageOptions::default()
        };
        let storage = open_storage(&options).unwrap();
        assert_eq!(storage.name(), "hash");
        assert!(storage.is_empty().unwrap());
    }

    #[test]
    fn test_open_sqlite_storage() {
        let dir = tempfile::tempdir().unwrap();
        let options = StorageOptions {
            kind: StorageKind::Sqlite,
            db_path: dir.path().join("store.db"),
            ..StorageOptions::default()
        };
        let storage = open_storage(&options).unwrap();
        assert_eq!(storage.name(), "sqlite");
        assert!(options.db_path.exists());
    }

    /// Engine that fails on one specific key.
    struct FailOn(HashTable, &'static str);

    impl Storage for FailOn {
        fn search(&self, ctx: &OpContext, key: &str) -> StorageResult<String> {
            self.0.search(ctx, key)
        }
        fn insert(&self, ctx: &OpContext, key: &str, value: &str) -> StorageResult<bool> {
            if key == self.1 {
                return Err(StorageError::LockPoisoned("test"));
            }
            self.0.insert(ctx, key, value)
        }
        fn delete(&self, ctx: &OpContext, key: &str) -> StorageResult<bool> {
            self.0.delete(ctx, key)
        }
        fn export(&self, ctx: &OpContext) -> StorageResult<Vec<Record>> {
            self.0.export(ctx)
        }
        fn len(&self) -> StorageResult<usize> {
            self.0.len()
        }
        fn name(&self) -> &'static str {
            "fail-on"
        }
    }

    #[test]
    fn test_import_stops_at_first_error_keeping_earlier_records() {
        let storage = FailOn(HashTable::with_buckets(31), "bad");
        let ctx = OpContext::background();
        let records = vec![
            Record::new("a", "1"),
            Record::new("bad", "2"),
            Record::new("c", "3"),
        ];

        assert!(storage.import(&ctx, &records).is_err());
        assert_eq!(storage.search(&ctx, "a").unwrap(), "1");
        assert_eq!(storage.search(&ctx, "c").unwrap(), "");
        assert_eq!(storage.len().unwrap(), 1);
    }
}
