//! SQLite-Backed Storage
//!
//! The relational engine maps the capability set onto four parameterised
//! statements. Concurrency and durability are whatever SQLite provides;
//! this module only adapts calls and rows.
//!
//! ## Schema
//!
//! ```text
//! gokeyval
//! ┌───────────────────┬────────────────┐
//! │ key TEXT PK       │ value TEXT     │
//! └───────────────────┴────────────────┘
//! ```
//!
//! The file is created by the open call if it does not exist and the table
//! is created with `IF NOT EXISTS`, which SQLite executes atomically. A busy
//! timeout lets concurrent first start-ups queue on the database lock
//! instead of failing.

use crate::storage::{OpContext, Record, Storage, StorageError, StorageResult};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS gokeyval (
    key   TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);
";

const SEARCH_SQL: &str = "SELECT value FROM gokeyval WHERE key = ?1";

const UPSERT_SQL: &str = "
INSERT INTO gokeyval (key, value) VALUES (?1, ?2)
ON CONFLICT(key) DO UPDATE SET value = excluded.value
";

const DELETE_SQL: &str = "DELETE FROM gokeyval WHERE key = ?1";

const SELECT_ALL_SQL: &str = "SELECT key, value FROM gokeyval";

const COUNT_SQL: &str = "SELECT COUNT(*) FROM gokeyval";

/// How long a statement waits on a locked database.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Rows an export reads between cancellation checks.
const CANCEL_CHECK_INTERVAL: usize = 1024;

/// Storage engine backed by a SQLite database file.
///
/// Statements are prepared once and kept in the connection's statement
/// cache; every call reuses them with new parameters.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for SqliteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStorage")
            .field("path", &self.path)
            .finish()
    }
}

impl SqliteStorage {
    /// Opens (creating if needed) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        let storage = Self::init(conn, Some(path.to_path_buf()))?;
        info!(path = %path.display(), "SQLite storage opened");
        Ok(storage)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> StorageResult<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA_SQL)?;

        // Prepare up front so a broken schema fails at start-up, not on first use
        for sql in [SEARCH_SQL, UPSERT_SQL, DELETE_SQL, SELECT_ALL_SQL] {
            conn.prepare_cached(sql)?;
        }

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Database file, `None` for in-memory databases.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Locks the connection once the context allows it.
    fn connection(&self, ctx: &OpContext) -> StorageResult<MutexGuard<'_, Connection>> {
        ctx.check()?;
        let conn = self
            .conn
            .lock()
            .map_err(|_| StorageError::LockPoisoned("sqlite connection"))?;
        // The lock may have been contended past the deadline
        ctx.check()?;
        Ok(conn)
    }
}

impl Storage for SqliteStorage {
    fn search(&self, ctx: &OpContext, key: &str) -> StorageResult<String> {
        let conn = self.connection(ctx)?;
        let mut stmt = conn.prepare_cached(SEARCH_SQL)?;
        let value = stmt
            .query_row(params![key], |row| row.get::<_, String>(0))
            .optional()?;
        Ok(value.unwrap_or_default())
    }

    fn insert(&self, ctx: &OpContext, key: &str, value: &str) -> StorageResult<bool> {
        let conn = self.connection(ctx)?;
        let mut stmt = conn.prepare_cached(UPSERT_SQL)?;
        let changed = stmt.execute(params![key, value])?;
        Ok(changed > 0)
    }

    fn delete(&self, ctx: &OpContext, key: &str) -> StorageResult<bool> {
        let conn = self.connection(ctx)?;
        let mut stmt = conn.prepare_cached(DELETE_SQL)?;
        let removed = stmt.execute(params![key])?;
        Ok(removed > 0)
    }

    fn export(&self, ctx: &OpContext) -> StorageResult<Vec<Record>> {
        let conn = self.connection(ctx)?;
        let mut stmt = conn.prepare_cached(SELECT_ALL_SQL)?;
        let rows = stmt.query_map([], |row| {
            Ok(Record {
                key: row.get(0)?,
                value: row.get(1)?,
            })
        })?;

        let mut records = Vec::new();
        for (index, row) in rows.enumerate() {
            if index % CANCEL_CHECK_INTERVAL == 0 {
                ctx.check()?;
            }
            records.push(row?);
        }

        debug!(records = records.len(), "SQLite storage exported");
        Ok(records)
    }

    fn len(&self) -> StorageResult<usize> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| StorageError::LockPoisoned("sqlite connection"))?;
        let count: i64 = conn.query_row(COUNT_SQL, [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}
