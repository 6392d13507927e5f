//! Storage layer
//!
//! SQLite with WAL. Single-writer discipline: every mutation goes through
//! the writer connection behind a mutex; reads use a second read connection.
//! Transient BUSY/LOCKED errors retry with exponential backoff up to a
//! bounded number of attempts.

mod federation;
mod graph;
mod memories;
mod migrations;
mod query;

pub use migrations::{apply_migrations, current_version, Migration, MIGRATIONS};
pub use query::escape_like;

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension};

/// Retry attempts for transient BUSY/LOCKED failures.
const BUSY_RETRIES: u32 = 5;

/// Initial backoff delay, doubled per retry.
const BUSY_BASE_DELAY: Duration = Duration::from_millis(50);

/// Storage error type.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying database error.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// Row not found.
    #[error("not found: {0}")]
    NotFound(String),
    /// Insert with empty content.
    #[error("memory content must not be empty")]
    EmptyContent,
    /// Still busy after the retry budget.
    #[error("database busy after {BUSY_RETRIES} retries")]
    Busy,
    /// UNIQUE or foreign-key violation.
    #[error("constraint violation: {0}")]
    Constraint(String),
    /// A writer panicked while holding the write lock.
    #[error("write lock poisoned")]
    LockPoisoned,
    /// Migration failure; fatal for the daemon.
    #[error("schema migration failed: {0}")]
    Migration(String),
    /// Filesystem error.
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
    /// Malformed caller input.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl StoreError {
    /// Stable error code for user-visible failures.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Database(_) => "DB_ERROR",
            StoreError::NotFound(_) => "NOT_FOUND",
            StoreError::EmptyContent => "EMPTY_CONTENT",
            StoreError::Busy => "DB_BUSY",
            StoreError::Constraint(_) => "CONSTRAINT",
            StoreError::LockPoisoned => "WRITE_LOCK_POISONED",
            StoreError::Migration(_) => "SCHEMA_MIGRATION_FAILED",
            StoreError::Io(_) => "IO",
            StoreError::InvalidInput(_) => "INVALID_INPUT",
        }
    }

    /// Whether retrying the operation can help.
    pub fn retryable(&self) -> bool {
        matches!(self, StoreError::Busy)
    }

    /// Whether the daemon should exit on this error.
    pub fn fatal(&self) -> bool {
        matches!(self, StoreError::Migration(_) | StoreError::LockPoisoned)
    }
}

/// Storage result type.
pub type Result<T> = std::result::Result<T, StoreError>;

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::DatabaseBusy
                || e.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

fn map_db_err(err: rusqlite::Error) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(e, msg)
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            StoreError::Constraint(msg.clone().unwrap_or_else(|| "constraint".to_string()))
        }
        _ => StoreError::Database(err),
    }
}

/// Join tags for storage (comma-separated).
pub(crate) fn join_tags(tags: &[String]) -> String {
    tags.join(",")
}

/// Split stored tags.
pub(crate) fn split_tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Aggregate counters for the daemon's startup log line.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    /// All rows including deleted.
    pub total_memories: i64,
    /// Non-deleted rows.
    pub live_memories: i64,
    /// Pinned live rows.
    pub pinned_memories: i64,
    /// Live counts per type.
    pub by_type: Vec<(String, i64)>,
    /// Known peers.
    pub peers: i64,
    /// Publish rules.
    pub publish_rules: i64,
    /// Quarantined received memories awaiting promotion.
    pub received_pending: i64,
    /// Latest computed Merkle root, hex.
    pub last_merkle_root: Option<String>,
}

/// SQLite-backed repository; the sole writer for all Signet state.
pub struct Store {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    path: PathBuf,
}

impl Store {
    /// Apply PRAGMAs to a connection.
    fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -64000;
             PRAGMA temp_store = MEMORY;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
    }

    /// Open (or create) the database at `path` and run pending migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let writer = Connection::open(&path)?;
        Self::configure_connection(&writer)?;

        #[cfg(unix)]
        if path.exists() {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600));
        }

        migrations::apply_migrations(&writer)
            .map_err(|e| StoreError::Migration(e.to_string()))?;

        let reader = Connection::open(&path)?;
        Self::configure_connection(&reader)?;

        Ok(Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            path,
        })
    }

    /// Database file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a read-only closure on the reader connection.
    pub(crate) fn read<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let conn = self.reader.lock().map_err(|_| StoreError::LockPoisoned)?;
        f(&conn).map_err(map_db_err)
    }

    /// Run a mutation on the writer connection, retrying transient
    /// BUSY/LOCKED failures with exponential backoff.
    pub(crate) fn write<T>(
        &self,
        mut f: impl FnMut(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let conn = self.writer.lock().map_err(|_| StoreError::LockPoisoned)?;
        let mut delay = BUSY_BASE_DELAY;
        for attempt in 0..BUSY_RETRIES {
            match f(&conn) {
                Ok(v) => return Ok(v),
                Err(e) if is_busy(&e) && attempt + 1 < BUSY_RETRIES => {
                    tracing::debug!(attempt, "database busy, backing off {:?}", delay);
                    std::thread::sleep(delay);
                    delay *= 2;
                }
                Err(e) => return Err(map_db_err(e)),
            }
        }
        Err(StoreError::Busy)
    }

    /// Run a multi-statement mutation inside one transaction, with the same
    /// busy retry discipline around the whole unit.
    pub(crate) fn write_tx<T>(
        &self,
        mut f: impl FnMut(&rusqlite::Transaction<'_>) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let mut conn = self.writer.lock().map_err(|_| StoreError::LockPoisoned)?;
        let mut delay = BUSY_BASE_DELAY;
        for attempt in 0..BUSY_RETRIES {
            let tx = conn.transaction().map_err(map_db_err)?;
            match f(&tx) {
                Ok(v) => match tx.commit() {
                    Ok(()) => return Ok(v),
                    Err(e) if is_busy(&e) && attempt + 1 < BUSY_RETRIES => {
                        std::thread::sleep(delay);
                        delay *= 2;
                    }
                    Err(e) => return Err(map_db_err(e)),
                },
                Err(e) if is_busy(&e) && attempt + 1 < BUSY_RETRIES => {
                    drop(tx);
                    std::thread::sleep(delay);
                    delay *= 2;
                }
                Err(e) => return Err(map_db_err(e)),
            }
        }
        Err(StoreError::Busy)
    }

    /// Aggregate counters.
    pub fn stats(&self) -> Result<StoreStats> {
        self.read(|conn| {
            let total_memories: i64 =
                conn.query_row("SELECT COUNT(*) FROM memories", [], |r| r.get(0))?;
            let live_memories: i64 = conn.query_row(
                "SELECT COUNT(*) FROM memories WHERE is_deleted = 0",
                [],
                |r| r.get(0),
            )?;
            let pinned_memories: i64 = conn.query_row(
                "SELECT COUNT(*) FROM memories WHERE is_deleted = 0 AND pinned = 1",
                [],
                |r| r.get(0),
            )?;

            let mut stmt = conn.prepare(
                "SELECT type, COUNT(*) FROM memories WHERE is_deleted = 0
                 GROUP BY type ORDER BY COUNT(*) DESC",
            )?;
            let by_type = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<(String, i64)>>>()?;

            let peers: i64 = conn.query_row("SELECT COUNT(*) FROM peers", [], |r| r.get(0))?;
            let publish_rules: i64 =
                conn.query_row("SELECT COUNT(*) FROM publish_rules", [], |r| r.get(0))?;
            let received_pending: i64 = conn.query_row(
                "SELECT COUNT(*) FROM received_memories WHERE promoted_memory_id IS NULL",
                [],
                |r| r.get(0),
            )?;
            let last_merkle_root: Option<String> = conn
                .query_row(
                    "SELECT root_hash FROM merkle_roots ORDER BY computed_at DESC LIMIT 1",
                    [],
                    |r| r.get(0),
                )
                .optional()?;

            Ok(StoreStats {
                total_memories,
                live_memories,
                pinned_memories,
                by_type,
                peers,
                publish_rules,
                received_pending,
                last_merkle_root,
            })
        })
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("path", &self.path).finish()
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::Store;
    use tempfile::TempDir;

    /// A store on a temp database, kept alive with its directory.
    pub(crate) fn temp_store() -> (Store, TempDir) {
        let dir = TempDir::new().expect("temp dir");
        let store = Store::open(dir.path().join("memories.db")).expect("open store");
        (store, dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_runs_migrations_and_stats_start_empty() {
        let (store, _dir) = test_util::temp_store();
        let stats = store.stats().unwrap();
        assert_eq!(stats.total_memories, 0);
        assert_eq!(stats.peers, 0);
        assert!(stats.last_merkle_root.is_none());
    }

    #[test]
    fn tag_join_split_roundtrip() {
        let tags = vec!["a".to_string(), "b".to_string()];
        assert_eq!(split_tags(&join_tags(&tags)), tags);
        assert!(split_tags("").is_empty());
        assert_eq!(split_tags("x, ,y"), vec!["x".to_string(), "y".to_string()]);
    }
}
