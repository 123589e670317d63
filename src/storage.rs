//! SQLite persistence shared by the domain tracker, agent registry, and
//! audit ledger.
//!
//! A single connection is guarded by a mutex. Every table is created by an
//! idempotent migration when the database is opened, so opening an existing
//! data directory is always safe.

use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// File name of the database inside the data directory.
pub const DATABASE_FILE: &str = "rashomon.db";

/// Errors raised by the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Could not open or create the database file.
    #[error("Failed to open database {path}: {source}")]
    Open {
        /// Path of the database file.
        path: PathBuf,
        /// Underlying SQLite error.
        source: rusqlite::Error,
    },

    /// A query failed.
    #[error("Database query failed: {0}")]
    Query(#[from] rusqlite::Error),

    /// A stored value could not be decoded.
    #[error("Corrupt stored value in {column}: {message}")]
    Corrupt {
        /// Column holding the bad value.
        column: &'static str,
        /// What was wrong with it.
        message: String,
    },
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS domains (
        domain          TEXT PRIMARY KEY,
        status          TEXT NOT NULL,
        added_by        TEXT NOT NULL,
        first_seen      TEXT NOT NULL,
        last_seen       TEXT NOT NULL,
        total_contacts  INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_domains_status ON domains(status);

    CREATE TABLE IF NOT EXISTS agents (
        id                TEXT PRIMARY KEY,
        name              TEXT NOT NULL,
        process_name      TEXT NOT NULL,
        process_path      TEXT,
        pid               INTEGER,
        declared_purpose  TEXT,
        status            TEXT NOT NULL,
        matched_profile   TEXT,
        detected_at       TEXT NOT NULL,
        total_requests    INTEGER NOT NULL DEFAULT 0,
        blocked_requests  INTEGER NOT NULL DEFAULT 0,
        threat_score      INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS audit_log (
        seq            INTEGER PRIMARY KEY AUTOINCREMENT,
        id             TEXT NOT NULL UNIQUE,
        timestamp      TEXT NOT NULL,
        event_type     TEXT NOT NULL,
        agent_id       TEXT,
        request_id     TEXT,
        decision       TEXT,
        details        TEXT NOT NULL,
        previous_hash  TEXT NOT NULL,
        receipt_hash   TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp);
    CREATE INDEX IF NOT EXISTS idx_audit_agent ON audit_log(agent_id);
";

/// Mutex-guarded SQLite connection.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database file and run migrations.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let conn = Connection::open(path).map_err(|source| StorageError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        debug!(path = %path.display(), "Opened database");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open the database inside a data directory.
    pub fn open_in_dir(data_dir: &Path) -> StorageResult<Self> {
        Self::open(&data_dir.join(DATABASE_FILE))
    }

    /// Open a private in-memory database (for tests and dry runs).
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run `f` with exclusive access to the connection.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let mut conn = self.conn.lock();
        f(&mut conn)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}
