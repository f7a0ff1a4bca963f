//! Metadata store: one SQLite table indexing the source tree, with
//! compare-and-swap state transitions and the queries behind prefetch,
//! eviction, and directory listing.

mod queries;

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;

/// WAL tuning pragmas. Use after PRAGMA journal_mode = WAL.
pub(crate) const WAL_PRAGMAS: &str = r#"
        PRAGMA synchronous = NORMAL;
        PRAGMA wal_autocheckpoint = 10000;
        PRAGMA journal_size_limit = 67108864;
        "#;

/// Schema for the filesystem table. The composite (state, last_access_ts)
/// index serves the eviction queries.
pub(crate) const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS filesystem (
    id INTEGER NOT NULL,
    parent_id INTEGER NOT NULL, -- the root entry has parent_id -1
    path TEXT NOT NULL,
    name TEXT NOT NULL,
    state INTEGER NOT NULL DEFAULT 0, -- 0 = no cached, 1 = caching, 2 = cached
    last_access_ts INTEGER,
    duration INTEGER, -- media seconds for regular files, else null
    st_mode INTEGER,
    st_ino INTEGER,
    st_dev INTEGER,
    st_nlink INTEGER,
    st_uid INTEGER,
    st_gid INTEGER,
    st_size INTEGER,
    st_atime INTEGER,
    st_ctime INTEGER,
    st_mtime INTEGER,
    PRIMARY KEY (id)
);
CREATE INDEX IF NOT EXISTS idx_filesystem_parent_id ON filesystem (parent_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_filesystem_path ON filesystem (path);
CREATE INDEX IF NOT EXISTS idx_filesystem_state_access ON filesystem (state, last_access_ts);
"#;

/// Replace statement covering every column of one entry.
pub(crate) const REPLACE_ENTRY_SQL: &str = "REPLACE INTO filesystem (
    id, parent_id, path, name, state, last_access_ts, duration,
    st_mode, st_ino, st_dev, st_nlink, st_uid, st_gid, st_size,
    st_atime, st_ctime, st_mtime
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)";

/// The metadata store. One connection, serialised by an internal mutex;
/// write operations run inside a transaction.
pub struct Store {
    conn: Mutex<Connection>,
}

/// Enable WAL and apply the schema to an open connection (idempotent).
fn apply_wal_and_schema(conn: &Connection, db_path: &Path) -> Result<()> {
    conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
        .with_context(|| format!("enable WAL at {}", db_path.display()))?;
    conn.execute_batch(WAL_PRAGMAS)
        .with_context(|| format!("set WAL pragmas at {}", db_path.display()))?;
    conn.execute_batch(SCHEMA)
        .with_context(|| format!("create schema at {}", db_path.display()))?;
    Ok(())
}

impl Store {
    /// Open or create the store at `path` and ensure schema + WAL.
    pub fn open(path: &Path) -> Result<Store> {
        let conn = Connection::open(path)
            .with_context(|| format!("open database at {}", path.display()))?;
        apply_wal_and_schema(&conn, path)?;
        Ok(Store {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory store with the same schema (no WAL pragmas needed).
    pub fn open_in_memory() -> Result<Store> {
        let conn = Connection::open_in_memory().context("open in-memory database")?;
        conn.execute_batch(SCHEMA).context("create schema")?;
        Ok(Store {
            conn: Mutex::new(conn),
        })
    }
}
