//! The SQLite pool shared by the CRM record store and the history
//! checkpoint store.
//!
//! Tool handlers and checkpoint writes both borrow connections from one
//! `r2d2` pool inside `spawn_blocking` tasks. Tool lookups are mostly reads
//! and checkpoints are short writes, so WAL journaling plus a busy timeout
//! lets them share one file without `SQLITE_BUSY` surfacing to a live call.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};
use thiserror::Error;

/// Path that selects a private in-memory database.
pub const IN_MEMORY: &str = ":memory:";

/// Connection tunables, filled from the `[database]` config section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbRuntimeSettings {
    /// How long a writer waits on a locked database, in milliseconds.
    pub busy_timeout_ms: u64,
    /// Upper bound on pooled connections. Forced to 1 for [`IN_MEMORY`].
    pub pool_max_size: u32,
}

impl Default for DbRuntimeSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            pool_max_size: 8,
        }
    }
}

pub type DbPool = Pool<SqliteConnectionManager>;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to create database connection pool: {0}")]
    PoolInit(#[from] r2d2::Error),
}

/// Opens the pool behind the record and history stores.
///
/// Each connection opened on `:memory:` gets its own empty database, so an
/// in-memory pool is held to a single connection. That keeps the schema
/// applied by `run_migrations` visible to every later checkout.
pub fn create_pool(db_path: &str, settings: DbRuntimeSettings) -> Result<DbPool, PoolError> {
    let max_size = if db_path == IN_MEMORY {
        1
    } else {
        settings.pool_max_size
    };
    let busy_timeout_ms = settings.busy_timeout_ms;

    let manager = SqliteConnectionManager::file(db_path)
        .with_flags(
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )
        .with_init(move |conn| configure(conn, busy_timeout_ms));

    let pool = Pool::builder().max_size(max_size).build(manager)?;
    tracing::debug!(path = db_path, max_size, busy_timeout_ms, "store pool ready");
    Ok(pool)
}

fn configure(conn: &mut Connection, busy_timeout_ms: u64) -> Result<(), rusqlite::Error> {
    let journal_mode: String = conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
    // In-memory databases answer "memory".
    if !matches!(journal_mode.as_str(), "wal" | "memory") {
        return Err(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
            Some(format!("store refused WAL journal mode, got: {journal_mode}")),
        ));
    }
    // HCPs reference their HCO; checkpoint steps cascade from their invocation.
    conn.pragma_update(None, "foreign_keys", true)?;
    conn.busy_timeout(std::time::Duration::from_millis(busy_timeout_ms))
}
