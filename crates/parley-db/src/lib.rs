//! Database layer for Parley.
//!
//! Provides SQLite connection pooling (via `r2d2`), WAL-mode initialization,
//! embedded SQL migrations, and the query helpers behind the two external
//! collaborators the speech engine talks to: the CRM record store and the
//! conversation history checkpoint store.
//!
//! All query helpers take a plain `&rusqlite::Connection`; callers decide
//! how to obtain one (pooled, in a `spawn_blocking` task, or in-memory for
//! tests).
//!
//! # Design decisions
//!
//! - **SQLite with WAL mode**: no external database process required. WAL
//!   mode allows concurrent readers with a single writer, which matches a
//!   workload of many tool lookups and occasional checkpoint writes.
//! - **Embedded migrations**: SQL files are compiled into the binary via
//!   `include_str!`, so the schema ships with the server.

pub mod history;
mod migrations;
mod pool;
pub mod records;

pub use history::HistoryStoreError;
pub use migrations::{run_migrations, MigrationError};
pub use pool::{create_pool, DbPool, DbRuntimeSettings, PoolError, IN_MEMORY};
pub use records::{CallRecord, FollowUpTask, HcpRecord, RecordError};
