//! Schema for the Parley store, applied at server startup.
//!
//! - `000_init` writes the `schema_meta` marker.
//! - `001_crm` holds the HCO/HCP directory and logged calls that the CRM
//!   tools read and write.
//! - `002_history` holds conversation checkpoints: one session row, one
//!   invocation per engine run, and the closed history entries as steps.
//!
//! The SQL is compiled in with `include_str!`. `_parley_migrations` lists
//! the names already applied; anything missing runs in order, each inside
//! its own transaction together with its tracking row.

use std::collections::HashSet;

use rusqlite::Connection;
use thiserror::Error;

struct Migration {
    name: &'static str,
    sql: &'static str,
}

/// Append only. Applied names are never edited or reordered.
const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "000_init",
        sql: include_str!("migrations/000_init.sql"),
    },
    Migration {
        name: "001_crm",
        sql: include_str!("migrations/001_crm.sql"),
    },
    Migration {
        name: "002_history",
        sql: include_str!("migrations/002_history.sql"),
    },
];

const TRACKING_TABLE: &str = "CREATE TABLE IF NOT EXISTS _parley_migrations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);";

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("migration '{name}' failed: {source}")]
    ExecutionFailed {
        name: String,
        source: rusqlite::Error,
    },

    #[error("failed to read applied migrations: {0}")]
    StateQuery(rusqlite::Error),
}

/// Brings the CRM and history schema up to date. Returns how many
/// migrations ran; zero on an already current database.
pub fn run_migrations(conn: &Connection) -> Result<usize, MigrationError> {
    run_migrations_from_list(conn, MIGRATIONS)
}

fn run_migrations_from_list(
    conn: &Connection,
    migrations: &[Migration],
) -> Result<usize, MigrationError> {
    conn.execute_batch(TRACKING_TABLE)
        .map_err(|source| MigrationError::ExecutionFailed {
            name: "_parley_migrations".to_string(),
            source,
        })?;
    let done = applied_names(conn).map_err(MigrationError::StateQuery)?;

    let pending: Vec<&Migration> = migrations
        .iter()
        .filter(|m| !done.contains(m.name))
        .collect();
    for migration in &pending {
        apply(conn, migration).map_err(|source| MigrationError::ExecutionFailed {
            name: migration.name.to_string(),
            source,
        })?;
        tracing::info!(migration = migration.name, "applied migration");
    }
    if pending.is_empty() {
        tracing::debug!(known = done.len(), "store schema current");
    }
    Ok(pending.len())
}

fn applied_names(conn: &Connection) -> Result<HashSet<String>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT name FROM _parley_migrations")?;
    let names = stmt.query_map([], |row| row.get::<_, String>(0))?;
    names.collect()
}

fn apply(conn: &Connection, migration: &Migration) -> Result<(), rusqlite::Error> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(migration.sql)?;
    tx.execute(
        "INSERT INTO _parley_migrations (name) VALUES (?1)",
        [migration.name],
    )?;
    tx.commit()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_exists(conn: &Connection, table: &str) -> bool {
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [table],
            |row| row.get(0),
        )
        .expect("sqlite_master")
    }

    #[test]
    fn fresh_store_gets_crm_and_history_tables() {
        let conn = Connection::open_in_memory().expect("open");
        assert_eq!(run_migrations(&conn).expect("migrate"), MIGRATIONS.len());

        for table in [
            "schema_meta",
            "hco",
            "hcp",
            "calls",
            "history_sessions",
            "history_invocations",
            "history_steps",
        ] {
            assert!(table_exists(&conn, table), "{table} table should exist");
        }
        let marker: String = conn
            .query_row("SELECT value FROM schema_meta WHERE key = 'schema'", [], |row| row.get(0))
            .expect("marker");
        assert_eq!(marker, "parley");
    }

    #[test]
    fn rerun_applies_nothing() {
        let conn = Connection::open_in_memory().expect("open");
        assert_eq!(run_migrations(&conn).expect("first run"), 3);
        assert_eq!(run_migrations(&conn).expect("second run"), 0);
    }

    #[test]
    fn only_unapplied_migrations_run() {
        let conn = Connection::open_in_memory().expect("open");
        run_migrations_from_list(&conn, &MIGRATIONS[..2]).expect("crm only");
        assert!(!table_exists(&conn, "history_sessions"));

        assert_eq!(run_migrations(&conn).expect("catch up"), 1);
        assert!(table_exists(&conn, "history_steps"));
    }

    #[test]
    fn failed_tracking_insert_rolls_back_the_schema_change() {
        let conn = Connection::open_in_memory().expect("open");
        let migrations = [Migration {
            name: "003_conflict",
            sql: "
                CREATE TABLE half_applied (id INTEGER PRIMARY KEY);
                INSERT INTO _parley_migrations (name) VALUES ('003_conflict');
            ",
        }];

        match run_migrations_from_list(&conn, &migrations) {
            Err(MigrationError::ExecutionFailed { name, .. }) => assert_eq!(name, "003_conflict"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(!table_exists(&conn, "half_applied"));
    }
}
