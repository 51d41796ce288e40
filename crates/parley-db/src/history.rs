//! Conversation history checkpoints.
//!
//! A history session is the durable key a client can hand back to recover a
//! conversation in a new process. Each engine lifetime writes one
//! invocation under it, and each completed turn entry becomes a step.
//! Steps are read back newest first; callers reverse them.

use chrono::{DateTime, Utc};
use parley_types::{HistoryEntry, Role};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum HistoryStoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("history session not found: {0}")]
    UnknownSession(String),

    #[error("invocation not found: {0}")]
    UnknownInvocation(String),

    #[error("corrupt history step {seq}: {reason}")]
    Corrupt { seq: i64, reason: String },
}

pub fn create_session(conn: &Connection, user_id: Option<&str>) -> Result<String, HistoryStoreError> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO history_sessions (id, user_id) VALUES (?1, ?2)",
        params![id, user_id],
    )?;
    Ok(id)
}

pub fn session_exists(conn: &Connection, session_id: &str) -> Result<bool, HistoryStoreError> {
    Ok(conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM history_sessions WHERE id = ?1)",
        [session_id],
        |row| row.get(0),
    )?)
}

pub fn create_invocation(conn: &Connection, session_id: &str) -> Result<String, HistoryStoreError> {
    if !session_exists(conn, session_id)? {
        return Err(HistoryStoreError::UnknownSession(session_id.to_string()));
    }
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO history_invocations (id, session_id) VALUES (?1, ?2)",
        params![id, session_id],
    )?;
    Ok(id)
}

/// Most recently created invocation under a history session, if any.
pub fn latest_invocation(
    conn: &Connection,
    session_id: &str,
) -> Result<Option<String>, HistoryStoreError> {
    Ok(conn
        .query_row(
            "SELECT id FROM history_invocations WHERE session_id = ?1 ORDER BY seq DESC LIMIT 1",
            [session_id],
            |row| row.get(0),
        )
        .optional()?)
}

pub fn append_step(
    conn: &Connection,
    invocation_id: &str,
    entry: &HistoryEntry,
) -> Result<i64, HistoryStoreError> {
    let known: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM history_invocations WHERE id = ?1)",
        [invocation_id],
        |row| row.get(0),
    )?;
    if !known {
        return Err(HistoryStoreError::UnknownInvocation(invocation_id.to_string()));
    }

    conn.execute(
        "INSERT INTO history_steps (invocation_id, ordinal, role, text, completed_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            invocation_id,
            entry.ordinal as i64,
            entry.role.as_wire(),
            entry.text,
            entry.completed_at.to_rfc3339(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Steps of an invocation, newest first.
pub fn list_steps(conn: &Connection, invocation_id: &str) -> Result<Vec<HistoryEntry>, HistoryStoreError> {
    let mut stmt = conn.prepare(
        "SELECT seq, ordinal, role, text, completed_at FROM history_steps
         WHERE invocation_id = ?1 ORDER BY seq DESC",
    )?;
    let rows = stmt.query_map([invocation_id], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
        ))
    })?;

    let mut entries = Vec::new();
    for row in rows {
        let (seq, ordinal, role, text, completed_at) = row?;
        let role: Role = role.parse().map_err(|e: parley_types::ParseRoleError| {
            HistoryStoreError::Corrupt {
                seq,
                reason: e.to_string(),
            }
        })?;
        let completed_at = DateTime::parse_from_rfc3339(&completed_at)
            .map_err(|e| HistoryStoreError::Corrupt {
                seq,
                reason: e.to_string(),
            })?
            .with_timezone(&Utc);
        entries.push(HistoryEntry {
            ordinal: ordinal.max(0) as u64,
            role,
            text,
            completed_at,
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run_migrations;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open");
        run_migrations(&conn).expect("migrate");
        conn
    }

    fn entry(ordinal: u64, role: Role, text: &str) -> HistoryEntry {
        HistoryEntry {
            ordinal,
            role,
            text: text.to_string(),
            completed_at: Utc::now(),
        }
    }

    #[test]
    fn steps_come_back_newest_first() {
        let conn = conn();
        let session = create_session(&conn, Some("rep-1")).expect("session");
        let invocation = create_invocation(&conn, &session).expect("invocation");

        append_step(&conn, &invocation, &entry(0, Role::User, "I met with Dr. Harper")).expect("step");
        append_step(&conn, &invocation, &entry(0, Role::Assistant, "Noted.")).expect("step");
        append_step(&conn, &invocation, &entry(1, Role::User, "Save it")).expect("step");

        let steps = list_steps(&conn, &invocation).expect("list");
        let texts: Vec<_> = steps.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, ["Save it", "Noted.", "I met with Dr. Harper"]);
        assert_eq!(steps[1].role, Role::Assistant);
        assert_eq!(steps[0].ordinal, 1);
    }

    #[test]
    fn latest_invocation_tracks_creation_order() {
        let conn = conn();
        let session = create_session(&conn, None).expect("session");
        assert!(latest_invocation(&conn, &session).expect("query").is_none());

        let first = create_invocation(&conn, &session).expect("first");
        let second = create_invocation(&conn, &session).expect("second");
        assert_ne!(first, second);
        assert_eq!(latest_invocation(&conn, &session).expect("query"), Some(second));
    }

    #[test]
    fn unknown_ids_are_rejected() {
        let conn = conn();
        assert!(matches!(
            create_invocation(&conn, "missing"),
            Err(HistoryStoreError::UnknownSession(_))
        ));
        assert!(matches!(
            append_step(&conn, "missing", &entry(0, Role::User, "hi")),
            Err(HistoryStoreError::UnknownInvocation(_))
        ));
    }
}
