//! CRM records: healthcare professionals (HCP), their organisations (HCO),
//! and logged calls.

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// A healthcare professional matched by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HcpRecord {
    pub hcp_id: String,
    pub name: String,
    pub hco_id: Option<String>,
    pub hco_name: Option<String>,
}

/// Follow-up task captured alongside a call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FollowUpTask {
    pub task_type: String,
    pub description: String,
    pub due_date: String,
    pub assigned_to: String,
}

/// A call record as produced by the assistant. Missing fields take the
/// same defaults a blank CRM form would.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallRecord {
    pub call_channel: String,
    pub discussion_topic: String,
    pub status: String,
    pub account: String,
    pub id: String,
    pub adverse_event: bool,
    pub adverse_event_details: String,
    pub noncompliance_event: bool,
    pub noncompliance_description: String,
    pub call_notes: String,
    pub call_date: String,
    pub call_time: String,
    pub product: String,
    pub call_follow_up_task: FollowUpTask,
}

impl Default for CallRecord {
    fn default() -> Self {
        Self {
            call_channel: "In-person".to_string(),
            discussion_topic: String::new(),
            status: "Saved_vod".to_string(),
            account: String::new(),
            id: String::new(),
            adverse_event: false,
            adverse_event_details: String::new(),
            noncompliance_event: false,
            noncompliance_description: String::new(),
            call_notes: String::new(),
            call_date: String::new(),
            call_time: String::new(),
            product: String::new(),
            call_follow_up_task: FollowUpTask::default(),
        }
    }
}

/// Generates a call primary key: `CALL_` followed by 12 upper-case hex digits.
pub fn new_call_pk() -> String {
    let hex = Uuid::new_v4().simple().to_string().to_uppercase();
    format!("CALL_{}", &hex[..12])
}

const HCP_SELECT: &str = "SELECT hcp.hcp_id, hcp.name, hcp.hco_id, hco.name
     FROM hcp LEFT JOIN hco ON hco.hco_id = hcp.hco_id";

/// Looks up an HCP by exact (case-insensitive) name first, then by
/// case-insensitive substring. Among substring matches the shortest name
/// wins.
pub fn lookup_hcp_by_name(conn: &Connection, name: &str) -> Result<Option<HcpRecord>, RecordError> {
    let name = name.trim();
    if name.is_empty() {
        return Ok(None);
    }

    let map_row = |row: &rusqlite::Row<'_>| {
        Ok(HcpRecord {
            hcp_id: row.get(0)?,
            name: row.get(1)?,
            hco_id: row.get(2)?,
            hco_name: row.get(3)?,
        })
    };

    let exact = conn
        .query_row(
            &format!("{HCP_SELECT} WHERE LOWER(hcp.name) = LOWER(?1) LIMIT 1"),
            [name],
            map_row,
        )
        .optional()?;
    if exact.is_some() {
        return Ok(exact);
    }

    let fuzzy = conn
        .query_row(
            &format!(
                "{HCP_SELECT} WHERE LOWER(hcp.name) LIKE '%' || LOWER(?1) || '%'
                 ORDER BY LENGTH(hcp.name), hcp.hcp_id LIMIT 1"
            ),
            [name],
            map_row,
        )
        .optional()?;
    Ok(fuzzy)
}

pub fn upsert_hco(conn: &Connection, hco_id: &str, name: &str) -> Result<(), RecordError> {
    conn.execute(
        "INSERT INTO hco (hco_id, name) VALUES (?1, ?2)
         ON CONFLICT(hco_id) DO UPDATE SET name = excluded.name",
        params![hco_id, name],
    )?;
    Ok(())
}

pub fn upsert_hcp(
    conn: &Connection,
    hcp_id: &str,
    name: &str,
    hco_id: Option<&str>,
) -> Result<(), RecordError> {
    conn.execute(
        "INSERT INTO hcp (hcp_id, name, hco_id) VALUES (?1, ?2, ?3)
         ON CONFLICT(hcp_id) DO UPDATE SET name = excluded.name, hco_id = excluded.hco_id",
        params![hcp_id, name, hco_id],
    )?;
    Ok(())
}

/// Inserts a call and returns its generated primary key.
pub fn insert_call(conn: &Connection, record: &CallRecord) -> Result<String, RecordError> {
    let call_pk = new_call_pk();
    let task = &record.call_follow_up_task;
    conn.execute(
        "INSERT INTO calls (
            call_pk, call_channel, discussion_topic, status, account, id,
            adverse_event, adverse_event_details,
            noncompliance_event, noncompliance_description,
            call_notes, call_date, call_time, product,
            followup_task_type, followup_description, followup_due_date, followup_assigned_to
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
        params![
            call_pk,
            record.call_channel,
            record.discussion_topic,
            record.status,
            record.account,
            record.id,
            record.adverse_event,
            record.adverse_event_details,
            record.noncompliance_event,
            record.noncompliance_description,
            record.call_notes,
            record.call_date,
            record.call_time,
            record.product,
            task.task_type,
            task.description,
            task.due_date,
            task.assigned_to,
        ],
    )?;
    tracing::info!(call_pk = %call_pk, "call record inserted");
    Ok(call_pk)
}

pub fn count_calls(conn: &Connection) -> Result<i64, RecordError> {
    Ok(conn.query_row("SELECT COUNT(*) FROM calls", [], |row| row.get(0))?)
}

/// Liveness check for the record tables.
pub fn check_health(conn: &Connection) -> Result<(), RecordError> {
    conn.query_row("SELECT COUNT(*) FROM hcp LIMIT 1", [], |row| row.get::<_, i64>(0))?;
    Ok(())
}
