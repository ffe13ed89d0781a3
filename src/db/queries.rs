use rusqlite::{params, Row};
use serde::Serialize;

use super::{Database, DbError};

// ---------------------------------------------------------------------------
// Row types: flat structs that map directly to table columns
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionActivityRow {
    pub session_id: String,
    pub event_type: String,
    pub started_at: String,
    pub event_count: i64,
    pub message_count: i64,
    pub time_in_chat_seconds: Option<i64>,
    pub session_end_time: Option<String>,
    pub events_json: String,
    pub source: Option<String>,
    pub updated_at: String,
}

const SESSION_ACTIVITY_COLUMNS: &str = "session_id, event_type, started_at, event_count, \
     message_count, time_in_chat_seconds, session_end_time, events_json, source, updated_at";

fn session_activity_from_row(row: &Row<'_>) -> rusqlite::Result<SessionActivityRow> {
    Ok(SessionActivityRow {
        session_id: row.get(0)?,
        event_type: row.get(1)?,
        started_at: row.get(2)?,
        event_count: row.get(3)?,
        message_count: row.get(4)?,
        time_in_chat_seconds: row.get(5)?,
        session_end_time: row.get(6)?,
        events_json: row.get(7)?,
        source: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

// ---------------------------------------------------------------------------
// Session activity queries
// ---------------------------------------------------------------------------

/// Insert or replace the activity record for `row.session_id`. Every flush
/// carries the full event log, so the whole row is overwritten.
pub fn upsert_session_activity(db: &Database, row: &SessionActivityRow) -> Result<(), DbError> {
    let conn = db.conn();
    conn.execute(
        "INSERT INTO session_activity (session_id, event_type, started_at, event_count,
             message_count, time_in_chat_seconds, session_end_time, events_json, source, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(session_id)
         DO UPDATE SET
             event_type = excluded.event_type,
             started_at = excluded.started_at,
             event_count = excluded.event_count,
             message_count = excluded.message_count,
             time_in_chat_seconds = excluded.time_in_chat_seconds,
             session_end_time = excluded.session_end_time,
             events_json = excluded.events_json,
             source = excluded.source,
             updated_at = excluded.updated_at",
        params![
            row.session_id,
            row.event_type,
            row.started_at,
            row.event_count,
            row.message_count,
            row.time_in_chat_seconds,
            row.session_end_time,
            row.events_json,
            row.source,
            row.updated_at,
        ],
    )?;
    Ok(())
}

pub fn get_session_activity(
    db: &Database,
    session_id: &str,
) -> Result<Option<SessionActivityRow>, DbError> {
    let conn = db.conn();
    let mut stmt = conn.prepare(&format!(
        "SELECT {SESSION_ACTIVITY_COLUMNS} FROM session_activity WHERE session_id = ?1"
    ))?;
    let mut rows = stmt.query_map(params![session_id], session_activity_from_row)?;
    match rows.next() {
        Some(row) => Ok(Some(row?)),
        None => Ok(None),
    }
}

/// Most recently updated first.
pub fn list_session_activity(
    db: &Database,
    limit: usize,
) -> Result<Vec<SessionActivityRow>, DbError> {
    let conn = db.conn();
    let mut stmt = conn.prepare(&format!(
        "SELECT {SESSION_ACTIVITY_COLUMNS} FROM session_activity ORDER BY updated_at DESC LIMIT ?1"
    ))?;
    let rows = stmt
        .query_map(params![limit as i64], session_activity_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
