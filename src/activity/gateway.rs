use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use thiserror::Error;

use super::types::SessionActivityRecord;
use crate::db::{queries, Database, DbError};

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Db(#[from] DbError),
    #[error("failed to encode activity record: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("upsert rejected: {0}")]
    Rejected(String),
}

/// Durable store for session activity records, keyed by session id.
///
/// Implementations must be idempotent: writing the same record twice leaves
/// one stored record with that content.
pub trait PersistenceGateway: Send + Sync {
    fn upsert(&self, session_id: &str, record: &SessionActivityRecord)
        -> Result<(), PersistenceError>;
}

impl PersistenceGateway for Database {
    fn upsert(
        &self,
        session_id: &str,
        record: &SessionActivityRecord,
    ) -> Result<(), PersistenceError> {
        let row = queries::SessionActivityRow {
            session_id: session_id.to_string(),
            event_type: record.event_type.as_str().to_string(),
            started_at: record.started_at.to_rfc3339(),
            event_count: record.event_count as i64,
            message_count: record.message_count as i64,
            time_in_chat_seconds: record.time_in_chat_seconds,
            session_end_time: record.session_end_time.map(|t| t.to_rfc3339()),
            events_json: serde_json::to_string(&record.events)?,
            source: Some(record.source.clone()),
            updated_at: Utc::now().to_rfc3339(),
        };
        queries::upsert_session_activity(self, &row)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory gateway
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryState {
    records: HashMap<String, SessionActivityRecord>,
    writes: Vec<SessionActivityRecord>,
    reject_next: usize,
}

/// Keeps records in process. Also keeps every accepted write in order so
/// callers can inspect the flush history.
#[derive(Default)]
pub struct MemoryGateway {
    state: Mutex<MemoryState>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record(&self, session_id: &str) -> Option<SessionActivityRecord> {
        self.state().records.get(session_id).cloned()
    }

    /// Every accepted write, oldest first.
    pub fn writes(&self) -> Vec<SessionActivityRecord> {
        self.state().writes.clone()
    }

    pub fn writes_for(&self, session_id: &str) -> Vec<SessionActivityRecord> {
        self.state()
            .writes
            .iter()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect()
    }

    /// Fail the next `count` upserts with [`PersistenceError::Rejected`].
    pub fn reject_next(&self, count: usize) {
        self.state().reject_next = count;
    }
}

impl PersistenceGateway for MemoryGateway {
    fn upsert(
        &self,
        session_id: &str,
        record: &SessionActivityRecord,
    ) -> Result<(), PersistenceError> {
        let mut state = self.state();
        if state.reject_next > 0 {
            state.reject_next -= 1;
            return Err(PersistenceError::Rejected(format!(
                "store unavailable for {session_id}"
            )));
        }
        state.records.insert(session_id.to_string(), record.clone());
        state.writes.push(record.clone());
        Ok(())
    }
}
