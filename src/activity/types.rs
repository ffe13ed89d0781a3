use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bus::SessionEventType;

/// One tracked interaction. Appended to a session's log and never changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngagementEvent {
    pub event_type: SessionEventType,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// The persisted aggregate for one session. Each flush overwrites the
/// previous record and carries the whole event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionActivityRecord {
    pub session_id: String,
    /// `SessionUpdated` while the session is live, `SessionEnded` once.
    pub event_type: SessionEventType,
    pub started_at: DateTime<Utc>,
    pub event_count: usize,
    pub message_count: u64,
    pub time_in_chat_seconds: Option<i64>,
    pub session_end_time: Option<DateTime<Utc>>,
    pub source: String,
    pub events: Vec<EngagementEvent>,
}

impl SessionActivityRecord {
    pub fn is_final(&self) -> bool {
        self.event_type == SessionEventType::SessionEnded
    }
}
