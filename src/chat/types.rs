//! Chat session types shared between the client and its host.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChatState {
    Welcome,
    Connecting,
    Active,
    Error,
}

impl fmt::Display for ChatState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ChatState::Welcome => "welcome",
            ChatState::Connecting => "connecting",
            ChatState::Active => "active",
            ChatState::Error => "error",
        };
        f.write_str(label)
    }
}

/// Conversation participant as reported by the backend's `sender.role`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ParticipantRole {
    EndUser,
    Agent,
    Chatbot,
    System,
    Other(String),
}

impl ParticipantRole {
    pub fn from_wire(role: &str) -> Self {
        match role {
            "EndUser" => Self::EndUser,
            "Agent" => Self::Agent,
            "Chatbot" => Self::Chatbot,
            "System" => Self::System,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::EndUser => "EndUser",
            Self::Agent => "Agent",
            Self::Chatbot => "Chatbot",
            Self::System => "System",
            Self::Other(role) => role,
        }
    }

    pub fn is_end_user(&self) -> bool {
        matches!(self, Self::EndUser)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptEntry {
    pub id: String,
    pub role: ParticipantRole,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl TranscriptEntry {
    pub fn new(role: ParticipantRole, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Immutable copy of the session as the host should render it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatSnapshot {
    pub session_id: String,
    pub conversation_id: Option<String>,
    pub state: ChatState,
    pub message_count: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub is_typing: bool,
    pub transcript: Vec<TranscriptEntry>,
    pub last_error: Option<String>,
    pub last_event_id: Option<String>,
}

/// Result of `send_message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The backend accepted the message.
    Delivered,
    /// The send failed; the transcript carries a local error entry and the
    /// session stays active.
    DeliveryFailed(String),
    /// A connect sequence is in flight or the session is in `Error`.
    Suppressed,
    /// Blank input.
    Ignored,
}
