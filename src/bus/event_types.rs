//! Session event topic and the event type tags carried on the bus.
//!
//! Single source of truth for the strings that cross the bus boundary and end
//! up in persisted activity records.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

/// Topic carrying chat session lifecycle and engagement events.
pub const TOPIC_SESSION_EVENTS: &str = "chatwire/session-events";

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionEventType {
    SessionStarted,
    SessionEnded,
    MessageSent,
    MessageReceived,
    LinkClick,
    FormSubmit,
    /// Only used as the tag of a non-terminal persisted record; never published.
    SessionUpdated,
}

impl SessionEventType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::SessionStarted => "SessionStarted",
            Self::SessionEnded => "SessionEnded",
            Self::MessageSent => "MessageSent",
            Self::MessageReceived => "MessageReceived",
            Self::LinkClick => "LinkClick",
            Self::FormSubmit => "FormSubmit",
            Self::SessionUpdated => "SessionUpdated",
        }
    }

    pub const fn is_message(&self) -> bool {
        matches!(self, Self::MessageSent | Self::MessageReceived)
    }

    pub const fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            Self::SessionStarted | Self::SessionEnded | Self::SessionUpdated
        )
    }
}

impl fmt::Display for SessionEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionEventType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "SessionStarted" => Ok(Self::SessionStarted),
            "SessionEnded" => Ok(Self::SessionEnded),
            "MessageSent" => Ok(Self::MessageSent),
            "MessageReceived" => Ok(Self::MessageReceived),
            "LinkClick" => Ok(Self::LinkClick),
            "FormSubmit" => Ok(Self::FormSubmit),
            "SessionUpdated" => Ok(Self::SessionUpdated),
            _ => Err(format!("unknown session event type: {value}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_strings_round_trip_through_from_str() {
        for kind in [
            SessionEventType::SessionStarted,
            SessionEventType::SessionEnded,
            SessionEventType::MessageSent,
            SessionEventType::MessageReceived,
            SessionEventType::LinkClick,
            SessionEventType::FormSubmit,
            SessionEventType::SessionUpdated,
        ] {
            assert_eq!(kind.as_str().parse::<SessionEventType>(), Ok(kind));
        }
        assert!("sessionstarted".parse::<SessionEventType>().is_err());
    }

    #[test]
    fn serde_uses_the_wire_names() {
        let json = serde_json::to_string(&SessionEventType::MessageReceived).unwrap();
        assert_eq!(json, "\"MessageReceived\"");
    }
}
