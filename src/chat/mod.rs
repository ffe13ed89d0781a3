//! Embedded chat session client.
//!
//! - `metadata`: deployment lookup that precedes authentication.
//! - `api`: HTTP calls against the messaging backend.
//! - `stream`: server-sent event decoding and the stream read loop.
//! - `client`: the session state machine the host drives.

pub mod api;
pub mod client;
pub mod error;
pub mod metadata;
pub mod stream;
pub mod types;

pub use client::{ClientBuilder, SessionProtocolClient};
pub use error::ChatError;
pub use metadata::{ConfigSource, DeploymentMetadata, SettingsConfigSource, StaticConfigSource};
pub use stream::{AbortSignal, ProtocolEvent, SseDecoder, SseFrame, StreamEnd, StreamSink};
pub use types::{ChatSnapshot, ChatState, ParticipantRole, SendOutcome, TranscriptEntry};
