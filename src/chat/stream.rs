//! Incremental ingest of the live event stream.
//!
//! Bytes arrive in arbitrary chunks. `SseDecoder` keeps a rolling buffer,
//! emits one `SseFrame` per complete `\n\n`-terminated block and tracks the
//! last-seen event id. `read_event_stream` drives a decoder from a byte
//! stream until end-of-stream, transport failure or abort.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, trace};

use super::types::ParticipantRole;

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    /// Trailing bytes of an incomplete UTF-8 sequence from the last chunk.
    pending_bytes: Vec<u8>,
    last_event_id: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoder whose cursor starts at a previously seen event id.
    pub fn resume_from(last_event_id: Option<String>) -> Self {
        Self {
            last_event_id,
            ..Self::default()
        }
    }

    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Number of buffered characters not yet terminated by a blank line.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Feed raw bytes; multi-byte characters split across chunks are held
    /// back until complete.
    pub fn push_bytes(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.pending_bytes.extend_from_slice(chunk);
        let bytes = std::mem::take(&mut self.pending_bytes);
        let text = match std::str::from_utf8(&bytes) {
            Ok(text) => text.to_string(),
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();
                self.pending_bytes = bytes[valid..].to_vec();
                String::from_utf8_lossy(&bytes[..valid]).into_owned()
            }
            Err(_) => String::from_utf8_lossy(&bytes).into_owned(),
        };
        self.push(&text)
    }

    /// Feed text and return every frame completed by it.
    pub fn push(&mut self, chunk: &str) -> Vec<SseFrame> {
        self.buffer.push_str(chunk);
        if self.buffer.contains("\r\n") {
            self.buffer = self.buffer.replace("\r\n", "\n");
        }

        let mut frames = Vec::new();
        while let Some(idx) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..idx + 2).collect();
            if let Some(frame) = self.parse_block(&block) {
                frames.push(frame);
            }
        }
        frames
    }

    fn parse_block(&mut self, block: &str) -> Option<SseFrame> {
        let mut frame = SseFrame::default();
        let mut has_data = false;

        for line in block.lines() {
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "id" => {
                    advance_event_id(&mut self.last_event_id, value);
                    frame.id = Some(value.to_string());
                }
                "data" => {
                    has_data = true;
                    frame.data.push_str(value);
                }
                "event" => frame.event = Some(value.to_string()),
                "retry" => {}
                other => trace!("ignoring unknown SSE field: {other}"),
            }
        }

        if !has_data {
            trace!("dropping SSE block without data");
            return None;
        }
        Some(frame)
    }
}

/// Move `cursor` forward to `candidate`. Numeric ids only ever increase;
/// opaque ids replace the cursor. Returns whether the cursor changed.
pub fn advance_event_id(cursor: &mut Option<String>, candidate: &str) -> bool {
    let candidate = candidate.trim();
    if candidate.is_empty() {
        return false;
    }
    if let Some(current) = cursor.as_deref() {
        if current == candidate {
            return false;
        }
        if let (Ok(current), Ok(next)) = (current.parse::<u64>(), candidate.parse::<u64>()) {
            if next <= current {
                return false;
            }
        }
    }
    *cursor = Some(candidate.to_string());
    true
}

// ---------------------------------------------------------------------------
// Protocol events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolEvent {
    Message {
        role: ParticipantRole,
        text: String,
    },
    TypingStarted {
        role: ParticipantRole,
    },
    TypingStopped {
        role: ParticipantRole,
    },
    SessionStatusChanged {
        role: ParticipantRole,
        status: String,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamPayload {
    conversation_entry: ConversationEntry,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConversationEntry {
    entry_type: String,
    #[serde(default)]
    sender: Option<EntrySender>,
    #[serde(default)]
    entry_payload: Option<String>,
}

#[derive(Deserialize)]
struct EntrySender {
    #[serde(default)]
    role: String,
}

/// Decode one frame's JSON payload. Anything malformed or irrelevant yields
/// `None`.
pub fn parse_protocol_event(frame: &SseFrame) -> Option<ProtocolEvent> {
    let payload: StreamPayload = match serde_json::from_str(&frame.data) {
        Ok(payload) => payload,
        Err(e) => {
            debug!("dropping malformed stream event: {e}");
            return None;
        }
    };
    let entry = payload.conversation_entry;
    let role = ParticipantRole::from_wire(
        entry.sender.as_ref().map(|s| s.role.as_str()).unwrap_or(""),
    );
    let body: serde_json::Value = entry
        .entry_payload
        .as_deref()
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or(serde_json::Value::Null);

    match entry.entry_type.as_str() {
        "Message" => {
            let text = ["/abstractMessage/staticContent/text", "/staticContent/text", "/text"]
                .iter()
                .find_map(|pointer| body.pointer(pointer).and_then(|v| v.as_str()))?;
            Some(ProtocolEvent::Message {
                role,
                text: text.to_string(),
            })
        }
        "TypingStartedIndicator" => Some(ProtocolEvent::TypingStarted { role }),
        "TypingStoppedIndicator" => Some(ProtocolEvent::TypingStopped { role }),
        "SessionStatusChanged" => {
            let status = ["/sessionStatus", "/status"]
                .iter()
                .find_map(|pointer| body.pointer(pointer).and_then(|v| v.as_str()))
                .unwrap_or_default();
            Some(ProtocolEvent::SessionStatusChanged {
                role,
                status: status.to_string(),
            })
        }
        other => {
            trace!("ignoring stream entry type {other}");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Read loop
// ---------------------------------------------------------------------------

/// Receives decoded stream output.
pub trait StreamSink {
    fn on_event(&mut self, event: ProtocolEvent);

    fn on_cursor(&mut self, _last_event_id: &str) {}
}

/// How a read loop finished. None of these is an error for the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    Eof,
    Aborted,
    Failed(String),
}

/// Cancels a running read loop. Aborting more than once is harmless.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `abort()` has been called.
    pub async fn aborted(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|aborted| *aborted).await;
    }
}

pub async fn read_event_stream<S, B, E, K>(
    stream: S,
    decoder: &mut SseDecoder,
    abort: &AbortSignal,
    sink: &mut K,
) -> StreamEnd
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
    K: StreamSink + ?Sized,
{
    futures::pin_mut!(stream);
    if abort.is_aborted() {
        return StreamEnd::Aborted;
    }

    loop {
        let next = tokio::select! {
            biased;
            _ = abort.aborted() => return StreamEnd::Aborted,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(chunk)) => {
                let before = decoder.last_event_id().map(str::to_string);
                for frame in decoder.push_bytes(chunk.as_ref()) {
                    if let Some(event) = parse_protocol_event(&frame) {
                        sink.on_event(event);
                    }
                }
                if let Some(cursor) = decoder.last_event_id() {
                    if before.as_deref() != Some(cursor) {
                        sink.on_cursor(cursor);
                    }
                }
            }
            Some(Err(e)) => return StreamEnd::Failed(e.to_string()),
            None => return StreamEnd::Eof,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::time::Duration;

    use super::*;

    fn message_frame(role: &str, text: &str) -> String {
        let payload = serde_json::json!({
            "abstractMessage": { "staticContent": { "formatType": "Text", "text": text } }
        })
        .to_string();
        serde_json::json!({
            "conversationEntry": {
                "entryType": "Message",
                "sender": { "role": role },
                "entryPayload": payload,
            }
        })
        .to_string()
    }

    #[derive(Default)]
    struct Recorder {
        events: Vec<ProtocolEvent>,
        cursors: Vec<String>,
    }

    impl StreamSink for Recorder {
        fn on_event(&mut self, event: ProtocolEvent) {
            self.events.push(event);
        }

        fn on_cursor(&mut self, last_event_id: &str) {
            self.cursors.push(last_event_id.to_string());
        }
    }

    #[test]
    fn frames_split_across_chunks_are_reassembled() {
        let mut decoder = SseDecoder::new();
        let block = format!("id: 7\ndata: {}\n\n", message_frame("Agent", "hi"));
        let (head, tail) = block.split_at(block.len() / 2);

        assert!(decoder.push(head).is_empty());
        assert!(decoder.pending_len() > 0);
        let frames = decoder.push(tail);

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id.as_deref(), Some("7"));
        assert_eq!(decoder.last_event_id(), Some("7"));
        assert_eq!(decoder.pending_len(), 0);
        assert!(parse_protocol_event(&frames[0]).is_some());
    }

    #[test]
    fn multiple_data_lines_are_concatenated() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push("data: {\"a\":\ndata: 1}\n\n");
        assert_eq!(frames[0].data, "{\"a\":1}");
    }

    #[test]
    fn crlf_delimiters_and_comments_are_handled() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(": keep-alive\r\n\r\nid: 3\r\ndata: {}\r\n\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id.as_deref(), Some("3"));
    }

    #[test]
    fn blocks_without_data_still_advance_the_cursor() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push("id: 12\n\n");
        assert!(frames.is_empty());
        assert_eq!(decoder.last_event_id(), Some("12"));
    }

    #[test]
    fn numeric_cursor_never_moves_backwards() {
        let mut cursor = Some("10".to_string());
        assert!(!advance_event_id(&mut cursor, "9"));
        assert!(!advance_event_id(&mut cursor, "10"));
        assert!(advance_event_id(&mut cursor, "11"));
        assert_eq!(cursor.as_deref(), Some("11"));

        assert!(advance_event_id(&mut cursor, "opaque-token"));
        assert!(!advance_event_id(&mut cursor, "  "));
        assert_eq!(cursor.as_deref(), Some("opaque-token"));
    }

    #[test]
    fn utf8_split_across_chunks_survives() {
        let mut decoder = SseDecoder::new();
        let block = "data: {\"text\":\"caf\u{e9}\"}\n\n".as_bytes();
        let split = block.iter().position(|b| *b == 0xC3).unwrap() + 1;

        assert!(decoder.push_bytes(&block[..split]).is_empty());
        let frames = decoder.push_bytes(&block[split..]);
        assert_eq!(frames[0].data, "{\"text\":\"caf\u{e9}\"}");
    }

    #[test]
    fn protocol_events_are_decoded_by_entry_type() {
        let typing = SseFrame {
            data: r#"{"conversationEntry":{"entryType":"TypingStartedIndicator","sender":{"role":"Agent"},"entryPayload":"{}"}}"#.to_string(),
            ..Default::default()
        };
        assert_eq!(
            parse_protocol_event(&typing),
            Some(ProtocolEvent::TypingStarted {
                role: ParticipantRole::Agent
            })
        );

        let status = SseFrame {
            data: r#"{"conversationEntry":{"entryType":"SessionStatusChanged","sender":{"role":"System"},"entryPayload":"{\"sessionStatus\":\"Active\"}"}}"#.to_string(),
            ..Default::default()
        };
        assert_eq!(
            parse_protocol_event(&status),
            Some(ProtocolEvent::SessionStatusChanged {
                role: ParticipantRole::System,
                status: "Active".to_string()
            })
        );

        let message = SseFrame {
            data: message_frame("Chatbot", "Welcome!"),
            ..Default::default()
        };
        assert_eq!(
            parse_protocol_event(&message),
            Some(ProtocolEvent::Message {
                role: ParticipantRole::Chatbot,
                text: "Welcome!".to_string()
            })
        );
    }

    #[test]
    fn malformed_and_unknown_payloads_are_dropped() {
        for data in [
            "not json at all",
            r#"{"unexpected":true}"#,
            r#"{"conversationEntry":{"entryType":"RoutingResult","entryPayload":"{}"}}"#,
            r#"{"conversationEntry":{"entryType":"Message","entryPayload":"{\"richContent\":{}}"}}"#,
        ] {
            let frame = SseFrame {
                data: data.to_string(),
                ..Default::default()
            };
            assert_eq!(parse_protocol_event(&frame), None, "payload {data}");
        }
    }

    #[tokio::test]
    async fn read_loop_skips_bad_events_and_ends_at_eof() {
        let chunks: Vec<Result<Vec<u8>, Infallible>> = vec![
            Ok(format!("id: 1\ndata: {}\n\n", message_frame("Agent", "one")).into_bytes()),
            Ok(b"id: 2\ndata: {broken\n\n".to_vec()),
            Ok(format!("id: 3\ndata: {}\n\n", message_frame("Agent", "three")).into_bytes()),
        ];
        let mut decoder = SseDecoder::new();
        let mut sink = Recorder::default();

        let end = read_event_stream(
            futures::stream::iter(chunks),
            &mut decoder,
            &AbortSignal::new(),
            &mut sink,
        )
        .await;

        assert_eq!(end, StreamEnd::Eof);
        assert_eq!(sink.events.len(), 2);
        assert_eq!(sink.cursors, vec!["1", "2", "3"]);
        assert_eq!(decoder.last_event_id(), Some("3"));
    }

    #[tokio::test]
    async fn transport_errors_end_the_loop_without_panicking() {
        let chunks: Vec<Result<Vec<u8>, String>> = vec![
            Ok(format!("data: {}\n\n", message_frame("Agent", "before")).into_bytes()),
            Err("connection reset".to_string()),
        ];
        let mut sink = Recorder::default();
        let end = read_event_stream(
            futures::stream::iter(chunks),
            &mut SseDecoder::new(),
            &AbortSignal::new(),
            &mut sink,
        )
        .await;

        assert_eq!(end, StreamEnd::Failed("connection reset".to_string()));
        assert_eq!(sink.events.len(), 1);
    }

    #[tokio::test]
    async fn abort_stops_a_pending_read() {
        let abort = AbortSignal::new();
        let trigger = abort.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.abort();
            trigger.abort();
        });

        let end = read_event_stream(
            futures::stream::pending::<Result<Vec<u8>, Infallible>>(),
            &mut SseDecoder::new(),
            &abort,
            &mut Recorder::default(),
        )
        .await;

        assert_eq!(end, StreamEnd::Aborted);
        assert!(abort.is_aborted());
    }
}
