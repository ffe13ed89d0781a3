//! Common test utilities for chat session integration tests.

use httpmock::Method::{GET, POST};
use httpmock::{Mock, MockServer};
use serde_json::json;

use chatwire_lib::config::ChatSettings;

/// Settings pointed at `server`, with short connect waits and no stream
/// reconnects.
pub fn settings_for(server: &MockServer) -> ChatSettings {
    ChatSettings {
        org_id: Some("00D1".to_string()),
        deployment_id: Some("Support_Web".to_string()),
        api_base_url: Some(server.base_url()),
        active_wait_secs: Some(2),
        greeting_wait_secs: Some(2),
        max_stream_reconnects: Some(0),
        ..Default::default()
    }
}

/// One SSE block carrying a conversation entry.
pub fn sse_entry(id: u32, entry_type: &str, role: &str, payload: serde_json::Value) -> String {
    let data = json!({
        "conversationEntry": {
            "entryType": entry_type,
            "sender": { "role": role },
            "entryPayload": payload.to_string(),
        }
    });
    format!("id: {id}\ndata: {data}\n\n")
}

pub fn agent_message(id: u32, text: &str) -> String {
    sse_entry(
        id,
        "Message",
        "Agent",
        json!({ "abstractMessage": { "staticContent": { "text": text } } }),
    )
}

/// Happy-path backend: token, conversation, message endpoints and an event
/// stream that activates the session and greets.
pub struct MockBackend<'a> {
    pub token: Mock<'a>,
    pub conversation: Mock<'a>,
    pub events: Mock<'a>,
    pub message: Mock<'a>,
}

impl<'a> MockBackend<'a> {
    pub async fn start(server: &'a MockServer) -> MockBackend<'a> {
        let stream = [
            sse_entry(1, "SessionStatusChanged", "System", json!({ "sessionStatus": "Active" })),
            agent_message(2, "Hi, how can I help?"),
        ]
        .concat();

        let token = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/authorization/unauthenticated/access-token")
                    .json_body_partial(r#"{"orgId":"00D1","deploymentId":"Support_Web"}"#);
                then.status(200)
                    .json_body(json!({ "accessToken": "tok-1", "lastEventId": 0 }));
            })
            .await;
        let conversation = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/conversation")
                    .header("authorization", "Bearer tok-1");
                then.status(201).json_body(json!({}));
            })
            .await;
        let events = server
            .mock_async(move |when, then| {
                when.method(GET)
                    .path("/events")
                    .header("accept", "text/event-stream")
                    .header("x-org-id", "00D1");
                then.status(200)
                    .header("content-type", "text/event-stream")
                    .body(stream);
            })
            .await;
        let message = server
            .mock_async(|when, then| {
                when.method(POST).path_contains("/message");
                then.status(202);
            })
            .await;

        MockBackend {
            token,
            conversation,
            events,
            message,
        }
    }
}
