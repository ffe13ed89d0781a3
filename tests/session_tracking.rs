//! End-to-end: chat client and activity batcher sharing a bus, persisting to SQLite.

mod common;

use std::sync::Arc;

use httpmock::Method::POST;
use httpmock::MockServer;
use pretty_assertions::assert_eq;

use chatwire_lib::activity::{ActivityBatcher, EngagementEvent};
use chatwire_lib::bus::{EventBus, SessionEventType};
use chatwire_lib::chat::{ChatState, SendOutcome, SessionProtocolClient};
use chatwire_lib::db::{queries, Database};
use common::{settings_for, MockBackend};

struct Harness {
    _dir: tempfile::TempDir,
    db: Arc<Database>,
    batcher: ActivityBatcher,
    client: SessionProtocolClient,
}

fn harness(server: &MockServer) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(Database::open(dir.path().join("chatwire.db")).unwrap());
    let settings = settings_for(server);
    let bus = Arc::new(EventBus::new());
    let batcher = ActivityBatcher::start(&bus, db.clone(), settings.tracking_options());
    let client = SessionProtocolClient::builder(settings)
        .bus(bus)
        .build()
        .unwrap();
    Harness {
        _dir: dir,
        db,
        batcher,
        client,
    }
}

fn stored_kinds(db: &Database, session_id: &str) -> Vec<SessionEventType> {
    let row = queries::get_session_activity(db, session_id)
        .unwrap()
        .expect("record persisted");
    let events: Vec<EngagementEvent> = serde_json::from_str(&row.events_json).unwrap();
    events.into_iter().map(|e| e.event_type).collect()
}

#[tokio::test]
async fn full_session_is_persisted_as_one_final_record() {
    let server = MockServer::start_async().await;
    let backend = MockBackend::start(&server).await;
    let h = harness(&server);
    let session_id = h.client.session_id();

    assert_eq!(h.client.send_message("I need help with billing").await.unwrap(), SendOutcome::Delivered);
    assert_eq!(h.client.send_message("My invoice is wrong").await.unwrap(), SendOutcome::Delivered);
    assert_eq!(h.client.state(), ChatState::Active);

    h.client.end_session();

    let row = queries::get_session_activity(&h.db, &session_id)
        .unwrap()
        .expect("record persisted");
    assert_eq!(row.event_type, "SessionEnded");
    assert!(row.session_end_time.is_some());
    assert_eq!(row.message_count, 3);
    assert_eq!(row.event_count, 5);
    assert_eq!(row.source.as_deref(), Some("chatwire.tracker"));
    assert_eq!(
        stored_kinds(&h.db, &session_id),
        vec![
            SessionEventType::MessageReceived,
            SessionEventType::SessionStarted,
            SessionEventType::MessageSent,
            SessionEventType::MessageSent,
            SessionEventType::SessionEnded,
        ]
    );
    assert_eq!(queries::list_session_activity(&h.db, 10).unwrap().len(), 1);

    backend.token.assert_hits_async(1).await;
    backend.conversation.assert_hits_async(1).await;
    backend.events.assert_hits_async(1).await;
    backend.message.assert_hits_async(2).await;
}

#[tokio::test]
async fn next_session_gets_its_own_record() {
    let server = MockServer::start_async().await;
    let _backend = MockBackend::start(&server).await;
    let h = harness(&server);

    let first = h.client.session_id();
    h.client.send_message("first session").await.unwrap();
    h.client.end_session();

    let second = h.client.session_id();
    assert_ne!(first, second);
    h.client.send_message("second session").await.unwrap();
    h.batcher.on_visibility_change(true);

    let live = queries::get_session_activity(&h.db, &second)
        .unwrap()
        .expect("live record flushed on hide");
    assert_eq!(live.event_type, "SessionUpdated");
    assert_eq!(live.session_end_time, None);
    assert_eq!(queries::list_session_activity(&h.db, 10).unwrap().len(), 2);
    assert_eq!(
        queries::get_session_activity(&h.db, &first).unwrap().map(|r| r.event_type),
        Some("SessionEnded".to_string())
    );
}

#[tokio::test]
async fn failed_connect_persists_nothing_and_can_be_retried() {
    let server = MockServer::start_async().await;
    let token = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/authorization/unauthenticated/access-token");
            then.status(500)
                .json_body(serde_json::json!({ "message": "deployment is offline" }));
        })
        .await;
    let conversation = server
        .mock_async(|when, then| {
            when.method(POST).path("/conversation");
            then.status(201);
        })
        .await;
    let h = harness(&server);

    let err = h.client.send_message("hello").await.unwrap_err();
    assert_eq!(err.to_string(), "deployment is offline");
    assert_eq!(h.client.state(), ChatState::Error);
    assert_eq!(
        h.client.send_message("again").await.unwrap(),
        SendOutcome::Suppressed
    );

    h.client.retry();
    assert_eq!(h.client.state(), ChatState::Welcome);

    h.client.end_session();
    h.batcher.teardown();
    assert!(queries::list_session_activity(&h.db, 10).unwrap().is_empty());
    token.assert_hits_async(1).await;
    conversation.assert_hits_async(0).await;
}
