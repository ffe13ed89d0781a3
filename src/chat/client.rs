//! Session protocol client.
//!
//! Owns one chat session at a time and moves it through
//! `Welcome -> Connecting -> Active`, falling back to `Error` when connecting
//! fails. Lifecycle and message events are published on the bus as they
//! happen. The host renders from [`ChatSnapshot`]s and is told about changes
//! through a revision counter.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::api::{MessagingApi, SendMessageRequest};
use super::error::ChatError;
use super::metadata::{ConfigSource, DeploymentMetadata, SettingsConfigSource};
use super::stream::{
    advance_event_id, read_event_stream, AbortSignal, ProtocolEvent, SseDecoder, StreamEnd,
    StreamSink,
};
use super::types::{ChatSnapshot, ChatState, ParticipantRole, SendOutcome, TranscriptEntry};
use crate::bus::{EventBus, SessionEventType, TOPIC_SESSION_EVENTS};
use crate::config::{ChatSettings, ConnectWaitPolicy};
use crate::retry::RetryPolicy;

const SEND_FAILURE_NOTICE: &str = "Your message could not be delivered";
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

struct Session {
    /// Bumped on every reset; async work started under an older generation
    /// must not touch the session.
    generation: u64,
    session_id: String,
    conversation_id: Option<String>,
    state: ChatState,
    access_token: Option<String>,
    last_event_id: Option<String>,
    metadata: Option<DeploymentMetadata>,
    api: Option<MessagingApi>,
    message_count: u64,
    started_at: Option<DateTime<Utc>>,
    is_typing: bool,
    transcript: Vec<TranscriptEntry>,
    /// The next outbound message opens the messaging session.
    opens_messaging_session: bool,
    session_started: bool,
    last_error: Option<String>,
}

impl Session {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            session_id: Uuid::new_v4().to_string(),
            conversation_id: None,
            state: ChatState::Welcome,
            access_token: None,
            last_event_id: None,
            metadata: None,
            api: None,
            message_count: 0,
            started_at: None,
            is_typing: false,
            transcript: Vec::new(),
            opens_messaging_session: false,
            session_started: false,
            last_error: None,
        }
    }

    fn clear_credentials(&mut self) {
        self.access_token = None;
        self.last_event_id = None;
        self.metadata = None;
        self.api = None;
        self.conversation_id = None;
    }

    fn snapshot(&self) -> ChatSnapshot {
        ChatSnapshot {
            session_id: self.session_id.clone(),
            conversation_id: self.conversation_id.clone(),
            state: self.state,
            message_count: self.message_count,
            started_at: self.started_at,
            is_typing: self.is_typing,
            transcript: self.transcript.clone(),
            last_error: self.last_error.clone(),
            last_event_id: self.last_event_id.clone(),
        }
    }
}

struct ConnectSignals {
    session_active: watch::Sender<bool>,
    greeting: watch::Sender<bool>,
}

impl ConnectSignals {
    fn new() -> Self {
        Self {
            session_active: watch::channel(false).0,
            greeting: watch::channel(false).0,
        }
    }
}

struct StreamTask {
    abort: AbortSignal,
    handle: JoinHandle<()>,
}

impl StreamTask {
    fn stop(self) {
        self.abort.abort();
        self.handle.abort();
    }
}

/// What a send needs once the session lock is released.
struct PreparedSend {
    generation: u64,
    session_id: String,
    conversation_id: String,
    deployment_id: String,
    access_token: String,
    api: MessagingApi,
    message_count: u64,
    opens_messaging_session: bool,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct ClientBuilder {
    settings: ChatSettings,
    bus: Option<Arc<EventBus>>,
    config_source: Option<Arc<dyn ConfigSource>>,
    http: Option<reqwest::Client>,
}

impl ClientBuilder {
    pub fn bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn config_source(mut self, source: Arc<dyn ConfigSource>) -> Self {
        self.config_source = Some(source);
        self
    }

    pub fn http_client(mut self, client: reqwest::Client) -> Self {
        self.http = Some(client);
        self
    }

    pub fn build(self) -> Result<SessionProtocolClient, ChatError> {
        // No overall request timeout: the event stream is long-lived.
        let http = match self.http {
            Some(client) => client,
            None => reqwest::Client::builder()
                .connect_timeout(HTTP_CONNECT_TIMEOUT)
                .build()
                .map_err(|e| {
                    ChatError::Configuration(format!("failed to create HTTP client: {e}"))
                })?,
        };
        let config_source = self
            .config_source
            .unwrap_or_else(|| Arc::new(SettingsConfigSource::new(self.settings.clone())));
        let bus = self.bus.unwrap_or_else(|| Arc::new(EventBus::new()));
        let (revision, _) = watch::channel(0);

        tracing::debug!(display_mode = ?self.settings.display_mode(), "chat client configured");

        Ok(SessionProtocolClient {
            inner: Arc::new(ClientInner {
                settings: self.settings,
                bus,
                config_source,
                http,
                session: Mutex::new(Session::new(0)),
                signals: Mutex::new(ConnectSignals::new()),
                stream: Mutex::new(None),
                revision,
            }),
        })
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct SessionProtocolClient {
    inner: Arc<ClientInner>,
}

impl SessionProtocolClient {
    /// Start building a client from one immutable settings snapshot.
    pub fn builder(settings: ChatSettings) -> ClientBuilder {
        ClientBuilder {
            settings,
            bus: None,
            config_source: None,
            http: None,
        }
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.inner.bus.clone()
    }

    pub fn settings(&self) -> &ChatSettings {
        &self.inner.settings
    }

    pub fn state(&self) -> ChatState {
        self.inner.session().state
    }

    pub fn session_id(&self) -> String {
        self.inner.session().session_id.clone()
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        self.inner.session().snapshot()
    }

    /// Revision counter bumped on every host-visible change.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    /// Submit user text. The first message of a session is shown right away
    /// and runs the connect sequence before it is delivered.
    ///
    /// Connection failures are returned (and leave the client in `Error`);
    /// delivery failures are reported through [`SendOutcome::DeliveryFailed`].
    pub async fn send_message(&self, text: &str) -> Result<SendOutcome, ChatError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(SendOutcome::Ignored);
        }

        let connect_generation = {
            let mut session = self.inner.session();
            match session.state {
                ChatState::Welcome => {
                    session.state = ChatState::Connecting;
                    session.last_error = None;
                    session
                        .transcript
                        .push(TranscriptEntry::new(ParticipantRole::EndUser, text));
                    Some(session.generation)
                }
                ChatState::Active => None,
                ChatState::Connecting | ChatState::Error => {
                    debug!(state = %session.state, "send suppressed");
                    return Ok(SendOutcome::Suppressed);
                }
            }
        };

        if let Some(generation) = connect_generation {
            self.inner.notify();
            if let Err(e) = self.inner.connect(generation).await {
                if e != ChatError::Abandoned {
                    self.inner.fail(generation, &e);
                }
                return Err(e);
            }
            self.inner.activate(generation)?;
        }

        Ok(self.inner.deliver(text, connect_generation.is_some()).await)
    }

    /// Leave `Error`: drop credentials and return to `Welcome`.
    pub fn retry(&self) {
        let reset = {
            let mut session = self.inner.session();
            if session.state != ChatState::Error {
                false
            } else {
                session.clear_credentials();
                session.state = ChatState::Welcome;
                session.last_error = None;
                session.is_typing = false;
                session.generation += 1;
                true
            }
        };
        if reset {
            self.inner.stop_stream();
            self.inner.notify();
            info!("chat session reset after error");
        }
    }

    /// End the current session: stop the stream, publish `SessionEnded` if a
    /// session was started, and start over with a fresh session id.
    pub fn end_session(&self) {
        let ended = {
            let mut session = self.inner.session();
            let started = session.session_started;
            let details = (
                session.session_id.clone(),
                session.conversation_id.clone(),
                session.message_count,
            );
            let next_generation = session.generation + 1;
            *session = Session::new(next_generation);
            started.then_some(details)
        };
        self.inner.stop_stream();
        self.inner.notify();

        if let Some((session_id, conversation_id, message_count)) = ended {
            info!(%session_id, message_count, "chat session ended");
            self.inner.bus.emit(
                TOPIC_SESSION_EVENTS,
                session_id,
                SessionEventType::SessionEnded,
                json!({
                    "messageCount": message_count,
                    "conversationId": conversation_id,
                }),
            );
        }
    }

    /// Host teardown.
    pub fn shutdown(&self) {
        self.end_session();
    }
}

struct ClientInner {
    settings: ChatSettings,
    bus: Arc<EventBus>,
    config_source: Arc<dyn ConfigSource>,
    http: reqwest::Client,
    session: Mutex<Session>,
    signals: Mutex<ConnectSignals>,
    stream: Mutex<Option<StreamTask>>,
    revision: watch::Sender<u64>,
}

impl ClientInner {
    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn signals(&self) -> MutexGuard<'_, ConnectSignals> {
        self.signals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        self.revision.send_modify(|rev| *rev = rev.wrapping_add(1));
    }

    fn with_current<R>(
        &self,
        generation: u64,
        f: impl FnOnce(&mut Session) -> R,
    ) -> Result<R, ChatError> {
        let mut session = self.session();
        if session.generation != generation {
            return Err(ChatError::Abandoned);
        }
        Ok(f(&mut session))
    }

    fn ensure_current(&self, generation: u64) -> Result<(), ChatError> {
        self.with_current(generation, |_| ())
    }

    // -- connect sequence ---------------------------------------------------

    async fn connect(self: &Arc<Self>, generation: u64) -> Result<(), ChatError> {
        let deployment_id = self
            .settings
            .deployment_id()
            .map(str::to_string)
            .ok_or_else(|| {
                ChatError::Configuration("deployment id is not configured".to_string())
            })?;
        info!(%deployment_id, "connecting chat session");

        let metadata = self.config_source.fetch_metadata(&deployment_id).await?;
        self.ensure_current(generation)?;
        let api = MessagingApi::new(self.http.clone(), &metadata.token_endpoint_base);

        let grant = api.request_access_token(&metadata).await?;
        self.with_current(generation, |s| {
            s.access_token = Some(grant.access_token.clone());
            s.last_event_id = grant.last_event_id.clone();
            s.metadata = Some(metadata.clone());
            s.api = Some(api.clone());
        })?;

        let conversation_id = Uuid::new_v4().to_string();
        api.create_conversation(&grant.access_token, &conversation_id, &metadata.deployment_id)
            .await?;
        self.with_current(generation, |s| {
            s.conversation_id = Some(conversation_id.clone());
        })?;
        self.notify();

        let (active_rx, greeting_rx) = self.reset_signals();
        self.open_stream(generation, api, metadata.org_id.clone(), grant.access_token)
            .await?;

        self.wait_for_signal(active_rx, self.settings.active_wait(), "session activation")
            .await?;
        self.wait_for_signal(greeting_rx, self.settings.greeting_wait(), "agent greeting")
            .await?;
        self.ensure_current(generation)
    }

    fn reset_signals(&self) -> (watch::Receiver<bool>, watch::Receiver<bool>) {
        let mut signals = self.signals();
        *signals = ConnectSignals::new();
        (
            signals.session_active.subscribe(),
            signals.greeting.subscribe(),
        )
    }

    async fn wait_for_signal(
        &self,
        mut rx: watch::Receiver<bool>,
        limit: Duration,
        what: &'static str,
    ) -> Result<(), ChatError> {
        let wait = async move { rx.wait_for(|seen| *seen).await.map(|_| ()) };
        match tokio::time::timeout(limit, wait).await {
            Ok(Ok(())) => {
                debug!("{what} received");
                Ok(())
            }
            Ok(Err(_)) => {
                debug!("{what} signal superseded");
                Ok(())
            }
            Err(_) => match self.settings.connect_wait_policy() {
                ConnectWaitPolicy::Proceed => {
                    warn!("no {what} within {limit:?}; proceeding");
                    Ok(())
                }
                ConnectWaitPolicy::Fail => Err(ChatError::ConnectTimeout(what)),
            },
        }
    }

    async fn open_stream(
        self: &Arc<Self>,
        generation: u64,
        api: MessagingApi,
        org_id: String,
        access_token: String,
    ) -> Result<(), ChatError> {
        let cursor = self.session().last_event_id.clone();
        let response = api
            .open_event_stream(&access_token, &org_id, cursor.as_deref())
            .await?;

        let session = self.session();
        if session.generation != generation {
            return Err(ChatError::Abandoned);
        }
        let abort = AbortSignal::new();
        let worker = StreamWorker {
            inner: Arc::downgrade(self),
            generation,
            api,
            org_id,
            access_token,
            abort: abort.clone(),
            policy: RetryPolicy::stream_reconnect(self.settings.max_stream_reconnects()),
        };
        let handle = tokio::spawn(worker.run(response));
        self.replace_stream(Some(StreamTask { abort, handle }));
        drop(session);
        Ok(())
    }

    fn replace_stream(&self, task: Option<StreamTask>) {
        let previous = {
            let mut slot = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *slot, task)
        };
        if let Some(previous) = previous {
            previous.stop();
        }
    }

    fn stop_stream(&self) {
        self.replace_stream(None);
    }

    fn activate(&self, generation: u64) -> Result<(), ChatError> {
        let (session_id, conversation_id) = self.with_current(generation, |s| {
            s.state = ChatState::Active;
            s.session_started = true;
            s.opens_messaging_session = true;
            (s.session_id.clone(), s.conversation_id.clone())
        })?;
        self.notify();

        info!(%session_id, ?conversation_id, "chat session active");
        self.bus.emit(
            TOPIC_SESSION_EVENTS,
            session_id,
            SessionEventType::SessionStarted,
            json!({
                "conversationId": conversation_id,
                "deploymentId": self.settings.deployment_id(),
            }),
        );
        Ok(())
    }

    fn fail(&self, generation: u64, err: &ChatError) {
        let applied = self
            .with_current(generation, |s| {
                s.state = ChatState::Error;
                s.last_error = Some(err.to_string());
                s.is_typing = false;
            })
            .is_ok();
        if applied {
            self.stop_stream();
            self.notify();
            error!("chat connection failed: {err}");
        }
    }

    // -- active session -----------------------------------------------------

    /// `shown` means the entry is already in the transcript.
    async fn deliver(&self, text: &str, shown: bool) -> SendOutcome {
        let prepared = {
            let mut s = self.session();
            if s.state != ChatState::Active {
                return SendOutcome::Suppressed;
            }
            let (Some(api), Some(access_token), Some(conversation_id), Some(deployment_id)) = (
                s.api.clone(),
                s.access_token.clone(),
                s.conversation_id.clone(),
                s.metadata.as_ref().map(|m| m.deployment_id.clone()),
            ) else {
                warn!("active session is missing credentials");
                return SendOutcome::DeliveryFailed("session credentials are missing".to_string());
            };

            if !shown {
                s.transcript
                    .push(TranscriptEntry::new(ParticipantRole::EndUser, text));
            }
            s.message_count += 1;
            s.started_at.get_or_insert_with(Utc::now);
            s.is_typing = true;
            PreparedSend {
                generation: s.generation,
                session_id: s.session_id.clone(),
                conversation_id,
                deployment_id,
                access_token,
                api,
                message_count: s.message_count,
                opens_messaging_session: std::mem::take(&mut s.opens_messaging_session),
            }
        };
        self.notify();

        self.bus.emit(
            TOPIC_SESSION_EVENTS,
            prepared.session_id.clone(),
            SessionEventType::MessageSent,
            json!({
                "conversationId": prepared.conversation_id,
                "messageCount": prepared.message_count,
                "isNewMessagingSession": prepared.opens_messaging_session,
            }),
        );

        let request = SendMessageRequest::text(
            Uuid::new_v4().to_string(),
            text,
            prepared.deployment_id.clone(),
            prepared.opens_messaging_session,
            self.settings.language(),
        );
        match prepared
            .api
            .send_message(&prepared.access_token, &prepared.conversation_id, &request)
            .await
        {
            Ok(()) => {
                debug!(message_id = %request.message.id, "message delivered");
                SendOutcome::Delivered
            }
            Err(e) => {
                warn!("message send failed: {e}");
                let _ = self.with_current(prepared.generation, |s| {
                    s.is_typing = false;
                    s.transcript.push(TranscriptEntry::new(
                        ParticipantRole::System,
                        format!("{SEND_FAILURE_NOTICE}: {e}"),
                    ));
                });
                self.notify();
                SendOutcome::DeliveryFailed(e.to_string())
            }
        }
    }

    fn handle_protocol_event(&self, generation: u64, event: ProtocolEvent) {
        match event {
            ProtocolEvent::Message { role, .. } if role.is_end_user() => {
                trace!("ignoring echoed end-user message");
            }
            ProtocolEvent::Message { role, text } => {
                let Ok((session_id, conversation_id, message_count)) =
                    self.with_current(generation, |s| {
                        s.transcript.push(TranscriptEntry::new(role.clone(), text));
                        s.message_count += 1;
                        s.is_typing = false;
                        (
                            s.session_id.clone(),
                            s.conversation_id.clone(),
                            s.message_count,
                        )
                    })
                else {
                    return;
                };
                self.notify();
                self.bus.emit(
                    TOPIC_SESSION_EVENTS,
                    session_id,
                    SessionEventType::MessageReceived,
                    json!({
                        "role": role.as_str(),
                        "conversationId": conversation_id,
                        "messageCount": message_count,
                    }),
                );
                self.signals().greeting.send_replace(true);
            }
            ProtocolEvent::TypingStarted { role } | ProtocolEvent::TypingStopped { role }
                if role.is_end_user() => {}
            ProtocolEvent::TypingStarted { .. } => self.set_typing(generation, true),
            ProtocolEvent::TypingStopped { .. } => self.set_typing(generation, false),
            ProtocolEvent::SessionStatusChanged { status, .. } => {
                if status.eq_ignore_ascii_case("active") {
                    self.signals().session_active.send_replace(true);
                } else {
                    debug!("conversation status changed to {status}");
                }
            }
        }
    }

    fn set_typing(&self, generation: u64, typing: bool) {
        let changed = self
            .with_current(generation, |s| std::mem::replace(&mut s.is_typing, typing) != typing)
            .unwrap_or(false);
        if changed {
            self.notify();
        }
    }

    fn record_cursor(&self, generation: u64, last_event_id: &str) {
        let _ = self.with_current(generation, |s| {
            advance_event_id(&mut s.last_event_id, last_event_id)
        });
    }

    fn stream_is_wanted(&self, generation: u64) -> bool {
        let session = self.session();
        session.generation == generation
            && matches!(session.state, ChatState::Connecting | ChatState::Active)
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        let task = self
            .stream
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.stop();
        }
    }
}

// ---------------------------------------------------------------------------
// Stream worker
// ---------------------------------------------------------------------------

/// Background task that reads the live event stream and reopens it with
/// `Last-Event-ID` when the server drops it.
struct StreamWorker {
    inner: Weak<ClientInner>,
    generation: u64,
    api: MessagingApi,
    org_id: String,
    access_token: String,
    abort: AbortSignal,
    policy: RetryPolicy,
}

impl StreamWorker {
    async fn run(self, first: reqwest::Response) {
        let mut response = first;
        let mut failures = 0u32;
        loop {
            let mut decoder = SseDecoder::resume_from(self.cursor());
            let mut sink = ClientSink {
                inner: self.inner.clone(),
                generation: self.generation,
                delivered: 0,
            };
            let end =
                read_event_stream(response.bytes_stream(), &mut decoder, &self.abort, &mut sink)
                    .await;
            if sink.delivered > 0 {
                failures = 0;
            }

            match end {
                StreamEnd::Aborted => {
                    debug!("event stream aborted");
                    return;
                }
                StreamEnd::Eof => info!("event stream closed by server"),
                StreamEnd::Failed(e) => warn!("event stream dropped: {e}"),
            }

            response = match self.reconnect(&mut failures).await {
                Some(next) => next,
                None => return,
            };
        }
    }

    async fn reconnect(&self, failures: &mut u32) -> Option<reqwest::Response> {
        loop {
            if *failures >= self.policy.max_attempts {
                if self.policy.max_attempts > 0 {
                    warn!(attempts = *failures, "giving up on event stream");
                }
                return None;
            }
            let wanted = self
                .inner
                .upgrade()
                .is_some_and(|inner| inner.stream_is_wanted(self.generation));
            if !wanted {
                return None;
            }

            let delay = self.policy.delay_for(*failures);
            *failures += 1;
            warn!(attempt = *failures, "reopening event stream in {delay:?}");
            tokio::select! {
                biased;
                _ = self.abort.aborted() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            let cursor = self.cursor();
            match self
                .api
                .open_event_stream(&self.access_token, &self.org_id, cursor.as_deref())
                .await
            {
                Ok(response) => return Some(response),
                Err(e) => warn!("event stream reconnect failed: {e}"),
            }
        }
    }

    fn cursor(&self) -> Option<String> {
        self.inner
            .upgrade()
            .and_then(|inner| inner.session().last_event_id.clone())
    }
}

struct ClientSink {
    inner: Weak<ClientInner>,
    generation: u64,
    delivered: usize,
}

impl StreamSink for ClientSink {
    fn on_event(&mut self, event: ProtocolEvent) {
        self.delivered += 1;
        if let Some(inner) = self.inner.upgrade() {
            inner.handle_protocol_event(self.generation, event);
        }
    }

    fn on_cursor(&mut self, last_event_id: &str) {
        if let Some(inner) = self.inner.upgrade() {
            inner.record_cursor(self.generation, last_event_id);
        }
    }
}
