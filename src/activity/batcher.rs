use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use super::gateway::PersistenceGateway;
use super::types::{EngagementEvent, SessionActivityRecord};
use crate::bus::{BusMessage, EventBus, SessionEventType, Subscription, TOPIC_SESSION_EVENTS};
use crate::config::TrackingOptions;

/// Ended session ids remembered so late events for them are dropped.
const ENDED_HISTORY: usize = 32;

/// Turns the session event stream into one upserted record per session.
///
/// - A flush happens once `flush_threshold` events are unflushed, when the
///   `flush_interval` timer fires with events pending, when the session ends,
///   and when the host is hidden or torn down.
/// - Each flush sends the entire log. A failed flush keeps everything and is
///   retried by the next trigger.
/// - A new session flushes the previous one first. If that write fails the
///   previous session is parked and retried by every later trigger until its
///   upsert succeeds.
pub struct ActivityBatcher {
    inner: Arc<BatcherInner>,
    subscription: Option<Subscription>,
}

impl ActivityBatcher {
    /// Subscribe a batcher to the session events topic of `bus`.
    pub fn start(
        bus: &EventBus,
        gateway: Arc<dyn PersistenceGateway>,
        options: TrackingOptions,
    ) -> Self {
        let mut batcher = Self::new(gateway, options);
        let inner = batcher.inner.clone();
        batcher.subscription = Some(bus.subscribe(TOPIC_SESSION_EVENTS, move |msg| {
            inner.handle_message(msg);
            Ok(())
        }));
        tracing::debug!("activity batcher subscribed to {TOPIC_SESSION_EVENTS}");
        batcher
    }

    /// A batcher fed through [`ActivityBatcher::handle_message`].
    pub fn new(gateway: Arc<dyn PersistenceGateway>, options: TrackingOptions) -> Self {
        Self {
            inner: Arc::new(BatcherInner {
                gateway,
                options,
                state: Mutex::new(BatcherState::default()),
            }),
            subscription: None,
        }
    }

    pub fn handle_message(&self, msg: &BusMessage) {
        self.inner.handle_message(msg);
    }

    /// Flush pending events when the host is hidden. Becoming visible is a no-op.
    pub fn on_visibility_change(&self, hidden: bool) {
        if hidden {
            self.inner.flush_pending("visibility");
        }
    }

    /// Flush pending events, stop the timer, and stop listening. Idempotent.
    pub fn teardown(&self) {
        if let Some(subscription) = &self.subscription {
            subscription.unsubscribe();
        }
        self.inner.flush_pending("teardown");
        let mut state = self.inner.state();
        state.cancel_timer();
    }

    pub fn current_session(&self) -> Option<String> {
        let state = self.inner.state();
        state.current.as_ref().map(|s| s.session_id.clone())
    }

    /// Events appended since the last successful flush.
    pub fn unflushed(&self) -> usize {
        let state = self.inner.state();
        state.current.as_ref().map_or(0, |s| s.unflushed)
    }
}

impl Drop for ActivityBatcher {
    fn drop(&mut self) {
        self.teardown();
    }
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

struct BatcherInner {
    gateway: Arc<dyn PersistenceGateway>,
    options: TrackingOptions,
    state: Mutex<BatcherState>,
}

#[derive(Default)]
struct BatcherState {
    current: Option<TrackedSession>,
    /// Sessions replaced before their last write succeeded.
    replaced: VecDeque<TrackedSession>,
    ended: VecDeque<String>,
    timer: Option<JoinHandle<()>>,
    /// Bumped whenever the timer is re-armed; a firing timer with an older
    /// epoch has been superseded.
    timer_epoch: u64,
}

impl BatcherState {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn remember_ended(&mut self, session_id: &str) {
        if self.ended.len() == ENDED_HISTORY {
            self.ended.pop_front();
        }
        self.ended.push_back(session_id.to_string());
    }

    fn is_ended(&self, session_id: &str) -> bool {
        self.ended.iter().any(|id| id == session_id)
    }

    fn is_live(&self) -> bool {
        self.current.as_ref().is_some_and(|s| s.ended_at.is_none())
    }

    fn has_pending(&self) -> bool {
        !self.replaced.is_empty() || self.current.as_ref().is_some_and(TrackedSession::is_pending)
    }
}

struct TrackedSession {
    session_id: String,
    started_at: DateTime<Utc>,
    events: Vec<EngagementEvent>,
    message_count: u64,
    last_flush: Option<DateTime<Utc>>,
    unflushed: usize,
    ended_at: Option<DateTime<Utc>>,
    /// The terminal `SessionEnded` write has not succeeded yet.
    end_pending: bool,
}

impl TrackedSession {
    fn new(session_id: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.to_string(),
            started_at,
            events: Vec::new(),
            message_count: 0,
            last_flush: None,
            unflushed: 0,
            ended_at: None,
            end_pending: false,
        }
    }

    fn is_pending(&self) -> bool {
        self.unflushed > 0 || self.end_pending
    }

    fn record(&self, options: &TrackingOptions) -> SessionActivityRecord {
        let event_type = if self.ended_at.is_some() {
            SessionEventType::SessionEnded
        } else {
            SessionEventType::SessionUpdated
        };
        let until = self.ended_at.unwrap_or_else(Utc::now);
        SessionActivityRecord {
            session_id: self.session_id.clone(),
            event_type,
            started_at: self.started_at,
            event_count: self.events.len(),
            message_count: self.message_count,
            time_in_chat_seconds: options
                .track_time_in_chat
                .then(|| (until - self.started_at).num_seconds().max(0)),
            session_end_time: self.ended_at,
            source: options.source.clone(),
            events: self.events.clone(),
        }
    }
}

fn message_timestamp(msg: &BusMessage) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&msg.timestamp)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl BatcherInner {
    fn state(&self) -> MutexGuard<'_, BatcherState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle_message(self: &Arc<Self>, msg: &BusMessage) {
        let kind = msg.event_type;
        let timestamp = message_timestamp(msg);
        let payload = msg.data_json().filter(|v| !v.is_null());

        let mut state = self.state();
        if state.is_ended(&msg.session_id) {
            tracing::trace!(session_id = %msg.session_id, "ignoring {kind} for ended session");
            return;
        }

        let tracked = state
            .current
            .as_ref()
            .is_some_and(|s| s.session_id == msg.session_id && s.ended_at.is_none());
        if !tracked {
            self.flush_before_reset(&mut state);
            tracing::debug!(session_id = %msg.session_id, "tracking new session");
            state.current = Some(TrackedSession::new(&msg.session_id, timestamp));
            self.arm_timer(&mut state);
        }

        let Some(session) = state.current.as_mut() else {
            return;
        };
        if kind.is_message() {
            session.message_count += 1;
        }
        if kind == SessionEventType::SessionEnded {
            let reported = payload
                .as_ref()
                .and_then(|p| p.get("messageCount"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            session.message_count = session.message_count.max(reported);
        }
        if self.options.tracks(kind) {
            session.events.push(EngagementEvent {
                event_type: kind,
                timestamp,
                source: self.options.source.clone(),
                payload,
            });
            session.unflushed += 1;
        }

        if kind == SessionEventType::SessionEnded {
            session.ended_at = Some(timestamp);
            session.end_pending = true;
            let session_id = session.session_id.clone();
            state.cancel_timer();
            state.remember_ended(&session_id);
            self.flush(&mut state);
        } else if session.unflushed >= self.options.flush_threshold {
            if self.flush(&mut state) {
                self.arm_timer(&mut state);
            }
        }
    }

    /// Flush the session being replaced so its tail is not lost. A failed
    /// write parks it in `replaced`.
    fn flush_before_reset(&self, state: &mut BatcherState) {
        state.cancel_timer();
        self.retry_replaced(state);
        let Some(mut previous) = state.current.take() else {
            return;
        };
        if previous.is_pending() && !self.write(&mut previous) {
            tracing::warn!(
                session_id = %previous.session_id,
                events = previous.events.len(),
                "replaced session not persisted, will retry"
            );
            state.replaced.push_back(previous);
        }
    }

    /// Retry every parked session. Sessions leave the list only once written.
    fn retry_replaced(&self, state: &mut BatcherState) {
        let parked = std::mem::take(&mut state.replaced);
        for mut session in parked {
            if !self.write(&mut session) {
                state.replaced.push_back(session);
            }
        }
    }

    fn flush_pending(self: &Arc<Self>, reason: &str) {
        let mut state = self.state();
        if !state.has_pending() {
            return;
        }
        tracing::debug!("flushing activity on {reason}");
        if self.flush(&mut state) && state.is_live() {
            self.arm_timer(&mut state);
        }
    }

    /// Write parked sessions, then the current session's full record if it
    /// has anything unwritten. Returns false when the current write failed;
    /// its log is kept for the next trigger.
    fn flush(&self, state: &mut BatcherState) -> bool {
        self.retry_replaced(state);
        match state.current.as_mut() {
            Some(session) if session.is_pending() => self.write(session),
            _ => true,
        }
    }

    fn write(&self, session: &mut TrackedSession) -> bool {
        let record = session.record(&self.options);
        match self.gateway.upsert(&session.session_id, &record) {
            Ok(()) => {
                session.unflushed = 0;
                session.last_flush = Some(Utc::now());
                if record.is_final() {
                    session.end_pending = false;
                }
                tracing::debug!(
                    session_id = %session.session_id,
                    event_type = %record.event_type,
                    events = record.event_count,
                    "activity flushed"
                );
                true
            }
            Err(e) => {
                tracing::warn!(
                    session_id = %session.session_id,
                    unflushed = session.unflushed,
                    "activity flush failed, keeping log for retry: {e}"
                );
                false
            }
        }
    }

    /// (Re)start the time trigger. Without a tokio runtime only the other
    /// triggers are available.
    fn arm_timer(self: &Arc<Self>, state: &mut BatcherState) {
        state.cancel_timer();
        let Ok(runtime) = Handle::try_current() else {
            tracing::debug!("no async runtime, time-based flush disabled");
            return;
        };
        state.timer_epoch += 1;
        let epoch = state.timer_epoch;
        let interval = self.options.flush_interval;
        let weak = Arc::downgrade(self);
        state.timer = Some(runtime.spawn(async move {
            tokio::time::sleep(interval).await;
            if let Some(inner) = weak.upgrade() {
                inner.on_timer(epoch);
            }
        }));
    }

    fn on_timer(self: &Arc<Self>, epoch: u64) {
        let mut state = self.state();
        if state.timer_epoch != epoch {
            return;
        }
        // This task is finishing; dropping the handle must not abort it.
        state.timer = None;
        if !state.is_live() {
            self.retry_replaced(&mut state);
            return;
        }
        if state.has_pending() {
            self.flush(&mut state);
        }
        self.arm_timer(&mut state);
    }
}
