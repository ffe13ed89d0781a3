use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::event_types::SessionEventType;

/// One message on a bus topic. `data` is a JSON document encoded as a string
/// so subscribers decide how much of it to decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusMessage {
    pub session_id: String,
    pub event_type: SessionEventType,
    pub timestamp: String,
    pub data: String,
}

impl BusMessage {
    pub fn new(
        session_id: impl Into<String>,
        event_type: SessionEventType,
        data: serde_json::Value,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            event_type,
            timestamp: Utc::now().to_rfc3339(),
            data: data.to_string(),
        }
    }

    /// Decoded `data`, or `None` when it is not valid JSON.
    pub fn data_json(&self) -> Option<serde_json::Value> {
        serde_json::from_str(&self.data).ok()
    }
}

pub type BusHandler = Arc<dyn Fn(&BusMessage) -> Result<(), String> + Send + Sync>;

struct Subscriber {
    id: u64,
    handler: BusHandler,
}

#[derive(Default)]
struct BusInner {
    topics: DashMap<String, Vec<Subscriber>>,
    next_id: AtomicU64,
}

/// Synchronous in-process publish/subscribe.
///
/// Delivery happens on the publisher's call stack, in subscription order.
/// There is no replay: a subscriber only sees messages published while it is
/// registered.
#[derive(Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `topic`. The returned handle removes the handler
    /// when unsubscribed or dropped.
    pub fn subscribe<F>(&self, topic: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&BusMessage) -> Result<(), String> + Send + Sync + 'static,
    {
        let topic = topic.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .topics
            .entry(topic.clone())
            .or_default()
            .push(Subscriber {
                id,
                handler: Arc::new(handler),
            });
        tracing::debug!(topic = %topic, subscriber = id, "bus subscription added");
        Subscription {
            topic,
            id,
            bus: Arc::downgrade(&self.inner),
            active: AtomicBool::new(true),
        }
    }

    /// Deliver `message` to every current subscriber of `topic`.
    ///
    /// A failing or panicking handler is logged and skipped; later handlers
    /// still run. Returns the number of handlers that accepted the message.
    pub fn publish(&self, topic: &str, message: &BusMessage) -> usize {
        // Snapshot the handlers so the map shard is not locked while they run;
        // handlers are free to publish, subscribe or unsubscribe.
        let handlers: Vec<(u64, BusHandler)> = match self.inner.topics.get(topic) {
            Some(subscribers) => subscribers
                .iter()
                .map(|s| (s.id, s.handler.clone()))
                .collect(),
            None => Vec::new(),
        };

        if handlers.is_empty() {
            tracing::trace!(topic, event_type = %message.event_type, "no subscribers");
            return 0;
        }

        let mut delivered = 0;
        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(message))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    tracing::warn!(topic, subscriber = id, "bus handler failed: {e}");
                }
                Err(_) => {
                    tracing::error!(topic, subscriber = id, "bus handler panicked");
                }
            }
        }
        delivered
    }

    /// Convenience: build and publish a message in one call.
    pub fn emit(
        &self,
        topic: &str,
        session_id: impl Into<String>,
        event_type: SessionEventType,
        data: serde_json::Value,
    ) -> BusMessage {
        let message = BusMessage::new(session_id, event_type, data);
        self.publish(topic, &message);
        message
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner.topics.get(topic).map_or(0, |subs| subs.len())
    }
}

/// Disposable registration handle returned by [`EventBus::subscribe`].
pub struct Subscription {
    topic: String,
    id: u64,
    bus: Weak<BusInner>,
    active: AtomicBool,
}

impl Subscription {
    /// Remove the handler. Safe to call any number of times.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        let Some(bus) = self.bus.upgrade() else {
            return;
        };
        if let Some(mut subscribers) = bus.topics.get_mut(&self.topic) {
            subscribers.retain(|s| s.id != self.id);
        }
        tracing::debug!(topic = %self.topic, subscriber = self.id, "bus subscription removed");
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::bus::TOPIC_SESSION_EVENTS;

    fn collector() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> BusHandler) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_for_factory = seen.clone();
        let factory = move |label: &str| -> BusHandler {
            let seen = seen_for_factory.clone();
            let label = label.to_string();
            Arc::new(move |msg: &BusMessage| {
                seen.lock()
                    .unwrap()
                    .push(format!("{label}:{}", msg.event_type));
                Ok(())
            })
        };
        (seen, factory)
    }

    #[test]
    fn publish_delivers_in_subscription_order() {
        let bus = EventBus::new();
        let (seen, make) = collector();
        let first = make("a");
        let second = make("b");
        let _a = bus.subscribe(TOPIC_SESSION_EVENTS, move |m| first(m));
        let _b = bus.subscribe(TOPIC_SESSION_EVENTS, move |m| second(m));

        let delivered = bus.publish(
            TOPIC_SESSION_EVENTS,
            &BusMessage::new("s-1", SessionEventType::MessageSent, json!({})),
        );

        assert_eq!(delivered, 2);
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["a:MessageSent".to_string(), "b:MessageSent".to_string()]
        );
    }

    #[test]
    fn failing_and_panicking_handlers_do_not_block_later_subscribers() {
        let bus = EventBus::new();
        let (seen, make) = collector();
        let last = make("last");
        let _err = bus.subscribe(TOPIC_SESSION_EVENTS, |_| Err("boom".to_string()));
        let _panic = bus.subscribe(TOPIC_SESSION_EVENTS, |_| panic!("handler exploded"));
        let _ok = bus.subscribe(TOPIC_SESSION_EVENTS, move |m| last(m));

        let delivered = bus.publish(
            TOPIC_SESSION_EVENTS,
            &BusMessage::new("s-1", SessionEventType::LinkClick, json!({})),
        );

        assert_eq!(delivered, 1);
        assert_eq!(*seen.lock().unwrap(), vec!["last:LinkClick".to_string()]);
    }

    #[test]
    fn late_subscribers_never_see_earlier_messages() {
        let bus = EventBus::new();
        bus.emit(TOPIC_SESSION_EVENTS, "s-1", SessionEventType::SessionStarted, json!({}));

        let (seen, make) = collector();
        let handler = make("late");
        let _sub = bus.subscribe(TOPIC_SESSION_EVENTS, move |m| handler(m));
        assert!(seen.lock().unwrap().is_empty());

        bus.emit(TOPIC_SESSION_EVENTS, "s-1", SessionEventType::SessionEnded, json!({}));
        assert_eq!(*seen.lock().unwrap(), vec!["late:SessionEnded".to_string()]);
    }

    #[test]
    fn unsubscribe_is_idempotent_and_drop_unsubscribes() {
        let bus = EventBus::new();
        let sub = bus.subscribe(TOPIC_SESSION_EVENTS, |_| Ok(()));
        let other = bus.subscribe(TOPIC_SESSION_EVENTS, |_| Ok(()));
        assert_eq!(bus.subscriber_count(TOPIC_SESSION_EVENTS), 2);

        sub.unsubscribe();
        sub.unsubscribe();
        assert!(!sub.is_active());
        assert_eq!(bus.subscriber_count(TOPIC_SESSION_EVENTS), 1);

        drop(other);
        assert_eq!(bus.subscriber_count(TOPIC_SESSION_EVENTS), 0);
        drop(sub);
    }

    #[test]
    fn topics_are_isolated() {
        let bus = EventBus::new();
        let (seen, make) = collector();
        let handler = make("x");
        let _sub = bus.subscribe("other/topic", move |m| handler(m));

        let delivered = bus.publish(
            TOPIC_SESSION_EVENTS,
            &BusMessage::new("s-1", SessionEventType::FormSubmit, json!({})),
        );
        assert_eq!(delivered, 0);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn data_json_decodes_the_payload() {
        let msg = BusMessage::new(
            "s-1",
            SessionEventType::SessionEnded,
            json!({"messageCount": 3}),
        );
        assert_eq!(msg.data_json().unwrap()["messageCount"], 3);

        let broken = BusMessage {
            data: "{not json".to_string(),
            ..msg
        };
        assert!(broken.data_json().is_none());
    }
}
