//! In-process event bus carrying chat session events.
//!
//! The chat client publishes lifecycle and message events; any number of
//! listeners (the activity batcher among them) subscribe per topic.
//!
//! # Architecture
//!
//! - `EventBus`: synchronous topic publish/subscribe, failures isolated per handler
//! - `Subscription`: disposable handle, unsubscribes on drop
//! - `event_types`: topic names and the `SessionEventType` tags

mod event_bus;
pub mod event_types;

pub use event_bus::{BusHandler, BusMessage, EventBus, Subscription};
pub use event_types::{SessionEventType, TOPIC_SESSION_EVENTS};
