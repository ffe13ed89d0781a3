//! Engagement tracking: buffers session events from the bus and persists one
//! aggregated record per session.

mod batcher;
pub mod gateway;
pub mod types;

pub use batcher::ActivityBatcher;
pub use gateway::{MemoryGateway, PersistenceError, PersistenceGateway};
pub use types::{EngagementEvent, SessionActivityRecord};
