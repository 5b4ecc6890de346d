//! Broadcast channel for live feed updates
//!
//! Fire-and-forget fan-out of mutation events to connected WebSocket clients.
//! Nothing is retained: a client that is not connected when an event is
//! published never sees it.

pub mod hub;
pub mod relay;

pub use hub::{SocketHub, Subscription};
pub use relay::NatsRelay;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Ephemeral event pushed to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastEvent {
    /// Event name, e.g. "update post"
    pub event: String,
    /// Event payload: the entity snapshot or a bare id
    pub data: Value,
    /// Room scoping the event; `None` reaches every subscriber
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
}

impl BroadcastEvent {
    pub fn new(event: impl Into<String>, data: Value, topic: Option<&str>) -> Self {
        Self {
            event: event.into(),
            data,
            topic: topic.map(str::to_string),
        }
    }
}

/// Broadcast adapter.
///
/// `publish` never blocks on subscribers and never reports delivery problems
/// back to the caller.
pub trait Broadcaster: Send + Sync {
    fn publish(&self, event: BroadcastEvent);
}
