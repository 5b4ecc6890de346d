//! WebSocket fan-out hub
//!
//! Every connection holds a [`Subscription`] on one tokio broadcast channel
//! and filters events by the rooms it joined.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::{BroadcastEvent, Broadcaster};

/// Default channel capacity before slow subscribers start lagging
pub const DEFAULT_CAPACITY: usize = 1024;

/// Hub for broadcasting feed events to connected clients
pub struct SocketHub {
    sender: broadcast::Sender<Arc<BroadcastEvent>>,
    connected: Arc<AtomicUsize>,
    published: AtomicU64,
}

impl SocketHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            connected: Arc::new(AtomicUsize::new(0)),
            published: AtomicU64::new(0),
        }
    }

    /// Open a subscription with no rooms joined (topic-less events only)
    pub fn subscribe(&self) -> Subscription {
        self.connected.fetch_add(1, Ordering::Relaxed);
        Subscription {
            receiver: self.sender.subscribe(),
            rooms: HashSet::new(),
            connected: Arc::clone(&self.connected),
        }
    }

    /// Number of live subscriptions
    pub fn connected_count(&self) -> usize {
        self.connected.load(Ordering::Relaxed)
    }

    /// Total events published through this hub
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl Default for SocketHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Broadcaster for SocketHub {
    fn publish(&self, event: BroadcastEvent) {
        self.published.fetch_add(1, Ordering::Relaxed);
        debug!(event = %event.event, topic = ?event.topic, "Broadcasting");
        // Err only means nobody is listening
        let _ = self.sender.send(Arc::new(event));
    }
}

/// One subscriber's view of the hub
pub struct Subscription {
    receiver: broadcast::Receiver<Arc<BroadcastEvent>>,
    rooms: HashSet<String>,
    connected: Arc<AtomicUsize>,
}

impl Subscription {
    pub fn join(&mut self, topic: impl Into<String>) {
        self.rooms.insert(topic.into());
    }

    pub fn leave(&mut self, topic: &str) {
        self.rooms.remove(topic);
    }

    pub fn rooms(&self) -> &HashSet<String> {
        &self.rooms
    }

    fn wants(&self, event: &BroadcastEvent) -> bool {
        match &event.topic {
            Some(topic) => self.rooms.contains(topic),
            None => true,
        }
    }

    /// Next event addressed to this subscriber; `None` once the hub is gone
    pub async fn next(&mut self) -> Option<Arc<BroadcastEvent>> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.wants(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped = skipped, "Subscriber lagged, events dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.connected.fetch_sub(1, Ordering::Relaxed);
    }
}
