//! Cross-instance broadcast relay
//!
//! Local publishes go to the local hub first and are then mirrored onto the
//! `feed.events` subject. Events arriving from other instances are replayed
//! into the local hub so a client connected anywhere sees every event.
//! Mirroring runs on one task fed by a channel, so remote instances see
//! events in publish order.

use bytes::Bytes;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{BroadcastEvent, Broadcaster, SocketHub};
use crate::nats::NatsClient;
use crate::types::Result;

/// Subject carrying mirrored broadcast events
pub const EVENTS_SUBJECT: &str = "feed.events";

/// Events waiting to be mirrored before new ones are dropped
const OUTBOUND_CAPACITY: usize = 1024;

/// Wire envelope tagging an event with the instance that produced it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayEnvelope {
    pub origin: String,
    #[serde(flatten)]
    pub event: BroadcastEvent,
}

/// Broadcaster that fans out locally and across instances
pub struct NatsRelay {
    hub: Arc<SocketHub>,
    nats: NatsClient,
    node_id: String,
    outbound: mpsc::Sender<Bytes>,
}

impl NatsRelay {
    /// Must be called inside a tokio runtime; starts the mirroring task
    pub fn new(hub: Arc<SocketHub>, nats: NatsClient, node_id: impl Into<String>) -> Self {
        let (outbound, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let client = nats.clone();
        tokio::spawn(forward(rx, move |payload| {
            let client = client.clone();
            async move { client.publish(EVENTS_SUBJECT, payload).await }
        }));

        Self {
            hub,
            nats,
            node_id: node_id.into(),
            outbound,
        }
    }

    /// Start replaying remote events into the local hub
    pub async fn spawn_listener(&self) -> Result<tokio::task::JoinHandle<()>> {
        let mut subscriber = self.nats.subscribe(EVENTS_SUBJECT).await?;
        let hub = Arc::clone(&self.hub);
        let node_id = self.node_id.clone();

        info!(subject = EVENTS_SUBJECT, "Broadcast relay listening");

        Ok(tokio::spawn(async move {
            while let Some(message) = subscriber.next().await {
                match serde_json::from_slice::<RelayEnvelope>(&message.payload) {
                    Ok(envelope) if envelope.origin == node_id => {}
                    Ok(envelope) => {
                        debug!(origin = %envelope.origin, event = %envelope.event.event, "Relayed event");
                        hub.publish(envelope.event);
                    }
                    Err(e) => warn!(error = %e, "Dropping malformed relay event"),
                }
            }
            warn!("Broadcast relay subscription closed");
        }))
    }
}

impl Broadcaster for NatsRelay {
    fn publish(&self, event: BroadcastEvent) {
        let envelope = RelayEnvelope {
            origin: self.node_id.clone(),
            event: event.clone(),
        };
        self.hub.publish(event);

        let payload = match serde_json::to_vec(&envelope) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to encode relay event");
                return;
            }
        };
        match self.outbound.try_send(Bytes::from(payload)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Broadcast relay backlog full, event not mirrored");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Broadcast relay stopped, event not mirrored");
            }
        }
    }
}

/// Publish queued payloads one at a time, in arrival order
async fn forward<F, Fut>(mut rx: mpsc::Receiver<Bytes>, mut send: F)
where
    F: FnMut(Bytes) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    while let Some(payload) = rx.recv().await {
        if let Err(e) = send(payload).await {
            warn!(error = %e, "Failed to mirror broadcast event");
        }
    }
    debug!("Broadcast relay outbound channel closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_is_flat_on_the_wire() {
        let envelope = RelayEnvelope {
            origin: "node-a".into(),
            event: BroadcastEvent::new("update notification", json!("n9"), None),
        };
        let wire = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            wire,
            json!({"origin": "node-a", "event": "update notification", "data": "n9"})
        );

        let back: RelayEnvelope = serde_json::from_value(wire).unwrap();
        assert_eq!(back.event.topic, None);
    }

    #[tokio::test]
    async fn test_mirrored_events_keep_publish_order() {
        let (tx, rx) = mpsc::channel(8);
        let sent = Arc::new(std::sync::Mutex::new(Vec::new()));
        let record = Arc::clone(&sent);
        let task = tokio::spawn(forward(rx, move |payload: Bytes| {
            let record = Arc::clone(&record);
            async move {
                // The first publish is the slowest
                if payload.as_ref() == b"add post" {
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                }
                record.lock().unwrap().push(payload);
                Ok(())
            }
        }));

        for event in ["add post", "update post", "delete post"] {
            tx.try_send(Bytes::from(event)).unwrap();
        }
        drop(tx);
        task.await.unwrap();

        let sent: Vec<Bytes> = sent.lock().unwrap().clone();
        assert_eq!(
            sent,
            vec![
                Bytes::from("add post"),
                Bytes::from("update post"),
                Bytes::from("delete post")
            ]
        );
    }
}
