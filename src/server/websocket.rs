//! WebSocket subscriber endpoint
//!
//! ## Protocol
//!
//! Connect: `ws://host:8080/ws` (optionally `?topic=posts` to join a room
//! right away)
//!
//! Client → server:
//! - `{"type": "join", "topic": "posts"}`
//! - `{"type": "leave", "topic": "posts"}`
//! - `{"type": "ping"}`
//!
//! Server → client:
//! - `{"event": "update post", "data": {..}, "topic": "posts"}`
//! - `{"type": "pong"}`
//!
//! Events without a topic reach every connection.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use hyper_tungstenite::tungstenite::Message as WsMessage;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::broadcast::SocketHub;
use crate::server::http::AppState;
use crate::types::Result;

/// WebSocket type after upgrade
type HyperWebSocket =
    hyper_tungstenite::WebSocketStream<hyper_util::rt::TokioIo<hyper::upgrade::Upgraded>>;

/// Messages accepted from subscribers
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Join { topic: String },
    Leave { topic: String },
    Ping,
}

/// Query string accepted on connect
#[derive(Debug, Default, Deserialize)]
struct ConnectQuery {
    topic: Option<String>,
}

/// Handle WebSocket upgrade for the feed
pub async fn handle_feed_upgrade(
    state: Arc<AppState>,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    if !hyper_tungstenite::is_upgrade_request(&req) {
        return Response::builder()
            .status(StatusCode::BAD_REQUEST)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(
                r#"{"error": "bad_request", "message": "WebSocket upgrade required"}"#,
            )))
            .unwrap();
    }

    let query: ConnectQuery = req
        .uri()
        .query()
        .and_then(|q| serde_urlencoded::from_str(q).ok())
        .unwrap_or_default();

    let (response, websocket) = match hyper_tungstenite::upgrade(req, None) {
        Ok((resp, ws)) => (resp, ws),
        Err(e) => {
            error!("WebSocket upgrade failed: {}", e);
            return Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Full::new(Bytes::from("WebSocket upgrade failed")))
                .unwrap();
        }
    };

    let hub = Arc::clone(&state.hub);
    tokio::spawn(async move {
        match websocket.await {
            Ok(ws) => {
                if let Err(e) = handle_connection(ws, hub, query.topic).await {
                    warn!("Feed WebSocket error: {}", e);
                }
            }
            Err(e) => {
                error!("WebSocket connection failed: {}", e);
            }
        }
    });

    let (parts, _body) = response.into_parts();
    Response::from_parts(parts, Full::new(Bytes::new()))
}

async fn handle_connection(
    ws: HyperWebSocket,
    hub: Arc<SocketHub>,
    initial_topic: Option<String>,
) -> Result<()> {
    let (mut sender, mut receiver) = ws.split();
    let mut subscription = hub.subscribe();
    if let Some(topic) = initial_topic {
        subscription.join(topic);
    }

    info!(
        "Feed WebSocket client connected ({} connected)",
        hub.connected_count()
    );

    loop {
        tokio::select! {
            event = subscription.next() => {
                let Some(event) = event else { break };
                let json = serde_json::to_string(event.as_ref())?;
                if sender.send(WsMessage::Text(json)).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(ClientMessage::Join { topic }) => {
                                debug!("Client joined {}", topic);
                                subscription.join(topic);
                            }
                            Ok(ClientMessage::Leave { topic }) => {
                                debug!("Client left {}", topic);
                                subscription.leave(&topic);
                            }
                            Ok(ClientMessage::Ping) => {
                                let pong = serde_json::json!({"type": "pong"});
                                let _ = sender.send(WsMessage::Text(pong.to_string())).await;
                            }
                            Err(e) => debug!("Ignoring client message: {}", e),
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = sender.send(WsMessage::Pong(data)).await;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("Feed WebSocket connection closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_messages() {
        assert_eq!(
            serde_json::from_str::<ClientMessage>(r#"{"type":"join","topic":"posts"}"#).unwrap(),
            ClientMessage::Join {
                topic: "posts".into()
            }
        );
        assert_eq!(
            serde_json::from_str::<ClientMessage>(r#"{"type":"ping"}"#).unwrap(),
            ClientMessage::Ping
        );
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"subscribe"}"#).is_err());
    }

    #[test]
    fn test_connect_query() {
        let query: ConnectQuery = serde_urlencoded::from_str("topic=posts").unwrap();
        assert_eq!(query.topic.as_deref(), Some("posts"));
    }
}
