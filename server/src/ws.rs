use crate::metrics::WS_CLIENTS;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::rest::AppState;

type WsSender = mpsc::UnboundedSender<Message>;

/// In-memory registry of live feed subscribers. Membership changes and
/// broadcasts are serialized behind one lock, so a subscriber is never sent
/// to after it has been removed. State is empty after restart.
pub struct Broadcaster {
    connections: Mutex<HashMap<String, WsSender>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Register a subscriber and hand back the receiver half its socket
    /// task forwards to the sink.
    pub async fn register(&self, conn_id: String) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut conns = self.connections.lock().await;
        conns.insert(conn_id, tx);
        WS_CLIENTS.set(conns.len() as f64);
        rx
    }

    pub async fn unregister(&self, conn_id: &str) {
        let mut conns = self.connections.lock().await;
        conns.remove(conn_id);
        WS_CLIENTS.set(conns.len() as f64);
    }

    /// Deliver a text frame to every subscriber. A failed send means the
    /// subscriber is gone; it is dropped without aborting delivery to the
    /// rest. No ordering guarantee across subscribers.
    pub async fn broadcast_text(&self, frame: &str) {
        let mut conns = self.connections.lock().await;
        conns.retain(|conn_id, tx| {
            if tx.send(Message::Text(frame.to_string())).is_ok() {
                true
            } else {
                warn!(%conn_id, "Live subscriber unreachable, removing");
                false
            }
        });
        WS_CLIENTS.set(conns.len() as f64);
    }

    /// Send to a single subscriber, removing it on failure.
    async fn send_to(&self, conn_id: &str, frame: String) -> Result<(), ()> {
        let mut conns = self.connections.lock().await;
        let sent = match conns.get(conn_id) {
            Some(tx) => tx.send(Message::Text(frame)).is_ok(),
            None => return Err(()),
        };
        if !sent {
            conns.remove(conn_id);
            WS_CLIENTS.set(conns.len() as f64);
            return Err(());
        }
        Ok(())
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Send a Close frame to every subscriber and clear the registry. Used
    /// during graceful shutdown.
    pub async fn close_all(&self) {
        let mut conns = self.connections.lock().await;
        let count = conns.len();
        for tx in conns.values() {
            let _ = tx.send(Message::Close(None));
        }
        conns.clear();
        WS_CLIENTS.set(0.0);
        if count > 0 {
            info!(count, "Closed all live feed connections");
        }
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// HTTP handler that upgrades the connection and hands it to the registry.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.broadcaster))
}

async fn handle_socket(socket: WebSocket, broadcaster: Arc<Broadcaster>) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    info!(%conn_id, "Live feed client connected");

    let mut rx = broadcaster.register(conn_id.clone()).await;
    let (mut sink, mut stream) = socket.split();

    // Forward registry frames to the socket; the inbound loop below is the
    // only other writer and goes through the same channel.
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Text(text)) => {
                debug!(%conn_id, %text, "Message from live feed client");
                let reply = match serde_json::from_str::<serde_json::Value>(&text) {
                    Ok(_) => json!({"status": "received", "message": "message received"}),
                    Err(_) => json!({"status": "error", "message": "invalid message format"}),
                };
                if broadcaster.send_to(&conn_id, reply.to_string()).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(%conn_id, "Live feed receive error: {}", e);
                break;
            }
        }
    }

    broadcaster.unregister(&conn_id).await;
    send_task.abort();
    info!(%conn_id, "Live feed client disconnected");
}
