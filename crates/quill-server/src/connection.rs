use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::hub::Hub;

/// Unique connection identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl Default for ConnectionId {
    fn default() -> Self {
        Self(format!("conn_{}", Uuid::now_v7()))
    }
}

impl ConnectionId {
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One WebSocket client as seen by the hub.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    tx: mpsc::Sender<String>,
    requests: Mutex<HashSet<String>>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl Connection {
    pub(crate) fn new(tx: mpsc::Sender<String>) -> Self {
        Self {
            id: ConnectionId::new(),
            tx,
            requests: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Queue a message without blocking. A full queue drops this message.
    pub fn send(&self, message: String) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                warn!(
                    connection_id = %self.id,
                    msg_len = msg.len(),
                    "send queue full, dropping message"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn send_error(&self, request_id: Option<&str>, error: &str) -> bool {
        let mut body = json!({ "type": "error", "error": error, "done": true });
        if let Some(request_id) = request_id {
            body["requestId"] = json!(request_id);
        }
        self.send(body.to_string())
    }

    pub fn subscribe_request(&self, request_id: &str) {
        self.requests.lock().insert(request_id.to_string());
    }

    pub fn unsubscribe_request(&self, request_id: &str) -> bool {
        self.requests.lock().remove(request_id)
    }

    pub fn is_subscribed_to(&self, request_id: &str) -> bool {
        self.requests.lock().contains(request_id)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Flip the close latch. Only the first caller gets `true`.
    pub(crate) fn close(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        if first {
            self.requests.lock().clear();
            self.shutdown.cancel();
        }
        first
    }
}

/// Drive an upgraded socket: a writer task drains the send queue and pings,
/// the reader loop feeds client frames to the hub. Whichever side stops
/// first tears the connection down.
pub async fn run(
    hub: Arc<Hub>,
    conn: Arc<Connection>,
    mut rx: mpsc::Receiver<String>,
    socket: WebSocket,
) {
    let config = hub.config().clone();
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_hub = Arc::clone(&hub);
    let writer_conn = Arc::clone(&conn);
    let writer = tokio::spawn(async move {
        let mut ping = interval_at(Instant::now() + config.ping_interval, config.ping_interval);
        loop {
            let frame = tokio::select! {
                _ = writer_conn.shutdown.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(text) => WsMessage::Text(text.into()),
                    None => break,
                },
                _ = ping.tick() => {
                    trace!(connection_id = %writer_conn.id, "sending ping");
                    WsMessage::Ping(Default::default())
                }
            };
            match timeout(config.write_wait, ws_tx.send(frame)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(connection_id = %writer_conn.id, error = %e, "write failed");
                    break;
                }
                Err(_) => {
                    debug!(connection_id = %writer_conn.id, "write deadline exceeded");
                    break;
                }
            }
        }
        let _ = timeout(config.write_wait, ws_tx.send(WsMessage::Close(None))).await;
        writer_hub.disconnect(&writer_conn);
    });

    loop {
        let next = tokio::select! {
            _ = conn.shutdown.cancelled() => break,
            next = timeout(config.pong_wait, ws_rx.next()) => next,
        };
        match next {
            Err(_) => {
                debug!(connection_id = %conn.id, "no frames within pong wait, closing");
                break;
            }
            Ok(None) | Ok(Some(Err(_))) => break,
            Ok(Some(Ok(WsMessage::Text(text)))) => hub.handle_text(&conn, text.as_str()),
            Ok(Some(Ok(WsMessage::Close(_)))) => break,
            // Pongs and pings only refresh the read deadline.
            Ok(Some(Ok(_))) => {}
        }
    }

    hub.disconnect(&conn);
    let _ = writer.await;
}
