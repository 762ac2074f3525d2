//! Streaming hub: fans serialized events out to WebSocket connections.
//!
//! Two subscription models share one connection. Request subscriptions
//! (`{action, requestId}`) receive the events of a single agent run and stop
//! after its terminal event. Channel subscriptions (`{action, channel}`)
//! receive a snapshot on subscribe followed by live messages.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use quill_core::events::AgentEvent;
use quill_core::ids::RequestId;

use crate::connection::{Connection, ConnectionId};
use crate::status::StatusService;

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub max_connections: usize,
    /// Outbound messages buffered per connection.
    pub send_queue: usize,
    pub ping_interval: Duration,
    pub pong_wait: Duration,
    pub write_wait: Duration,
    /// How long a request relay waits for its first subscriber.
    pub subscribe_wait: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            send_queue: 256,
            ping_interval: Duration::from_secs(30),
            pong_wait: Duration::from_secs(60),
            write_wait: Duration::from_secs(10),
            subscribe_wait: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HubError {
    #[error("connection limit reached ({0})")]
    AtCapacity(usize),
}

/// Supplies the messages a new channel subscriber sees before live updates.
pub trait ChannelSource: Send + Sync {
    fn snapshot(&self) -> Vec<String>;
}

impl ChannelSource for StatusService {
    fn snapshot(&self) -> Vec<String> {
        StatusService::snapshot(self)
            .iter()
            .filter_map(|update| serde_json::to_string(&update.to_message()).ok())
            .collect()
    }
}

/// Inbound client frame.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMessage {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
}

pub struct Hub {
    config: HubConfig,
    connections: DashMap<ConnectionId, Arc<Connection>>,
    admitted: AtomicUsize,
    channels: RwLock<HashMap<String, HashSet<ConnectionId>>>,
    sources: RwLock<HashMap<String, Arc<dyn ChannelSource>>>,
    waiters: DashMap<String, Arc<Notify>>,
}

impl Hub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            connections: DashMap::new(),
            admitted: AtomicUsize::new(0),
            channels: RwLock::new(HashMap::new()),
            sources: RwLock::new(HashMap::new()),
            waiters: DashMap::new(),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn register_source(&self, channel: &str, source: Arc<dyn ChannelSource>) {
        self.sources.write().insert(channel.to_string(), source);
    }

    /// Admit a new connection and hand back its outbound queue.
    pub fn connect(&self) -> Result<(Arc<Connection>, mpsc::Receiver<String>), HubError> {
        let max = self.config.max_connections;
        self.admitted
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .map_err(|_| HubError::AtCapacity(max))?;

        let (tx, rx) = mpsc::channel(self.config.send_queue);
        let conn = Arc::new(Connection::new(tx));
        self.connections.insert(conn.id().clone(), Arc::clone(&conn));
        info!(connection_id = %conn.id(), "websocket client connected");
        Ok((conn, rx))
    }

    /// Release everything held for a connection. Safe to call repeatedly;
    /// only the first call does any work.
    pub fn disconnect(&self, conn: &Connection) {
        if !conn.close() {
            return;
        }
        {
            let mut channels = self.channels.write();
            for subscribers in channels.values_mut() {
                subscribers.remove(conn.id());
            }
        }
        self.connections.remove(conn.id());
        self.admitted.fetch_sub(1, Ordering::AcqRel);
        info!(connection_id = %conn.id(), "websocket client disconnected");
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn channel_subscriber_count(&self, channel: &str) -> usize {
        self.channels.read().get(channel).map_or(0, HashSet::len)
    }

    /// Dispatch one text frame from a client.
    pub fn handle_text(&self, conn: &Arc<Connection>, text: &str) {
        let msg: ClientMessage = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(connection_id = %conn.id(), error = %e, "unparseable client frame");
                conn.send_error(None, "invalid message");
                return;
            }
        };
        let request_id = msg.request_id.as_deref().filter(|r| !r.is_empty());
        let channel = msg.channel.as_deref().filter(|c| !c.is_empty());

        match (msg.action.as_str(), channel, request_id) {
            ("subscribe", Some(channel), _) => self.subscribe_channel(conn, channel),
            ("unsubscribe", Some(channel), _) => self.unsubscribe_channel(conn, channel),
            ("subscribe", None, Some(request_id)) => self.subscribe_request(conn, request_id),
            ("unsubscribe", None, Some(request_id)) => {
                conn.unsubscribe_request(request_id);
            }
            ("subscribe" | "unsubscribe", None, None) => {
                conn.send_error(None, "requestId or channel is required");
            }
            (other, _, _) => {
                conn.send_error(request_id, &format!("unknown action: {other}"));
            }
        }
    }

    /// Subscribe to a channel: snapshot, then the ack, then live messages.
    /// Holding the write lock keeps a concurrent publish from slipping in
    /// ahead of the snapshot.
    pub fn subscribe_channel(&self, conn: &Connection, channel: &str) {
        let mut channels = self.channels.write();
        channels
            .entry(channel.to_string())
            .or_default()
            .insert(conn.id().clone());
        let source = self.sources.read().get(channel).cloned();
        if let Some(source) = source {
            for message in source.snapshot() {
                conn.send(message);
            }
        }
        conn.send(json!({ "type": "subscribed", "channel": channel }).to_string());
        debug!(connection_id = %conn.id(), channel, "channel subscribed");
    }

    pub fn unsubscribe_channel(&self, conn: &Connection, channel: &str) {
        if let Some(subscribers) = self.channels.write().get_mut(channel) {
            subscribers.remove(conn.id());
        }
    }

    pub fn subscribe_request(&self, conn: &Connection, request_id: &str) {
        conn.subscribe_request(request_id);
        if let Some(waiter) = self.waiters.get(request_id) {
            waiter.notify_waiters();
        }
        debug!(connection_id = %conn.id(), request_id, "request subscribed");
    }

    /// Serialize once and push to every subscriber of `channel`. Returns how
    /// many connections accepted the message.
    pub fn publish<T: Serialize>(&self, channel: &str, message: &T) -> usize {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                warn!(channel, error = %e, "failed to serialize channel message");
                return 0;
            }
        };
        let channels = self.channels.read();
        let Some(subscribers) = channels.get(channel) else {
            return 0;
        };
        subscribers
            .iter()
            .filter_map(|id| self.connections.get(id))
            .filter(|conn| conn.send(text.clone()))
            .count()
    }

    /// Deliver one run event, tagged with its request id, to the request's
    /// subscribers. A terminal event ends those subscriptions.
    pub fn stream_to_request(&self, request_id: &RequestId, event: &AgentEvent) -> usize {
        let mut wire = event.to_wire();
        wire.request_id = Some(request_id.clone());
        let text = match serde_json::to_string(&wire) {
            Ok(text) => text,
            Err(e) => {
                warn!(request_id = %request_id, error = %e, "failed to serialize event");
                return 0;
            }
        };
        let terminal = event.is_terminal();
        let mut delivered = 0;
        for entry in self.connections.iter() {
            let conn = entry.value();
            if !conn.is_subscribed_to(request_id.as_str()) {
                continue;
            }
            if conn.send(text.clone()) {
                delivered += 1;
            }
            if terminal {
                conn.unsubscribe_request(request_id.as_str());
            }
        }
        delivered
    }

    pub fn has_request_subscriber(&self, request_id: &str) -> bool {
        self.connections
            .iter()
            .any(|entry| entry.value().is_subscribed_to(request_id))
    }

    /// Wait until some connection subscribes to `request_id`, up to `wait`.
    pub async fn wait_for_subscriber(&self, request_id: &str, wait: Duration) -> bool {
        let waiter = self
            .waiters
            .entry(request_id.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone();
        let notified = waiter.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let found = self.has_request_subscriber(request_id)
            || tokio::time::timeout(wait, notified).await.is_ok();
        self.waiters.remove(request_id);
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::ids::SessionId;
    use quill_core::messages::Message;

    use crate::status::{WorkerState, WORKER_STATUS_CHANNEL};

    fn hub() -> Hub {
        Hub::new(HubConfig::default())
    }

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(text) = rx.try_recv() {
            out.push(serde_json::from_str(&text).unwrap());
        }
        out
    }

    #[test]
    fn connection_limit_is_enforced() {
        let hub = Hub::new(HubConfig {
            max_connections: 1,
            ..Default::default()
        });
        let (first, _rx) = hub.connect().unwrap();
        assert_eq!(hub.connect().unwrap_err(), HubError::AtCapacity(1));
        hub.disconnect(&first);
        assert!(hub.connect().is_ok());
    }

    #[test]
    fn disconnect_releases_everything_once() {
        let hub = hub();
        let (conn, _rx) = hub.connect().unwrap();
        hub.subscribe_channel(&conn, "news");
        assert_eq!(hub.channel_subscriber_count("news"), 1);

        hub.disconnect(&conn);
        hub.disconnect(&conn);
        assert_eq!(hub.connection_count(), 0);
        assert_eq!(hub.channel_subscriber_count("news"), 0);
        assert_eq!(hub.admitted.load(Ordering::Acquire), 0);
    }

    #[test]
    fn worker_status_subscription_snapshot_ack_then_live() {
        let hub = hub();
        let status = Arc::new(StatusService::new());
        status.register_worker("alpha");
        status.register_worker("beta");
        hub.register_source(WORKER_STATUS_CHANNEL, status.clone());

        let (conn, mut rx) = hub.connect().unwrap();
        hub.handle_text(&conn, r#"{"action":"subscribe","channel":"worker-status"}"#);

        let mut live_rx = status.subscribe();
        status.update_status("alpha", WorkerState::Running, 10, "go");
        status.complete_worker("alpha", "done");
        while let Ok(update) = live_rx.try_recv() {
            hub.publish(WORKER_STATUS_CHANNEL, &update.to_message());
        }

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 5);
        assert_eq!(frames[0]["type"], "worker-status");
        assert_eq!(frames[0]["worker_name"], "alpha");
        assert_eq!(frames[1]["worker_name"], "beta");
        assert_eq!(frames[2], json!({"type": "subscribed", "channel": "worker-status"}));
        assert_eq!(frames[3]["status"]["state"], "running");
        assert_eq!(frames[4]["status"]["state"], "completed");
    }

    #[test]
    fn unsubscribe_stops_only_that_channel() {
        let hub = hub();
        let (conn, mut rx) = hub.connect().unwrap();
        hub.handle_text(&conn, r#"{"action":"subscribe","channel":"a"}"#);
        hub.handle_text(&conn, r#"{"action":"subscribe","channel":"b"}"#);
        hub.handle_text(&conn, r#"{"action":"unsubscribe","channel":"a"}"#);
        drain(&mut rx);

        assert_eq!(hub.publish("a", &json!({"n": 1})), 0);
        assert_eq!(hub.publish("b", &json!({"n": 2})), 1);
        assert_eq!(drain(&mut rx), vec![json!({"n": 2})]);
    }

    #[test]
    fn request_events_stop_after_terminal() {
        let hub = hub();
        let (conn, mut rx) = hub.connect().unwrap();
        let (other, mut other_rx) = hub.connect().unwrap();
        hub.handle_text(&conn, r#"{"action":"subscribe","requestId":"r1"}"#);
        hub.handle_text(&other, r#"{"action":"subscribe","requestId":"r2"}"#);

        let rid = RequestId::from_raw("r1");
        let sid = SessionId::from_raw("s1");
        assert_eq!(hub.stream_to_request(&rid, &AgentEvent::thinking(sid.clone(), 1)), 1);
        let done = AgentEvent::Response {
            session_id: sid.clone(),
            message: Message::assistant(sid.clone(), None),
            done: true,
        };
        assert_eq!(hub.stream_to_request(&rid, &done), 1);
        assert_eq!(hub.stream_to_request(&rid, &AgentEvent::thinking(sid, 2)), 0);

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["requestId"], "r1");
        assert_eq!(frames[0]["type"], "thinking");
        assert_eq!(frames[1]["done"], true);
        assert!(drain(&mut other_rx).is_empty());
    }

    #[test]
    fn protocol_errors_are_reported() {
        let hub = hub();
        let (conn, mut rx) = hub.connect().unwrap();
        hub.handle_text(&conn, "not json");
        hub.handle_text(&conn, r#"{"action":"subscribe"}"#);
        hub.handle_text(&conn, r#"{"action":"dance","requestId":"r5"}"#);

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f["type"] == "error" && f["done"] == true));
        assert_eq!(frames[0]["error"], "invalid message");
        assert_eq!(frames[1]["error"], "requestId or channel is required");
        assert_eq!(frames[2]["error"], "unknown action: dance");
        assert_eq!(frames[2]["requestId"], "r5");
    }

    #[tokio::test]
    async fn wait_for_subscriber_wakes_on_subscribe() {
        let hub = Arc::new(hub());
        let (conn, _rx) = hub.connect().unwrap();

        let waiter = {
            let hub = Arc::clone(&hub);
            tokio::spawn(async move { hub.wait_for_subscriber("r1", Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        hub.handle_text(&conn, r#"{"action":"subscribe","requestId":"r1"}"#);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn wait_for_subscriber_returns_immediately_when_already_subscribed() {
        let hub = hub();
        let (conn, _rx) = hub.connect().unwrap();
        hub.subscribe_request(&conn, "r1");
        assert!(hub.wait_for_subscriber("r1", Duration::ZERO).await);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_subscriber_times_out() {
        let hub = hub();
        assert!(!hub.wait_for_subscriber("nobody", Duration::from_secs(1)).await);
        assert!(hub.waiters.is_empty());
    }
}
