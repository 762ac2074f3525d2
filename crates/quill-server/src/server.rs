use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use quill_engine::AgentOrchestrator;
use quill_store::SessionRepo;

use crate::connection;
use crate::event_bridge;
use crate::hub::{Hub, HubConfig};
use crate::requests::{self, RequestRelay};
use crate::status::{StatusService, WORKER_STATUS_CHANNEL};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub port: u16,
    /// Runs allowed in flight at once across all sessions.
    pub max_concurrent: usize,
    /// Runs still going after this long are cancelled.
    pub request_timeout: Duration,
    pub hub: HubConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 9091,
            max_concurrent: 10,
            request_timeout: Duration::from_secs(600),
            hub: HubConfig::default(),
        }
    }
}

/// Shared application state passed to axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub relay: RequestRelay,
    pub hub: Arc<Hub>,
    pub status: Arc<StatusService>,
}

impl axum::extract::FromRef<AppState> for RequestRelay {
    fn from_ref(state: &AppState) -> Self {
        state.relay.clone()
    }
}

/// Build the axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/api/agent", post(requests::start_agent))
        .route("/api/agent/{session_id}/cancel", post(requests::cancel_agent))
        .route("/api/agent/{session_id}/status", get(requests::agent_status))
        .with_state(state)
        .layer(TimeoutLayer::new(HTTP_TIMEOUT))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind the listener and start serving. The returned handle owns the
/// background tasks.
pub async fn start(
    config: ServerConfig,
    orchestrator: Arc<dyn AgentOrchestrator>,
    sessions: SessionRepo,
    status: Arc<StatusService>,
) -> Result<ServerHandle, std::io::Error> {
    let shutdown = CancellationToken::new();
    let hub = Arc::new(Hub::new(config.hub.clone()));
    hub.register_source(WORKER_STATUS_CHANNEL, status.clone());
    let status_relay =
        event_bridge::relay_worker_status(Arc::clone(&hub), status.subscribe(), shutdown.clone());

    let relay = RequestRelay {
        orchestrator,
        sessions,
        hub: Arc::clone(&hub),
        limiter: Arc::new(Semaphore::new(config.max_concurrent)),
        request_timeout: config.request_timeout,
        shutdown: shutdown.clone(),
    };
    let router = build_router(AppState {
        relay,
        hub: Arc::clone(&hub),
        status,
    });

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    let local_addr = listener.local_addr()?;
    info!(port = local_addr.port(), "quill server started");

    let graceful = shutdown.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(graceful.cancelled_owned())
            .await
        {
            warn!(error = %e, "server exited with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        hub,
        shutdown,
        server,
        status_relay,
    })
}

/// Handle returned by [`start`]; keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    hub: Arc<Hub>,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
    status_relay: JoinHandle<()>,
}

impl ServerHandle {
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Stop accepting work, cancel in-flight runs and wait for the server
    /// task to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.server.await;
        let _ = self.status_relay.await;
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let (conn, rx) = match state.hub.connect() {
        Ok(pair) => pair,
        Err(e) => {
            warn!(error = %e, "rejecting websocket client");
            return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response();
        }
    };
    let hub = state.hub;
    let failed_hub = Arc::clone(&hub);
    let failed_conn = Arc::clone(&conn);
    ws.on_failed_upgrade(move |e| {
        warn!(error = %e, "websocket upgrade failed");
        failed_hub.disconnect(&failed_conn);
    })
    .on_upgrade(move |socket| connection::run(hub, conn, rx, socket))
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "connections": state.hub.connection_count(),
        "activeRuns": state.relay.orchestrator.active_count(),
        "workers": state.status.snapshot().len(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::provider::ProviderEvent;
    use quill_engine::{ConversationLoop, EngineOrchestrator, LoopConfig, ToolRegistry};
    use quill_llm::{MockProvider, MockResponse, RetryPolicy, StreamingClient};
    use quill_store::{Database, MessageRepo};
    use serde_json::Value;

    struct TestServer {
        handle: ServerHandle,
        sessions: SessionRepo,
        messages: MessageRepo,
        http: reqwest::Client,
    }

    impl TestServer {
        fn url(&self, path: &str) -> String {
            format!("http://127.0.0.1:{}{path}", self.handle.port)
        }

        async fn post_json(&self, path: &str, body: Value) -> reqwest::Response {
            self.http.post(self.url(path)).json(&body).send().await.unwrap()
        }

        async fn busy(&self, session: &str) -> bool {
            let body: Value = self
                .http
                .get(self.url(&format!("/api/agent/{session}/status")))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            body["busy"].as_bool().unwrap()
        }

        async fn wait_idle(&self, session: &str) {
            for _ in 0..200 {
                if !self.busy(session).await {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("session {session} never went idle");
        }
    }

    async fn spawn_server(responses: Vec<MockResponse>, config: ServerConfig) -> TestServer {
        let db = Database::in_memory().unwrap();
        let sessions = SessionRepo::new(db.clone());
        let messages = MessageRepo::new(db);
        let client = Arc::new(StreamingClient::new(
            Arc::new(MockProvider::new(responses)),
            RetryPolicy::default(),
        ));
        let conversation = Arc::new(ConversationLoop::new(
            client,
            Arc::new(ToolRegistry::new()),
            Arc::new(messages.clone()),
            Arc::new(sessions.clone()),
            LoopConfig::default(),
        ));
        let orchestrator: Arc<dyn AgentOrchestrator> =
            Arc::new(EngineOrchestrator::new(conversation));
        let handle = start(
            ServerConfig {
                port: 0,
                ..config
            },
            orchestrator,
            sessions.clone(),
            Arc::new(StatusService::new()),
        )
        .await
        .unwrap();
        TestServer {
            handle,
            sessions,
            messages,
            http: reqwest::Client::new(),
        }
    }

    fn hang() -> MockResponse {
        MockResponse::Hang(vec![ProviderEvent::ContentStart])
    }

    #[tokio::test]
    async fn health_reports_healthy() {
        let server = spawn_server(vec![], ServerConfig::default()).await;
        let resp = server.http.get(server.url("/health")).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["activeRuns"], 0);
        server.handle.shutdown().await;
    }

    #[tokio::test]
    async fn start_run_creates_session_and_persists_messages() {
        let server = spawn_server(vec![MockResponse::text("Hi back")], ServerConfig::default()).await;
        let resp = server
            .post_json("/api/agent", json!({"sessionID": "doc-1", "content": "hello"}))
            .await;
        assert_eq!(resp.status(), 200);
        let body: requests::StartResponse = resp.json().await.unwrap();
        assert_eq!(body.status, "processing");
        assert!(!body.request_id.is_empty());

        server.wait_idle("doc-1").await;
        let sid = quill_core::ids::SessionId::from_raw("doc-1");
        assert!(server.sessions.find(&sid).unwrap().is_some());
        let stored = server.messages.list(&sid).unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].content(), "Hi back");
        server.handle.shutdown().await;
    }

    #[tokio::test]
    async fn busy_session_conflicts_and_cancel_frees_it() {
        let server = spawn_server(vec![hang()], ServerConfig::default()).await;
        let first = server
            .post_json("/api/agent", json!({"sessionID": "s1", "content": "one"}))
            .await;
        assert_eq!(first.status(), 200);
        assert!(server.busy("s1").await);

        let second = server
            .post_json("/api/agent", json!({"sessionID": "s1", "content": "two"}))
            .await;
        assert_eq!(second.status(), 409);
        let body: Value = second.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains("currently processing"));

        let cancelled: Value = server
            .post_json("/api/agent/s1/cancel", json!({}))
            .await
            .json()
            .await
            .unwrap();
        assert_eq!(cancelled["cancelled"], true);
        assert!(!server.busy("s1").await);

        let again: Value = server
            .post_json("/api/agent/s1/cancel", json!({}))
            .await
            .json()
            .await
            .unwrap();
        assert_eq!(again["cancelled"], false);
        server.handle.shutdown().await;
    }

    #[tokio::test]
    async fn empty_content_is_rejected() {
        let server = spawn_server(vec![], ServerConfig::default()).await;
        let resp = server
            .post_json("/api/agent", json!({"sessionID": "s1", "content": "  "}))
            .await;
        assert_eq!(resp.status(), 400);
        server.handle.shutdown().await;
    }

    #[tokio::test]
    async fn concurrency_limit_returns_service_unavailable() {
        let server = spawn_server(
            vec![hang()],
            ServerConfig {
                max_concurrent: 1,
                ..Default::default()
            },
        )
        .await;
        let first = server
            .post_json("/api/agent", json!({"sessionID": "a", "content": "x"}))
            .await;
        assert_eq!(first.status(), 200);
        let second = server
            .post_json("/api/agent", json!({"sessionID": "b", "content": "y"}))
            .await;
        assert_eq!(second.status(), 503);
        server.handle.shutdown().await;
    }

    #[tokio::test]
    async fn request_timeout_cancels_the_run() {
        let server = spawn_server(
            vec![hang()],
            ServerConfig {
                request_timeout: Duration::from_millis(100),
                hub: HubConfig {
                    subscribe_wait: Duration::from_millis(10),
                    ..Default::default()
                },
                ..Default::default()
            },
        )
        .await;
        let resp = server
            .post_json("/api/agent", json!({"sessionID": "slow", "content": "x"}))
            .await;
        assert_eq!(resp.status(), 200);
        server.wait_idle("slow").await;
        server.handle.shutdown().await;
    }
}
