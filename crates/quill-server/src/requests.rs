//! HTTP handlers for starting, cancelling and inspecting agent runs.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use quill_core::ids::{RequestId, SessionId};
use quill_core::messages::Attachment;
use quill_engine::{AgentOrchestrator, EngineError, RunRequest};
use quill_store::SessionRepo;

use crate::event_bridge;
use crate::hub::Hub;

const DEFAULT_SESSION_TITLE: &str = "New Session";

/// Everything the run handlers need.
#[derive(Clone)]
pub struct RequestRelay {
    pub orchestrator: Arc<dyn AgentOrchestrator>,
    pub sessions: SessionRepo,
    pub hub: Arc<Hub>,
    pub limiter: Arc<Semaphore>,
    pub request_timeout: Duration,
    /// Parent of every run's cancellation token.
    pub shutdown: CancellationToken,
}

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub request_id: String,
    pub status: String,
}

/// Handler failure rendered as `{ "error": ... }`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let status = match err {
            EngineError::SessionBusy(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

/// `POST /api/agent`: admit a run and relay its events to the hub.
#[instrument(skip_all)]
pub async fn start_agent(
    State(relay): State<RequestRelay>,
    Json(req): Json<StartRequest>,
) -> Result<Json<StartResponse>, ApiError> {
    if req.session_id.trim().is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "sessionID is required"));
    }
    if req.content.trim().is_empty() && req.attachments.is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "content is required"));
    }

    let permit = Arc::clone(&relay.limiter).try_acquire_owned().map_err(|_| {
        ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "too many concurrent requests, try again later",
        )
    })?;

    let session_id = SessionId::from_raw(req.session_id);
    relay
        .sessions
        .get_or_create(&session_id, DEFAULT_SESSION_TITLE)
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let request_id = RequestId::new();
    let run_cancel = relay.shutdown.child_token();
    let events = relay.orchestrator.run(
        &run_cancel,
        RunRequest::new(session_id.clone(), req.content)
            .with_attachments(req.attachments)
            .with_request_id(request_id.clone()),
    )?;
    info!(session_id = %session_id, request_id = %request_id, "run accepted");

    let mut forwarding = event_bridge::relay_run(Arc::clone(&relay.hub), request_id.clone(), events);
    let request_timeout = relay.request_timeout;
    let rid = request_id.clone();
    tokio::spawn(async move {
        let _permit = permit;
        if tokio::time::timeout(request_timeout, &mut forwarding).await.is_err() {
            warn!(
                request_id = %rid,
                timeout_secs = request_timeout.as_secs(),
                "run exceeded request timeout, cancelling"
            );
            run_cancel.cancel();
            let _ = forwarding.await;
        }
    });

    Ok(Json(StartResponse {
        request_id: request_id.to_string(),
        status: "processing".into(),
    }))
}

/// `POST /api/agent/{session_id}/cancel`
pub async fn cancel_agent(
    State(relay): State<RequestRelay>,
    Path(session_id): Path<String>,
) -> Json<serde_json::Value> {
    let cancelled = relay.orchestrator.cancel(&SessionId::from_raw(session_id));
    Json(json!({ "cancelled": cancelled }))
}

/// `GET /api/agent/{session_id}/status`
pub async fn agent_status(
    State(relay): State<RequestRelay>,
    Path(session_id): Path<String>,
) -> Json<serde_json::Value> {
    let busy = relay
        .orchestrator
        .is_session_busy(&SessionId::from_raw(session_id));
    Json(json!({ "busy": busy }))
}
