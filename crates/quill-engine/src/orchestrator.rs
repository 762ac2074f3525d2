//! Session concurrency guard.
//!
//! The orchestrator owns the map of in-flight runs. At most one run exists
//! per session; a second request for a busy session is rejected instead of
//! queued. Each run gets a child cancellation token so a single session can
//! be stopped without touching the others, and shutdown can stop them all.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};

use quill_core::context::RequestContext;
use quill_core::events::AgentEvent;
use quill_core::ids::{RequestId, SessionId};
use quill_core::messages::Attachment;

use crate::error::EngineError;
use crate::executor::panic_message;
use crate::runner::ConversationLoop;

const EVENT_BUFFER: usize = 100;

pub const PANIC_MESSAGE: &str = "panic while running the agent";

/// Parameters for starting a run.
#[derive(Clone, Debug)]
pub struct RunRequest {
    pub session_id: SessionId,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub request_id: Option<RequestId>,
}

impl RunRequest {
    pub fn new(session_id: SessionId, content: impl Into<String>) -> Self {
        Self {
            session_id,
            content: content.into(),
            attachments: Vec::new(),
            request_id: None,
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = Some(request_id);
        self
    }
}

/// Interface the server uses to drive runs.
pub trait AgentOrchestrator: Send + Sync {
    /// Start a run. The receiver yields every event of the run and closes
    /// after the terminal one.
    fn run(
        &self,
        parent: &CancellationToken,
        request: RunRequest,
    ) -> Result<mpsc::Receiver<AgentEvent>, EngineError>;
    /// Cancel the session's run. Returns whether a run was active.
    fn cancel(&self, session_id: &SessionId) -> bool;
    fn is_busy(&self) -> bool;
    fn is_session_busy(&self, session_id: &SessionId) -> bool;
    /// Cancel every in-flight run. Returns how many were cancelled.
    fn cancel_all(&self) -> usize;
    fn active_count(&self) -> usize;
}

struct ActiveRun {
    run_id: u64,
    cancel: CancellationToken,
}

/// Production orchestrator backed by a [`ConversationLoop`].
pub struct EngineOrchestrator {
    conversation: Arc<ConversationLoop>,
    active: Arc<DashMap<SessionId, ActiveRun>>,
    next_run_id: AtomicU64,
}

impl EngineOrchestrator {
    pub fn new(conversation: Arc<ConversationLoop>) -> Self {
        Self {
            conversation,
            active: Arc::new(DashMap::new()),
            next_run_id: AtomicU64::new(1),
        }
    }
}

impl AgentOrchestrator for EngineOrchestrator {
    fn run(
        &self,
        parent: &CancellationToken,
        request: RunRequest,
    ) -> Result<mpsc::Receiver<AgentEvent>, EngineError> {
        let run_id = self.next_run_id.fetch_add(1, Ordering::Relaxed);
        let cancel = parent.child_token();
        match self.active.entry(request.session_id.clone()) {
            Entry::Occupied(_) => return Err(EngineError::SessionBusy(request.session_id)),
            Entry::Vacant(slot) => {
                slot.insert(ActiveRun {
                    run_id,
                    cancel: cancel.clone(),
                });
            }
        }

        let RunRequest {
            session_id,
            content,
            attachments,
            request_id,
        } = request;
        let mut ctx = RequestContext::new(session_id.clone(), cancel.clone());
        if let Some(request_id) = request_id.clone() {
            ctx = ctx.with_request_id(request_id);
        }

        let span = info_span!(
            "agent_run",
            session_id = %session_id,
            request_id = request_id.as_ref().map(|r| r.as_str()).unwrap_or_default(),
        );
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let conversation = Arc::clone(&self.conversation);
        let active = Arc::clone(&self.active);

        tokio::spawn(
            async move {
                info!("run started");
                let outcome = AssertUnwindSafe(conversation.run(&ctx, content, attachments, &tx))
                    .catch_unwind()
                    .await;
                let terminal = outcome.unwrap_or_else(|payload| {
                    error!(panic = %panic_message(&payload), "agent run panicked");
                    AgentEvent::error(session_id.clone(), PANIC_MESSAGE)
                });

                // Release the marker before the terminal event so a client
                // reacting to it can start the next run immediately.
                active.remove_if(&session_id, |_, run| run.run_id == run_id);
                cancel.cancel();
                info!(outcome = terminal.kind(), "run finished");
                if tx.send(terminal).await.is_err() {
                    info!("event receiver dropped before terminal event");
                }
            }
            .instrument(span),
        );

        Ok(rx)
    }

    fn cancel(&self, session_id: &SessionId) -> bool {
        match self.active.remove(session_id) {
            Some((_, run)) => {
                info!(session_id = %session_id, "cancelling run");
                run.cancel.cancel();
                true
            }
            None => false,
        }
    }

    fn is_busy(&self) -> bool {
        !self.active.is_empty()
    }

    fn is_session_busy(&self, session_id: &SessionId) -> bool {
        self.active.contains_key(session_id)
    }

    fn cancel_all(&self) -> usize {
        let ids: Vec<SessionId> = self.active.iter().map(|e| e.key().clone()).collect();
        ids.iter().filter(|id| self.cancel(id)).count()
    }

    fn active_count(&self) -> usize {
        self.active.len()
    }
}
