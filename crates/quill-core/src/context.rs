use tokio_util::sync::CancellationToken;

use crate::ids::{MessageId, RequestId, SessionId};

/// Explicit per-run context threaded through the provider, the tools and the
/// conversation loop. Cancelling `cancel` stops all of them cooperatively.
#[derive(Clone, Debug)]
pub struct RequestContext {
    pub session_id: SessionId,
    pub request_id: Option<RequestId>,
    pub message_id: Option<MessageId>,
    pub cancel: CancellationToken,
}

impl RequestContext {
    pub fn new(session_id: SessionId, cancel: CancellationToken) -> Self {
        Self {
            session_id,
            request_id: None,
            message_id: None,
            cancel,
        }
    }

    pub fn with_request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = Some(request_id);
        self
    }

    /// Copy of this context scoped to the message currently being produced.
    pub fn for_message(&self, message_id: MessageId) -> Self {
        Self {
            message_id: Some(message_id),
            ..self.clone()
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
