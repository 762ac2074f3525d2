use serde::{Deserialize, Serialize};

use crate::ids::{RequestId, SessionId};
use crate::messages::Message;

/// Error text carried by the terminal event of a cancelled run.
pub const CANCELLED_MESSAGE: &str = "request cancelled by user";

/// Outbound events produced by one conversation run.
///
/// Exactly one terminal event (`Response { done: true, .. }` or `Error`)
/// closes every run. Serialization goes through [`WireEvent`], the flat
/// camel-cased shape clients consume.
#[derive(Clone, Debug, PartialEq)]
pub enum AgentEvent {
    Thinking {
        session_id: SessionId,
        iteration: u32,
        message: String,
    },
    ContentDelta {
        session_id: SessionId,
        delta: String,
    },
    ReasoningDelta {
        session_id: SessionId,
        delta: String,
    },
    /// Assistant message. `done` is false for tool-use turns.
    Response {
        session_id: SessionId,
        message: Message,
        done: bool,
    },
    /// Tool-role message holding the results of one tool batch.
    Tool {
        session_id: SessionId,
        message: Message,
    },
    Error {
        session_id: SessionId,
        error: String,
        cancelled: bool,
    },
}

impl AgentEvent {
    pub fn thinking(session_id: SessionId, iteration: u32) -> Self {
        Self::Thinking {
            session_id,
            iteration,
            message: "Thinking...".into(),
        }
    }

    pub fn error(session_id: SessionId, error: impl Into<String>) -> Self {
        Self::Error {
            session_id,
            error: error.into(),
            cancelled: false,
        }
    }

    pub fn cancelled(session_id: SessionId) -> Self {
        Self::Error {
            session_id,
            error: CANCELLED_MESSAGE.into(),
            cancelled: true,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Thinking { .. } => "thinking",
            Self::ContentDelta { .. } => "content_delta",
            Self::ReasoningDelta { .. } => "reasoning_delta",
            Self::Response { .. } => "response",
            Self::Tool { .. } => "tool",
            Self::Error { .. } => "error",
        }
    }

    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::Thinking { session_id, .. }
            | Self::ContentDelta { session_id, .. }
            | Self::ReasoningDelta { session_id, .. }
            | Self::Response { session_id, .. }
            | Self::Tool { session_id, .. }
            | Self::Error { session_id, .. } => session_id,
        }
    }

    /// True for the single event that ends a run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Response { done: true, .. } | Self::Error { .. })
    }

    pub fn to_wire(&self) -> WireEvent {
        let mut wire = WireEvent {
            kind: self.kind().to_string(),
            session_id: Some(self.session_id().clone()),
            ..Default::default()
        };
        match self {
            Self::Thinking { iteration, message, .. } => {
                wire.thinking_message = Some(message.clone());
                wire.iteration = Some(*iteration);
            }
            Self::ContentDelta { delta, .. } => wire.content_delta = Some(delta.clone()),
            Self::ReasoningDelta { delta, .. } => wire.reasoning_delta = Some(delta.clone()),
            Self::Response { message, done, .. } => {
                wire.message = Some(message.clone());
                wire.done = Some(*done);
            }
            Self::Tool { message, .. } => {
                wire.message = Some(message.clone());
                wire.done = Some(false);
            }
            Self::Error { error, .. } => {
                wire.error = Some(error.clone());
                wire.done = Some(true);
            }
        }
        wire
    }
}

impl Serialize for AgentEvent {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_wire().serialize(serializer)
    }
}

/// Flat JSON shape of an [`AgentEvent`] on the wire.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "sessionID", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub done: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_delta: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_delta: Option<String>,
}

impl WireEvent {
    pub fn is_terminal(&self) -> bool {
        self.kind == "error" || (self.kind == "response" && self.done == Some(true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Message;

    #[test]
    fn thinking_wire_shape() {
        let sid = SessionId::from_raw("s1");
        let json = serde_json::to_value(AgentEvent::thinking(sid, 2)).unwrap();
        assert_eq!(json["type"], "thinking");
        assert_eq!(json["sessionID"], "s1");
        assert_eq!(json["thinkingMessage"], "Thinking...");
        assert_eq!(json["iteration"], 2);
        assert!(json.get("message").is_none());
        assert!(json.get("done").is_none());
    }

    #[test]
    fn content_delta_wire_shape() {
        let event = AgentEvent::ContentDelta {
            session_id: SessionId::from_raw("s1"),
            delta: "Hel".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "content_delta");
        assert_eq!(json["contentDelta"], "Hel");
    }

    #[test]
    fn response_carries_message_and_done() {
        let sid = SessionId::from_raw("s1");
        let mut msg = Message::assistant(sid.clone(), None);
        msg.append_content("hi");
        let event = AgentEvent::Response {
            session_id: sid,
            message: msg,
            done: true,
        };
        assert!(event.is_terminal());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "response");
        assert_eq!(json["done"], true);
        assert_eq!(json["message"]["role"], "assistant");
    }

    #[test]
    fn terminal_classification() {
        let sid = SessionId::new();
        assert!(AgentEvent::error(sid.clone(), "boom").is_terminal());
        assert!(AgentEvent::cancelled(sid.clone()).is_terminal());
        assert!(!AgentEvent::thinking(sid.clone(), 1).is_terminal());
        let open = AgentEvent::Response {
            session_id: sid.clone(),
            message: Message::assistant(sid, None),
            done: false,
        };
        assert!(!open.is_terminal());
    }

    #[test]
    fn cancelled_event_is_an_error_with_fixed_text() {
        let event = AgentEvent::cancelled(SessionId::new());
        let wire = event.to_wire();
        assert_eq!(wire.kind, "error");
        assert_eq!(wire.error.as_deref(), Some(CANCELLED_MESSAGE));
        assert!(wire.is_terminal());
    }

    #[test]
    fn wire_event_round_trips_through_json() {
        let mut wire = AgentEvent::error(SessionId::from_raw("s1"), "x").to_wire();
        wire.request_id = Some(RequestId::from_raw("r1"));
        let text = serde_json::to_string(&wire).unwrap();
        assert!(text.contains("\"requestId\":\"r1\""));
        let back: WireEvent = serde_json::from_str(&text).unwrap();
        assert_eq!(back, wire);
    }
}
