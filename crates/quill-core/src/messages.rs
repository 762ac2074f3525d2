use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{MessageId, SessionId, ToolCallId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "tool" => Some(Self::Tool),
            _ => None,
        }
    }
}

/// Why a model turn ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    Canceled,
    PermissionDenied,
    Unknown,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EndTurn => "end_turn",
            Self::ToolUse => "tool_use",
            Self::MaxTokens => "max_tokens",
            Self::Canceled => "canceled",
            Self::PermissionDenied => "permission_denied",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "end_turn" => Self::EndTurn,
            "tool_use" => Self::ToolUse,
            "max_tokens" => Self::MaxTokens,
            "canceled" => Self::Canceled,
            "permission_denied" => Self::PermissionDenied,
            _ => Self::Unknown,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: ToolCallId,
    pub name: String,
    /// Raw JSON arguments exactly as the model produced them.
    pub input: String,
    #[serde(default)]
    pub finished: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: ToolCallId,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub is_error: bool,
}

/// Binary payload supplied alongside a user prompt. `data` is base64.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(default)]
    pub name: String,
    pub mime_type: String,
    pub data: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Reasoning { text: String },
    Binary(Attachment),
    ToolCall(ToolCall),
    ToolResult(ToolResult),
}

/// One turn in a session's conversation.
///
/// Messages are mutated incrementally while a model turn streams. Once a
/// finish reason is recorded every mutating helper becomes a no-op, so a
/// late delta can never alter a completed turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub session_id: SessionId,
    pub role: Role,
    pub parts: Vec<ContentPart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    pub fn new(session_id: SessionId, role: Role, parts: Vec<ContentPart>) -> Self {
        let now = Utc::now();
        Self {
            id: MessageId::new(),
            session_id,
            role,
            parts,
            finish_reason: None,
            model: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn user(
        session_id: SessionId,
        text: impl Into<String>,
        attachments: Vec<Attachment>,
    ) -> Self {
        let mut parts = vec![ContentPart::Text { text: text.into() }];
        parts.extend(attachments.into_iter().map(ContentPart::Binary));
        Self::new(session_id, Role::User, parts)
    }

    pub fn assistant(session_id: SessionId, model: Option<String>) -> Self {
        let mut msg = Self::new(session_id, Role::Assistant, Vec::new());
        msg.model = model;
        msg
    }

    /// Tool-role message holding one result part per call, in call order.
    pub fn tool_results_message(session_id: SessionId, results: Vec<ToolResult>) -> Self {
        let parts = results.into_iter().map(ContentPart::ToolResult).collect();
        Self::new(session_id, Role::Tool, parts)
    }

    pub fn is_finished(&self) -> bool {
        self.finish_reason.is_some()
    }

    /// Concatenated text of every text part.
    pub fn content(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn reasoning(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Reasoning { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn attachments(&self) -> Vec<&Attachment> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Binary(a) => Some(a),
                _ => None,
            })
            .collect()
    }

    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::ToolCall(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn tool_results(&self) -> Vec<ToolResult> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::ToolResult(r) => Some(r.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn append_content(&mut self, delta: &str) {
        if self.is_finished() {
            return;
        }
        for part in &mut self.parts {
            if let ContentPart::Text { text } = part {
                text.push_str(delta);
                self.touch();
                return;
            }
        }
        self.parts.insert(0, ContentPart::Text { text: delta.to_string() });
        self.touch();
    }

    pub fn append_reasoning(&mut self, delta: &str) {
        if self.is_finished() {
            return;
        }
        for part in &mut self.parts {
            if let ContentPart::Reasoning { text } = part {
                text.push_str(delta);
                self.touch();
                return;
            }
        }
        self.parts.push(ContentPart::Reasoning { text: delta.to_string() });
        self.touch();
    }

    /// Adds a tool call, replacing an existing one with the same id.
    pub fn add_tool_call(&mut self, call: ToolCall) {
        if self.is_finished() {
            return;
        }
        for part in &mut self.parts {
            if let ContentPart::ToolCall(existing) = part {
                if existing.id == call.id {
                    *existing = call;
                    self.touch();
                    return;
                }
            }
        }
        self.parts.push(ContentPart::ToolCall(call));
        self.touch();
    }

    pub fn finish_tool_call(&mut self, id: &ToolCallId) {
        if self.is_finished() {
            return;
        }
        for part in &mut self.parts {
            if let ContentPart::ToolCall(call) = part {
                if &call.id == id {
                    call.finished = true;
                    self.touch();
                    return;
                }
            }
        }
    }

    /// Replaces every tool call part with `calls`.
    pub fn set_tool_calls(&mut self, calls: Vec<ToolCall>) {
        if self.is_finished() {
            return;
        }
        self.parts.retain(|p| !matches!(p, ContentPart::ToolCall(_)));
        self.parts.extend(calls.into_iter().map(ContentPart::ToolCall));
        self.touch();
    }

    /// Records the finish reason. Only the first call has any effect.
    pub fn finish(&mut self, reason: FinishReason) {
        if self.is_finished() {
            return;
        }
        self.finish_reason = Some(reason);
        self.touch();
    }

    /// Marks the turn cancelled. Unlike [`Message::finish`] this also
    /// replaces a `tool_use` finish, since a turn whose tools were
    /// interrupted did not complete. Any other recorded finish is kept.
    pub fn cancel(&mut self) {
        match self.finish_reason {
            None | Some(FinishReason::ToolUse) => {
                self.finish_reason = Some(FinishReason::Canceled);
                self.touch();
            }
            Some(_) => {}
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
