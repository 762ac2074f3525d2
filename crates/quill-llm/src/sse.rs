use serde::Deserialize;
use serde_json::Value;

use quill_core::errors::ProviderError;
use quill_core::ids::ToolCallId;
use quill_core::messages::{FinishReason, ToolCall};
use quill_core::provider::{ProviderEvent, ProviderResponse};
use quill_core::usage::TokenUsage;

/// State machine folding Responses-API stream events into [`ProviderEvent`]s
/// and one aggregated [`ProviderResponse`].
#[derive(Default)]
pub struct ResponsesParser {
    content: String,
    content_started: bool,
    /// Calls announced by `output_item.added`, keyed by the vendor item id.
    pending: Vec<(String, ToolCall)>,
    /// Calls whose arguments are complete, in completion order.
    finished: Vec<ToolCall>,
    status: Option<String>,
    usage: TokenUsage,
    completed: bool,
}

impl ResponsesParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one SSE event. `event_type` may be empty, in which case the
    /// payload's own `type` field is used.
    pub fn parse_event(&mut self, event_type: &str, data: &str) -> Vec<ProviderEvent> {
        let Ok(payload) = serde_json::from_str::<Value>(data) else {
            return Vec::new();
        };
        let kind = if event_type.is_empty() {
            payload.get("type").and_then(Value::as_str).unwrap_or_default()
        } else {
            event_type
        };

        let mut events = Vec::new();
        match kind {
            "response.output_text.delta" => {
                let delta = str_field(&payload, "delta");
                if !self.content_started {
                    self.content_started = true;
                    events.push(ProviderEvent::ContentStart);
                }
                self.content.push_str(delta);
                events.push(ProviderEvent::ContentDelta {
                    delta: delta.to_string(),
                });
            }

            "response.reasoning_summary_text.delta"
            | "response.reasoning_text.delta"
            | "response.reasoning.delta" => {
                let delta = match str_field(&payload, "delta") {
                    "" => str_field(&payload, "text"),
                    d => d,
                };
                if !delta.is_empty() {
                    events.push(ProviderEvent::ThinkingDelta {
                        delta: delta.to_string(),
                    });
                }
            }

            "response.output_item.added" => {
                if let Ok(added) = OutputItemAdded::deserialize(&payload) {
                    match added.item.kind.as_str() {
                        "function_call" => {
                            let call = ToolCall {
                                id: ToolCallId::from_raw(added.item.call_id),
                                name: added.item.name,
                                input: String::new(),
                                finished: false,
                            };
                            self.pending.push((added.item.id, call.clone()));
                            events.push(ProviderEvent::ToolUseStart { call });
                        }
                        "reasoning" => {
                            for part in added.item.content {
                                if part.kind == "reasoning_text" && !part.text.is_empty() {
                                    events.push(ProviderEvent::ThinkingDelta { delta: part.text });
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }

            "response.function_call_arguments.delta" => {
                let item_id = str_field(&payload, "item_id");
                let delta = str_field(&payload, "delta");
                if let Some((_, call)) = self.pending.iter_mut().find(|(id, _)| id == item_id) {
                    call.input.push_str(delta);
                    events.push(ProviderEvent::ToolUseDelta {
                        id: call.id.clone(),
                        delta: delta.to_string(),
                    });
                }
            }

            "response.function_call_arguments.done" => {
                let item_id = str_field(&payload, "item_id");
                if let Some(pos) = self.pending.iter().position(|(id, _)| id == item_id) {
                    let (_, mut call) = self.pending.remove(pos);
                    call.input = str_field(&payload, "arguments").to_string();
                    call.finished = true;
                    events.push(ProviderEvent::ToolUseStop {
                        id: call.id.clone(),
                    });
                    self.finished.push(call);
                }
            }

            "response.completed" | "response.incomplete" => {
                if let Ok(done) = CompletedEvent::deserialize(&payload) {
                    if !done.response.status.is_empty() {
                        self.status = Some(done.response.status);
                    }
                    if let Some(usage) = done.response.usage {
                        self.usage = usage.into_token_usage();
                    }
                }
                if let Some(complete) = self.complete() {
                    events.push(complete);
                }
            }

            "response.failed" => {
                let message = payload
                    .pointer("/response/error/message")
                    .and_then(Value::as_str)
                    .unwrap_or("response failed");
                events.push(ProviderEvent::Error(ProviderError::from_stream_message(
                    message.to_string(),
                )));
            }

            "error" => {
                let message = payload
                    .get("message")
                    .or_else(|| payload.pointer("/error/message"))
                    .and_then(Value::as_str)
                    .unwrap_or(data);
                let code = payload
                    .get("code")
                    .or_else(|| payload.pointer("/error/code"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                events.push(ProviderEvent::Error(ProviderError::from_stream_message(
                    format!("{code} {message}").trim().to_string(),
                )));
            }

            other => {
                tracing::trace!(event_type = other, "ignoring stream event");
            }
        }
        events
    }

    /// Emits the aggregated response exactly once.
    pub fn complete(&mut self) -> Option<ProviderEvent> {
        if self.completed {
            return None;
        }
        self.completed = true;
        Some(ProviderEvent::Complete(self.response()))
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    fn response(&self) -> ProviderResponse {
        let finish_reason = if !self.finished.is_empty() {
            FinishReason::ToolUse
        } else {
            match self.status.as_deref() {
                Some("incomplete") => FinishReason::MaxTokens,
                Some("completed") | None => FinishReason::EndTurn,
                Some(_) => FinishReason::Unknown,
            }
        };
        ProviderResponse {
            content: self.content.clone(),
            tool_calls: self.finished.clone(),
            finish_reason: Some(finish_reason),
            usage: self.usage,
        }
    }
}

fn str_field<'a>(payload: &'a Value, key: &str) -> &'a str {
    payload.get(key).and_then(Value::as_str).unwrap_or_default()
}

/// Parse raw SSE text into (event_type, data) pairs. Multi-line `data:`
/// fields are joined with newlines.
pub fn parse_sse_lines(raw: &str) -> Vec<(String, String)> {
    let mut events = Vec::new();
    let mut current_event = String::new();
    let mut current_data: Vec<&str> = Vec::new();

    for line in raw.lines() {
        if let Some(event) = line.strip_prefix("event:") {
            current_event = event.trim().to_string();
        } else if let Some(data) = line.strip_prefix("data:") {
            current_data.push(data.strip_prefix(' ').unwrap_or(data));
        } else if line.is_empty() && (!current_event.is_empty() || !current_data.is_empty()) {
            events.push((std::mem::take(&mut current_event), current_data.join("\n")));
            current_data.clear();
        }
    }

    if !current_event.is_empty() || !current_data.is_empty() {
        events.push((current_event, current_data.join("\n")));
    }

    events.retain(|(_, data)| data != "[DONE]");
    events
}

// --- Deserialization types for Responses stream events ---

#[derive(Deserialize)]
struct OutputItemAdded {
    item: OutputItem,
}

#[derive(Deserialize)]
struct OutputItem {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    id: String,
    #[serde(default)]
    call_id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    content: Vec<ReasoningContent>,
}

#[derive(Deserialize)]
struct ReasoningContent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct CompletedEvent {
    response: CompletedResponse,
}

#[derive(Deserialize)]
struct CompletedResponse {
    #[serde(default)]
    status: String,
    usage: Option<UsagePayload>,
}

#[derive(Deserialize)]
struct UsagePayload {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    input_tokens_details: Option<InputTokenDetails>,
}

#[derive(Deserialize)]
struct InputTokenDetails {
    #[serde(default)]
    cached_tokens: u64,
}

impl UsagePayload {
    /// Cached input is reported inside `input_tokens`; split it out so each
    /// token is priced once.
    fn into_token_usage(self) -> TokenUsage {
        let cached = self.input_tokens_details.map(|d| d.cached_tokens).unwrap_or(0);
        TokenUsage {
            input_tokens: self.input_tokens.saturating_sub(cached),
            output_tokens: self.output_tokens,
            cache_read_tokens: cached,
            cache_write_tokens: 0,
        }
    }
}
