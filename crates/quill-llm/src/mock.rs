use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::time::Instant;

use quill_core::context::RequestContext;
use quill_core::errors::ProviderError;
use quill_core::ids::ToolCallId;
use quill_core::messages::{FinishReason, Message, ToolCall};
use quill_core::provider::{LlmProvider, ProviderEvent, ProviderResponse, ProviderStream};
use quill_core::tools::ToolInfo;
use quill_core::usage::TokenUsage;

/// Pre-programmed responses for deterministic testing without API calls.
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Yield a sequence of events.
    Stream(Vec<ProviderEvent>),
    /// Return an error from the stream() call itself.
    Error(ProviderError),
    /// Wait a duration, then yield the inner response.
    Delay(Duration, Box<MockResponse>),
    /// Yield the events, then never finish.
    Hang(Vec<ProviderEvent>),
}

impl MockResponse {
    /// A plain text answer that ends the turn.
    pub fn text(text: &str) -> Self {
        Self::Stream(vec![
            ProviderEvent::ContentStart,
            ProviderEvent::ContentDelta {
                delta: text.to_string(),
            },
            ProviderEvent::Complete(ProviderResponse {
                content: text.to_string(),
                tool_calls: Vec::new(),
                finish_reason: Some(FinishReason::EndTurn),
                usage: TokenUsage {
                    input_tokens: 10,
                    output_tokens: 5,
                    ..Default::default()
                },
            }),
        ])
    }

    /// A turn that requests the given `(id, name, input)` tool calls.
    pub fn tool_calls(calls: &[(&str, &str, &str)]) -> Self {
        let mut events = Vec::new();
        let mut finished = Vec::new();
        for (id, name, input) in calls {
            let call = ToolCall {
                id: ToolCallId::from_raw(*id),
                name: (*name).to_string(),
                input: (*input).to_string(),
                finished: false,
            };
            events.push(ProviderEvent::ToolUseStart { call: call.clone() });
            events.push(ProviderEvent::ToolUseStop {
                id: call.id.clone(),
            });
            finished.push(ToolCall {
                finished: true,
                ..call
            });
        }
        events.push(ProviderEvent::Complete(ProviderResponse {
            content: String::new(),
            tool_calls: finished,
            finish_reason: Some(FinishReason::ToolUse),
            usage: TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
                ..Default::default()
            },
        }));
        Self::Stream(events)
    }

    pub fn rate_limited() -> Self {
        Self::Error(ProviderError::RateLimited { retry_after: None })
    }

    /// Convenience: create a stream that ends with an error event.
    pub fn stream_error(error: ProviderError) -> Self {
        Self::Stream(vec![ProviderEvent::Error(error)])
    }

    /// Convenience: wrap any response with a delay.
    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Mock provider that returns pre-programmed responses in sequence.
pub struct MockProvider {
    responses: Mutex<VecDeque<MockResponse>>,
    call_count: AtomicUsize,
    call_times: Mutex<Vec<Instant>>,
    histories: Mutex<Vec<Vec<Message>>>,
}

impl MockProvider {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            call_count: AtomicUsize::new(0),
            call_times: Mutex::new(Vec::new()),
            histories: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Instants at which each call arrived.
    pub fn call_times(&self) -> Vec<Instant> {
        self.call_times.lock().clone()
    }

    /// The history passed to each call, in call order.
    pub fn histories(&self) -> Vec<Vec<Message>> {
        self.histories.lock().clone()
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    async fn stream(
        &self,
        _ctx: &RequestContext,
        history: &[Message],
        _tools: &[ToolInfo],
    ) -> Result<ProviderStream, ProviderError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.call_times.lock().push(Instant::now());
        self.histories.lock().push(history.to_vec());

        let Some(response) = self.responses.lock().pop_front() else {
            return Err(ProviderError::InvalidRequest(format!(
                "MockProvider: no response configured for call {idx}"
            )));
        };

        resolve_response(response).await
    }
}

/// Resolve a MockResponse, handling Delay by sleeping first.
async fn resolve_response(response: MockResponse) -> Result<ProviderStream, ProviderError> {
    let mut current = response;
    loop {
        match current {
            MockResponse::Stream(events) => return Ok(Box::pin(stream::iter(events))),
            MockResponse::Error(e) => return Err(e),
            MockResponse::Hang(events) => {
                return Ok(Box::pin(stream::iter(events).chain(stream::pending())));
            }
            MockResponse::Delay(duration, inner) => {
                tokio::time::sleep(duration).await;
                current = *inner;
            }
        }
    }
}
