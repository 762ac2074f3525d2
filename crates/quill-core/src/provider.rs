use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::context::RequestContext;
use crate::errors::ProviderError;
use crate::ids::ToolCallId;
use crate::messages::{FinishReason, Message, ToolCall};
use crate::tools::ToolInfo;
use crate::usage::TokenUsage;

/// Aggregate result of one streamed model turn.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: Option<FinishReason>,
    pub usage: TokenUsage,
}

/// Normalized stream events produced by every provider adapter.
#[derive(Clone, Debug, PartialEq)]
pub enum ProviderEvent {
    ThinkingDelta { delta: String },
    ContentStart,
    ContentDelta { delta: String },
    ToolUseStart { call: ToolCall },
    ToolUseDelta { id: ToolCallId, delta: String },
    ToolUseStop { id: ToolCallId },
    Error(ProviderError),
    Complete(ProviderResponse),
}

pub type ProviderStream = Pin<Box<dyn Stream<Item = ProviderEvent> + Send>>;

/// One vendor backend. A call to [`LlmProvider::stream`] is a single attempt;
/// retries live in the streaming client wrapping the provider.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;

    async fn stream(
        &self,
        ctx: &RequestContext,
        history: &[Message],
        tools: &[ToolInfo],
    ) -> Result<ProviderStream, ProviderError>;
}
