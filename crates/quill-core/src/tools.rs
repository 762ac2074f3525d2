use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::RequestContext;
use crate::messages::ToolCall;

/// Catalog entry advertised to the model for one tool.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    /// JSON-schema `properties` object.
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub required: Vec<String>,
}

/// What a tool hands back to the model.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolResponse {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            metadata: None,
            is_error: false,
        }
    }

    /// A handled failure the model should see as an error result.
    pub fn text_error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            metadata: None,
            is_error: true,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn info(&self) -> ToolInfo;

    /// Implementations should watch `ctx.cancel` during long I/O.
    async fn run(&self, ctx: &RequestContext, call: &ToolCall) -> Result<ToolResponse, ToolError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("cancelled")]
    Cancelled,
}
