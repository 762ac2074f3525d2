//! Scripted tools shared by the engine's unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use quill_core::context::RequestContext;
use quill_core::ids::ToolCallId;
use quill_core::messages::ToolCall;
use quill_core::tools::{Tool, ToolError, ToolInfo, ToolResponse};

pub fn call(id: &str, name: &str) -> ToolCall {
    ToolCall {
        id: ToolCallId::from_raw(id),
        name: name.into(),
        input: "{}".into(),
        finished: true,
    }
}

fn info(name: &str) -> ToolInfo {
    ToolInfo {
        name: name.into(),
        description: format!("test tool {name}"),
        parameters: json!({}),
        required: Vec::new(),
    }
}

/// Tracks how many tool runs overlap.
#[derive(Clone, Default)]
pub struct ConcurrencyGauge {
    current: Arc<AtomicUsize>,
    max: Arc<AtomicUsize>,
}

impl ConcurrencyGauge {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

/// Answers `"{name}:{input}"`, optionally after a delay.
pub struct EchoTool {
    name: String,
    delay: Duration,
    gauge: Option<ConcurrencyGauge>,
}

impl EchoTool {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.into(),
            delay: Duration::ZERO,
            gauge: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_gauge(mut self, gauge: ConcurrencyGauge) -> Self {
        self.gauge = Some(gauge);
        self
    }
}

#[async_trait]
impl Tool for EchoTool {
    fn info(&self) -> ToolInfo {
        info(&self.name)
    }

    async fn run(&self, _ctx: &RequestContext, call: &ToolCall) -> Result<ToolResponse, ToolError> {
        if let Some(gauge) = &self.gauge {
            gauge.enter();
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(gauge) = &self.gauge {
            gauge.exit();
        }
        Ok(ToolResponse::text(format!("{}:{}", self.name, call.input)))
    }
}

pub struct FailingTool {
    name: String,
}

impl FailingTool {
    pub fn named(name: &str) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Tool for FailingTool {
    fn info(&self) -> ToolInfo {
        info(&self.name)
    }

    async fn run(&self, _ctx: &RequestContext, _call: &ToolCall) -> Result<ToolResponse, ToolError> {
        Err(ToolError::ExecutionFailed("boom".into()))
    }
}

pub struct PanicTool {
    name: String,
}

impl PanicTool {
    pub fn named(name: &str) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Tool for PanicTool {
    fn info(&self) -> ToolInfo {
        info(&self.name)
    }

    async fn run(&self, _ctx: &RequestContext, _call: &ToolCall) -> Result<ToolResponse, ToolError> {
        panic!("tool exploded");
    }
}
