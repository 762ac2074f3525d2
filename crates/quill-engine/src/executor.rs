use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::task::JoinSet;
use tracing::{debug, error, instrument};

use quill_core::context::RequestContext;
use quill_core::messages::{ToolCall, ToolResult};
use quill_core::tools::{Tool, ToolError};

use crate::registry::ToolRegistry;

/// Tools that are safe to run concurrently with each other. A batch runs in
/// parallel only when it has more than one call and every call is listed.
pub const PARALLEL_SAFE_TOOLS: &[&str] = &[
    "search_web_sources",
    "ask_question",
    "get_relevant_sources",
    "fetch_url",
    "add_context_from_sources",
];

pub const CANCELLED_TOOL_MESSAGE: &str = "Tool execution canceled by user";

/// Results of one tool batch, index-aligned with the calls.
#[derive(Debug)]
pub struct ToolBatch {
    pub results: Vec<ToolResult>,
    pub cancelled: bool,
}

pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn can_parallelize(calls: &[ToolCall]) -> bool {
        calls.len() > 1
            && calls
                .iter()
                .all(|c| PARALLEL_SAFE_TOOLS.contains(&c.name.as_str()))
    }

    #[instrument(skip_all, fields(session_id = %ctx.session_id, calls = calls.len()))]
    pub async fn execute(&self, ctx: &RequestContext, calls: &[ToolCall]) -> ToolBatch {
        if Self::can_parallelize(calls) {
            debug!("executing tool batch in parallel");
            self.execute_parallel(ctx, calls).await
        } else {
            self.execute_sequential(ctx, calls).await
        }
    }

    async fn execute_sequential(&self, ctx: &RequestContext, calls: &[ToolCall]) -> ToolBatch {
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            if ctx.is_cancelled() {
                break;
            }
            let tool = self.registry.get(&call.name);
            let result = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => break,
                result = run_call(tool, ctx, call) => result,
            };
            results.push(result);
        }

        let cancelled = results.len() < calls.len();
        for call in &calls[results.len()..] {
            results.push(cancelled_result(call));
        }
        ToolBatch { results, cancelled }
    }

    async fn execute_parallel(&self, ctx: &RequestContext, calls: &[ToolCall]) -> ToolBatch {
        let mut slots: Vec<Option<ToolResult>> = vec![None; calls.len()];
        let mut set = JoinSet::new();
        for (idx, call) in calls.iter().enumerate() {
            let tool = self.registry.get(&call.name);
            let ctx = ctx.clone();
            let call = call.clone();
            set.spawn(async move { (idx, run_call(tool, &ctx, &call).await) });
        }

        let mut cancelled = false;
        loop {
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => {
                    set.abort_all();
                    cancelled = true;
                    break;
                }
                joined = set.join_next() => match joined {
                    Some(Ok((idx, result))) => slots[idx] = Some(result),
                    Some(Err(e)) => error!(error = %e, "tool task failed"),
                    None => break,
                },
            }
        }

        let results = slots
            .into_iter()
            .zip(calls)
            .map(|(slot, call)| match slot {
                Some(result) => result,
                None if cancelled => cancelled_result(call),
                None => error_result(call, "Tool execution error: task failed".into()),
            })
            .collect();
        ToolBatch { results, cancelled }
    }
}

/// Runs one call, folding every failure into an error result.
async fn run_call(tool: Option<Arc<dyn Tool>>, ctx: &RequestContext, call: &ToolCall) -> ToolResult {
    if ctx.is_cancelled() {
        return cancelled_result(call);
    }
    let Some(tool) = tool else {
        return error_result(call, format!("Tool not found: {}", call.name));
    };

    match AssertUnwindSafe(tool.run(ctx, call)).catch_unwind().await {
        Ok(Ok(response)) => ToolResult {
            tool_call_id: call.id.clone(),
            content: response.content,
            metadata: response.metadata,
            is_error: response.is_error,
        },
        Ok(Err(ToolError::Cancelled)) => cancelled_result(call),
        Ok(Err(e)) => error_result(call, format!("Tool execution error: {e}")),
        Err(panic) => {
            let msg = panic_message(&panic);
            error!(tool = %call.name, panic = %msg, "tool panicked during execution");
            error_result(call, format!("Tool execution error: panic: {msg}"))
        }
    }
}

fn error_result(call: &ToolCall, content: String) -> ToolResult {
    ToolResult {
        tool_call_id: call.id.clone(),
        content,
        metadata: None,
        is_error: true,
    }
}

fn cancelled_result(call: &ToolCall) -> ToolResult {
    error_result(call, CANCELLED_TOOL_MESSAGE.into())
}

pub(crate) fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use quill_core::ids::{SessionId, ToolCallId};
    use tokio_util::sync::CancellationToken;

    use crate::testing::{call, ConcurrencyGauge, EchoTool, FailingTool, PanicTool};

    fn ctx() -> RequestContext {
        RequestContext::new(SessionId::new(), CancellationToken::new())
    }

    fn executor(tools: Vec<Arc<dyn Tool>>) -> ToolExecutor {
        let mut registry = ToolRegistry::new();
        for tool in tools {
            registry.register(tool);
        }
        ToolExecutor::new(Arc::new(registry))
    }

    fn assert_aligned(calls: &[ToolCall], batch: &ToolBatch) {
        assert_eq!(batch.results.len(), calls.len());
        for (call, result) in calls.iter().zip(&batch.results) {
            assert_eq!(result.tool_call_id, call.id);
        }
    }

    #[test]
    fn parallel_only_for_multiple_listed_tools() {
        assert!(!ToolExecutor::can_parallelize(&[call("c1", "fetch_url")]));
        assert!(ToolExecutor::can_parallelize(&[
            call("c1", "fetch_url"),
            call("c2", "ask_question"),
        ]));
        assert!(!ToolExecutor::can_parallelize(&[
            call("c1", "fetch_url"),
            call("c2", "edit_document"),
        ]));
        assert!(!ToolExecutor::can_parallelize(&[]));
    }

    #[tokio::test]
    async fn empty_batch() {
        let batch = executor(vec![]).execute(&ctx(), &[]).await;
        assert!(batch.results.is_empty());
        assert!(!batch.cancelled);
    }

    #[tokio::test]
    async fn single_call_runs_sequentially() {
        let exec = executor(vec![Arc::new(EchoTool::named("fetch_url"))]);
        let calls = vec![call("c1", "fetch_url")];
        let batch = exec.execute(&ctx(), &calls).await;
        assert_aligned(&calls, &batch);
        assert_eq!(batch.results[0].content, "fetch_url:{}");
        assert!(!batch.results[0].is_error);
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error_result() {
        let exec = executor(vec![Arc::new(EchoTool::named("view"))]);
        let calls = vec![call("c1", "foo_bar"), call("c2", "view")];
        let batch = exec.execute(&ctx(), &calls).await;
        assert_aligned(&calls, &batch);
        assert_eq!(batch.results[0].content, "Tool not found: foo_bar");
        assert!(batch.results[0].is_error);
        assert!(!batch.results[1].is_error);
    }

    #[tokio::test]
    async fn tool_errors_and_panics_are_contained() {
        let exec = executor(vec![
            Arc::new(FailingTool::named("fails")),
            Arc::new(PanicTool::named("explodes")),
        ]);
        let calls = vec![call("c1", "fails"), call("c2", "explodes")];
        let batch = exec.execute(&ctx(), &calls).await;
        assert_aligned(&calls, &batch);
        assert_eq!(
            batch.results[0].content,
            "Tool execution error: execution failed: boom"
        );
        assert!(batch.results[1].is_error);
        assert!(batch.results[1].content.contains("tool exploded"));
    }

    #[tokio::test(start_paused = true)]
    async fn parallel_batch_keeps_call_order() {
        let gauge = ConcurrencyGauge::default();
        let exec = executor(vec![
            Arc::new(
                EchoTool::named("fetch_url")
                    .with_delay(Duration::from_millis(300))
                    .with_gauge(gauge.clone()),
            ),
            Arc::new(
                EchoTool::named("ask_question")
                    .with_delay(Duration::from_millis(10))
                    .with_gauge(gauge.clone()),
            ),
        ]);
        let calls = vec![
            call("c1", "fetch_url"),
            call("c2", "ask_question"),
            call("c3", "fetch_url"),
        ];

        let start = tokio::time::Instant::now();
        let batch = exec.execute(&ctx(), &calls).await;
        assert_aligned(&calls, &batch);
        assert_eq!(batch.results[1].content, "ask_question:{}");
        assert_eq!(gauge.max(), 3);
        assert!(start.elapsed() < Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn sequential_batch_runs_one_at_a_time() {
        let gauge = ConcurrencyGauge::default();
        let exec = executor(vec![Arc::new(
            EchoTool::named("edit")
                .with_delay(Duration::from_millis(50))
                .with_gauge(gauge.clone()),
        )]);
        let calls = vec![call("c1", "edit"), call("c2", "edit"), call("c3", "edit")];
        let batch = exec.execute(&ctx(), &calls).await;
        assert_aligned(&calls, &batch);
        assert_eq!(gauge.max(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_fills_remaining_sequential_calls() {
        let exec = executor(vec![Arc::new(
            EchoTool::named("edit").with_delay(Duration::from_secs(10)),
        )]);
        let calls = vec![call("c1", "edit"), call("c2", "edit")];
        let ctx = ctx();
        let token = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        });

        let batch = exec.execute(&ctx, &calls).await;
        assert!(batch.cancelled);
        assert_aligned(&calls, &batch);
        for result in &batch.results {
            assert_eq!(result.content, CANCELLED_TOOL_MESSAGE);
            assert!(result.is_error);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_fills_unresolved_parallel_calls() {
        let exec = executor(vec![
            Arc::new(EchoTool::named("fetch_url").with_delay(Duration::from_secs(10))),
            Arc::new(EchoTool::named("ask_question")),
        ]);
        let calls = vec![call("c1", "fetch_url"), call("c2", "ask_question")];
        let ctx = ctx();
        let token = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        });

        let batch = exec.execute(&ctx, &calls).await;
        assert!(batch.cancelled);
        assert_aligned(&calls, &batch);
        assert_eq!(batch.results[0].content, CANCELLED_TOOL_MESSAGE);
        assert_eq!(batch.results[1].content, "ask_question:{}");
    }

    #[tokio::test]
    async fn cancelled_before_start_runs_nothing() {
        let gauge = ConcurrencyGauge::default();
        let exec = executor(vec![Arc::new(EchoTool::named("edit").with_gauge(gauge.clone()))]);
        let ctx = ctx();
        ctx.cancel.cancel();
        let calls = vec![call("c1", "edit")];
        let batch = exec.execute(&ctx, &calls).await;
        assert!(batch.cancelled);
        assert_eq!(gauge.max(), 0);
        assert_eq!(batch.results[0].tool_call_id, ToolCallId::from_raw("c1"));
    }
}
