use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use quill_core::context::RequestContext;
use quill_core::errors::{ProviderError, RetryClass};
use quill_core::messages::{FinishReason, Message};
use quill_core::provider::{LlmProvider, ProviderEvent, ProviderStream};
use quill_core::tools::ToolInfo;

const EVENT_BUFFER: usize = 64;

/// Retry budget and delays for [`StreamingClient`].
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Retries allowed for rate-limit and server errors.
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Upper bound of the random extra delay, as a fraction of the backoff.
    pub jitter_factor: f64,
    /// Retries allowed when the vendor rejects its own tool-call arguments.
    pub max_tool_retries: u32,
    pub tool_retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 8,
            base_delay: Duration::from_millis(2000),
            jitter_factor: 0.2,
            max_tool_retries: 2,
            tool_retry_delay: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows failed call number `attempt`
    /// (1-based). A vendor-supplied hint replaces the computed backoff.
    pub fn backoff(&self, attempt: u32, suggested: Option<Duration>) -> Duration {
        if let Some(delay) = suggested {
            return delay;
        }
        let exp = attempt.saturating_sub(1).min(20);
        let base_ms = (self.base_delay.as_millis() as u64).saturating_mul(1u64 << exp);
        let jitter_max = (base_ms as f64 * self.jitter_factor) as u64;
        let jitter = if jitter_max > 0 {
            rand::thread_rng().gen_range(0..=jitter_max)
        } else {
            0
        };
        Duration::from_millis(base_ms + jitter)
    }
}

/// Wraps a provider with retry classification and cancellation.
///
/// - Load failures (429, 5xx) back off exponentially with jitter, honoring
///   any Retry-After hint
/// - Rejected tool-call arguments retry after a short fixed delay
/// - Everything else surfaces immediately
/// - Once any event has been forwarded the attempt is committed and later
///   errors are terminal
///
/// One attempt counter spans every failure class of a call.
pub struct StreamingClient {
    provider: Arc<dyn LlmProvider>,
    policy: RetryPolicy,
}

impl StreamingClient {
    pub fn new(provider: Arc<dyn LlmProvider>, policy: RetryPolicy) -> Self {
        Self { provider, policy }
    }

    pub fn model(&self) -> &str {
        self.provider.model()
    }

    /// Start a streamed turn. The returned stream ends after exactly one
    /// `Complete` or `Error` event.
    pub fn stream_response(
        &self,
        ctx: &RequestContext,
        history: Vec<Message>,
        tools: Vec<ToolInfo>,
    ) -> ProviderStream {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let provider = Arc::clone(&self.provider);
        let policy = self.policy.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            drive(provider, policy, ctx, history, tools, tx).await;
        });
        Box::pin(ReceiverStream::new(rx))
    }
}

enum Attempt {
    Finished,
    Failed(ProviderError),
}

async fn drive(
    provider: Arc<dyn LlmProvider>,
    policy: RetryPolicy,
    ctx: RequestContext,
    history: Vec<Message>,
    tools: Vec<ToolInfo>,
    tx: mpsc::Sender<ProviderEvent>,
) {
    let mut attempts: u32 = 0;
    loop {
        attempts += 1;
        debug!(attempt = attempts, model = provider.model(), "starting provider stream");

        let opened = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                let _ = tx.send(ProviderEvent::Error(ProviderError::Cancelled)).await;
                return;
            }
            opened = provider.stream(&ctx, &history, &tools) => opened,
        };

        let error = match opened {
            Ok(stream) => match forward(stream, &ctx, &tx).await {
                Attempt::Finished => return,
                Attempt::Failed(e) => e,
            },
            Err(e) => e,
        };

        let delay = match error.retry_class() {
            RetryClass::RateLimited if attempts > policy.max_retries => {
                let _ = tx
                    .send(ProviderEvent::Error(ProviderError::RateLimitExhausted {
                        retries: policy.max_retries,
                    }))
                    .await;
                return;
            }
            RetryClass::RateLimited => policy.backoff(attempts, error.suggested_delay()),
            RetryClass::MalformedToolCall if attempts > policy.max_tool_retries => {
                let _ = tx
                    .send(ProviderEvent::Error(ProviderError::MalformedToolCallExhausted {
                        retries: policy.max_tool_retries,
                    }))
                    .await;
                return;
            }
            RetryClass::MalformedToolCall => policy.tool_retry_delay,
            RetryClass::Fatal => {
                let _ = tx.send(ProviderEvent::Error(error)).await;
                return;
            }
        };

        warn!(
            attempt = attempts,
            max_retries = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            error_kind = error.error_kind(),
            error = %error,
            "retrying after error"
        );

        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                let _ = tx.send(ProviderEvent::Error(ProviderError::Cancelled)).await;
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Relay one attempt's events. Errors seen before anything was relayed are
/// handed back for retry classification.
async fn forward(
    mut stream: ProviderStream,
    ctx: &RequestContext,
    tx: &mpsc::Sender<ProviderEvent>,
) -> Attempt {
    let mut yielded = false;
    loop {
        let next = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                let _ = tx.send(ProviderEvent::Error(ProviderError::Cancelled)).await;
                return Attempt::Finished;
            }
            next = stream.next() => next,
        };

        match next {
            Some(ProviderEvent::Error(e)) if !yielded => return Attempt::Failed(e),
            Some(ProviderEvent::Error(e)) => {
                let _ = tx.send(ProviderEvent::Error(e)).await;
                return Attempt::Finished;
            }
            Some(ProviderEvent::Complete(mut response)) => {
                if !response.tool_calls.is_empty() {
                    response.finish_reason = Some(FinishReason::ToolUse);
                }
                let _ = tx.send(ProviderEvent::Complete(response)).await;
                return Attempt::Finished;
            }
            Some(event) => {
                yielded = true;
                if tx.send(event).await.is_err() {
                    // Receiver gone; nobody is listening any more.
                    return Attempt::Finished;
                }
            }
            None => {
                let _ = tx
                    .send(ProviderEvent::Error(ProviderError::StreamInterrupted(
                        "stream ended without completion".into(),
                    )))
                    .await;
                return Attempt::Finished;
            }
        }
    }
}
