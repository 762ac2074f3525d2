use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::{Future, Stream};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use tracing::instrument;

use quill_core::context::RequestContext;
use quill_core::errors::ProviderError;
use quill_core::messages::Message;
use quill_core::provider::{LlmProvider, ProviderEvent, ProviderStream};
use quill_core::tools::ToolInfo;

use crate::converter::{self, RequestOptions};
use crate::models::{self, ModelInfo};
use crate::sse::{self, ResponsesParser};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const SSE_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Clone, Debug)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: SecretString,
    pub model: String,
    pub options: RequestOptions,
    pub idle_timeout: Duration,
}

impl ProviderConfig {
    pub fn new(api_key: SecretString, model: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key,
            model: model.into(),
            options: RequestOptions::default(),
            idle_timeout: SSE_IDLE_TIMEOUT,
        }
    }
}

/// Streaming adapter for OpenAI-compatible Responses endpoints.
pub struct OpenAiProvider {
    client: Client,
    config: ProviderConfig,
    model_info: Option<&'static ModelInfo>,
}

impl OpenAiProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;
        let model_info = models::find_model(&config.model);
        Ok(Self {
            client,
            config,
            model_info,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/responses", self.config.base_url.trim_end_matches('/'))
    }

    fn request_options(&self) -> RequestOptions {
        let mut options = self.config.options.clone();
        let can_reason = self.model_info.map(|m| m.can_reason).unwrap_or(false);
        if can_reason && options.reasoning_effort.is_none() {
            options.reasoning_effort = Some("medium".into());
        } else if !can_reason {
            options.reasoning_effort = None;
        }
        options
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    #[instrument(skip_all, fields(model = %self.config.model, session_id = %ctx.session_id))]
    async fn stream(
        &self,
        ctx: &RequestContext,
        history: &[Message],
        tools: &[ToolInfo],
    ) -> Result<ProviderStream, ProviderError> {
        let body =
            converter::build_request_body(&self.config.model, history, tools, &self.request_options());

        let resp = self
            .client
            .post(self.endpoint())
            .bearer_auth(self.config.api_key.expose_secret())
            .header("accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let retry_after = retry_after(resp.headers());
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, body, retry_after));
        }

        Ok(Box::pin(SseStream::with_idle_timeout(
            resp.bytes_stream(),
            self.config.idle_timeout,
        )))
    }
}

/// Retry-After in whole seconds.
fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Wraps a byte stream from reqwest and yields ProviderEvents.
/// If no data arrives within `idle_duration`, emits an error and ends.
struct SseStream {
    inner: Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>,
    parser: ResponsesParser,
    /// Raw bytes not yet forming a complete event. Decoding waits for the
    /// event boundary so a code point split across chunks survives.
    buffer: Vec<u8>,
    pending: VecDeque<ProviderEvent>,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    idle_duration: Duration,
    done: bool,
}

impl SseStream {
    fn with_idle_timeout(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            parser: ResponsesParser::new(),
            buffer: Vec::new(),
            pending: VecDeque::new(),
            idle_deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            idle_duration: idle_timeout,
            done: false,
        }
    }

    /// Append a network chunk. Carriage returns are dropped byte-wise, which
    /// normalizes CRLF even when the pair straddles two chunks.
    fn push_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend(bytes.iter().copied().filter(|b| *b != b'\r'));
    }

    fn drain_buffer(&mut self, flush: bool) -> Result<(), ProviderError> {
        while let Some(pos) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let event: Vec<u8> = self.buffer.drain(..pos + 2).collect();
            self.parse_event_bytes(&event)?;
        }
        if flush && !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            self.parse_event_bytes(&rest)?;
        }
        Ok(())
    }

    fn parse_event_bytes(&mut self, event: &[u8]) -> Result<(), ProviderError> {
        let text = std::str::from_utf8(event)
            .map_err(|e| ProviderError::StreamInterrupted(format!("invalid UTF-8 in SSE event: {e}")))?;
        self.parse_chunk(text);
        Ok(())
    }

    fn parse_chunk(&mut self, chunk: &str) {
        for (event_type, data) in sse::parse_sse_lines(chunk) {
            let events = self.parser.parse_event(&event_type, &data);
            self.pending.extend(events);
        }
    }

    fn fail(&mut self, error: ProviderError) -> Poll<Option<ProviderEvent>> {
        self.done = true;
        self.pending.clear();
        Poll::Ready(Some(ProviderEvent::Error(error)))
    }
}

impl Stream for SseStream {
    type Item = ProviderEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(event) = self.pending.pop_front() {
            return Poll::Ready(Some(event));
        }
        if self.done {
            return Poll::Ready(None);
        }

        loop {
            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    let deadline = tokio::time::Instant::now() + self.idle_duration;
                    self.idle_deadline.as_mut().reset(deadline);

                    self.push_bytes(&bytes);
                    if let Err(e) = self.drain_buffer(false) {
                        return self.fail(e);
                    }

                    if let Some(event) = self.pending.pop_front() {
                        return Poll::Ready(Some(event));
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    return self.fail(ProviderError::StreamInterrupted(e.to_string()));
                }
                Poll::Ready(None) => {
                    self.done = true;
                    if let Err(e) = self.drain_buffer(true) {
                        return self.fail(e);
                    }
                    // A body that ends without `response.completed` still
                    // yields whatever was aggregated.
                    if let Some(complete) = self.parser.complete() {
                        self.pending.push_back(complete);
                    }
                    return Poll::Ready(self.pending.pop_front());
                }
                Poll::Pending => {
                    if self.idle_deadline.as_mut().poll(cx).is_ready() {
                        let secs = self.idle_duration.as_secs();
                        return self.fail(ProviderError::StreamInterrupted(format!(
                            "idle timeout after {secs}s"
                        )));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}
