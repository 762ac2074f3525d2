use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use quill_core::context::RequestContext;
use quill_core::messages::ToolCall;
use quill_core::tools::{Tool, ToolError, ToolInfo, ToolResponse};

pub const NAME: &str = "fetch_url";

const MAX_RESPONSE_SIZE: usize = 512_000; // 512KB
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct FetchArgs {
    url: String,
}

/// Fetches a web page and hands its body back to the model as text.
pub struct FetchUrlTool {
    client: reqwest::Client,
}

impl FetchUrlTool {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent("Quill/1.0")
            .build()?;
        Ok(Self { client })
    }

    async fn fetch(&self, url: &str) -> Result<ToolResponse, ToolError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Ok(ToolResponse::text_error(format!("HTTP {status} fetching {url}")));
        }

        // Read at most one byte past the cap so truncation is detectable
        // without buffering an unbounded body.
        let mut body: Vec<u8> = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|e| ToolError::ExecutionFailed(format!("failed to read response: {e}")))?;
            let room = MAX_RESPONSE_SIZE + 1 - body.len();
            body.extend_from_slice(&chunk[..chunk.len().min(room)]);
            if body.len() > MAX_RESPONSE_SIZE {
                break;
            }
        }
        let truncated = body.len() > MAX_RESPONSE_SIZE;
        let text = String::from_utf8_lossy(&body);
        let content = truncate_output(&text, MAX_RESPONSE_SIZE, truncated);
        debug!(url, bytes = body.len(), truncated, "fetched url");

        Ok(ToolResponse::text(content).with_metadata(json!({
            "url": url,
            "status": status.as_u16(),
            "truncated": truncated,
        })))
    }
}

#[async_trait]
impl Tool for FetchUrlTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: NAME.into(),
            description: "Fetch the content of a web page by URL".into(),
            parameters: json!({
                "url": {
                    "type": "string",
                    "description": "Absolute http or https URL to fetch"
                }
            }),
            required: vec!["url".into()],
        }
    }

    async fn run(&self, ctx: &RequestContext, call: &ToolCall) -> Result<ToolResponse, ToolError> {
        let args: FetchArgs = serde_json::from_str(&call.input)
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;
        let url = args.url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ToolError::InvalidArguments(format!(
                "url must start with http:// or https://: {url}"
            )));
        }

        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Err(ToolError::Cancelled),
            result = self.fetch(url) => result,
        }
    }
}

/// Cut `output` to at most `max_bytes` on a char boundary. A marker is
/// appended when the text was cut here or the body was already cut off
/// while reading.
fn truncate_output(output: &str, max_bytes: usize, cut_while_reading: bool) -> String {
    if output.len() <= max_bytes && !cut_while_reading {
        return output.to_string();
    }
    let mut boundary = max_bytes.min(output.len());
    while !output.is_char_boundary(boundary) {
        boundary -= 1;
    }
    format!(
        "{}\n\n[truncated to {} bytes]",
        &output[..boundary],
        boundary
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::ids::{SessionId, ToolCallId};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> RequestContext {
        RequestContext::new(SessionId::new(), CancellationToken::new())
    }

    fn call(input: &str) -> ToolCall {
        ToolCall {
            id: ToolCallId::from_raw("c1"),
            name: NAME.into(),
            input: input.into(),
            finished: true,
        }
    }

    /// Serve one canned HTTP response on a local port.
    async fn serve_once(status_line: &'static str, body: impl Into<String>) -> String {
        let body = body.into();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {status_line}\r\nContent-Length: {}\r\nContent-Type: text/plain\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        });
        format!("http://{addr}/page")
    }

    fn tool() -> FetchUrlTool {
        FetchUrlTool::new().unwrap()
    }

    #[test]
    fn info_describes_required_url() {
        let info = tool().info();
        assert_eq!(info.name, "fetch_url");
        assert_eq!(info.required, vec!["url".to_string()]);
        assert!(info.parameters["url"].is_object());
    }

    #[tokio::test]
    async fn missing_url_is_invalid() {
        let err = tool().run(&ctx(), &call("{}")).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn non_http_scheme_is_invalid() {
        let err = tool()
            .run(&ctx(), &call(r#"{"url":"file:///etc/passwd"}"#))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("http://"));
    }

    #[tokio::test]
    async fn fetches_body_with_metadata() {
        let url = serve_once("200 OK", "hello page").await;
        let input = json!({ "url": url }).to_string();
        let response = tool().run(&ctx(), &call(&input)).await.unwrap();
        assert!(!response.is_error);
        assert_eq!(response.content, "hello page");
        let meta = response.metadata.unwrap();
        assert_eq!(meta["status"], 200);
        assert_eq!(meta["truncated"], false);
    }

    #[tokio::test]
    async fn http_failure_is_an_error_result() {
        let url = serve_once("404 Not Found", "nope").await;
        let input = json!({ "url": url }).to_string();
        let response = tool().run(&ctx(), &call(&input)).await.unwrap();
        assert!(response.is_error);
        assert!(response.content.starts_with("HTTP 404"));
    }

    #[tokio::test]
    async fn cancelled_context_short_circuits() {
        let ctx = ctx();
        ctx.cancel.cancel();
        let err = tool()
            .run(&ctx, &call(r#"{"url":"http://127.0.0.1:9/never"}"#))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Cancelled));
    }

    #[tokio::test]
    async fn oversized_body_is_cut_at_the_cap() {
        let url = serve_once("200 OK", "x".repeat(MAX_RESPONSE_SIZE * 2)).await;
        let input = json!({ "url": url }).to_string();
        let response = tool().run(&ctx(), &call(&input)).await.unwrap();
        assert!(!response.is_error);
        assert!(response.content.starts_with(&"x".repeat(1000)));
        assert!(response
            .content
            .ends_with(&format!("[truncated to {MAX_RESPONSE_SIZE} bytes]")));
        assert!(response.content.len() < MAX_RESPONSE_SIZE + 64);
        assert_eq!(response.metadata.unwrap()["truncated"], true);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_output("short", 100, false), "short");
        let text = "é".repeat(10); // 20 bytes
        let out = truncate_output(&text, 5, false);
        assert!(out.starts_with("éé\n\n"));
        assert!(out.ends_with("[truncated to 4 bytes]"));
    }

    #[test]
    fn body_cut_while_reading_is_marked() {
        let out = truncate_output("abc", 3, true);
        assert_eq!(out, "abc\n\n[truncated to 3 bytes]");
    }
}
