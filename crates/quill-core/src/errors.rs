use std::time::Duration;

/// Substrings a vendor uses when it rejects the arguments of a tool call it
/// generated itself.
const MALFORMED_TOOL_CALL_MARKERS: &[&str] = &[
    "tool_use_failed",
    "Failed to parse tool call arguments",
    "failed_generation",
];

/// Typed error hierarchy for provider streaming operations.
///
/// Every variant lands in exactly one [`RetryClass`]; the streaming client
/// uses that class to decide between exponential backoff, a short fixed
/// delay, or surfacing the failure immediately.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ProviderError {
    // Load failures, retried with backoff
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },

    // Content-shape failure, retried with a fixed delay
    #[error("malformed tool call: {0}")]
    MalformedToolCall(String),

    // Fatal
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),

    // Budget exhausted
    #[error("maximum retry attempts reached for rate limit: {retries} retries")]
    RateLimitExhausted { retries: u32 },
    #[error("maximum retry attempts reached for tool parsing error: {retries} retries")]
    MalformedToolCallExhausted { retries: u32 },

    #[error("request cancelled by user")]
    Cancelled,
}

/// How a [`ProviderError`] should be treated by the retry loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryClass {
    RateLimited,
    MalformedToolCall,
    Fatal,
}

impl ProviderError {
    pub fn retry_class(&self) -> RetryClass {
        match self {
            Self::RateLimited { .. } | Self::ServerError { .. } => RetryClass::RateLimited,
            Self::MalformedToolCall(_) => RetryClass::MalformedToolCall,
            _ => RetryClass::Fatal,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Vendor-supplied delay hint, if any.
    pub fn suggested_delay(&self) -> Option<Duration> {
        if let Self::RateLimited { retry_after } = self {
            *retry_after
        } else {
            None
        }
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::MalformedToolCall(_) => "malformed_tool_call",
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::InvalidRequest(_) => "invalid_request",
            Self::NetworkError(_) => "network_error",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::RateLimitExhausted { .. } => "rate_limit_exhausted",
            Self::MalformedToolCallExhausted { .. } => "malformed_tool_call_exhausted",
            Self::Cancelled => "cancelled",
        }
    }

    /// Classify an HTTP status code (and body) into the appropriate variant.
    pub fn from_status(status: u16, body: String, retry_after: Option<Duration>) -> Self {
        if is_malformed_tool_call(&body) {
            return Self::MalformedToolCall(body);
        }
        match status {
            401 | 403 => Self::AuthenticationFailed(body),
            429 => Self::RateLimited { retry_after },
            500..=599 => Self::ServerError { status, body },
            _ => Self::InvalidRequest(format!("status {status}: {body}")),
        }
    }

    /// Classify an in-stream error payload, which carries no status code.
    pub fn from_stream_message(message: String) -> Self {
        if is_malformed_tool_call(&message) {
            Self::MalformedToolCall(message)
        } else if message.contains("rate_limit") {
            Self::RateLimited { retry_after: None }
        } else {
            Self::StreamInterrupted(message)
        }
    }
}

fn is_malformed_tool_call(body: &str) -> bool {
    MALFORMED_TOOL_CALL_MARKERS.iter().any(|m| body.contains(m))
}

/// Failure reported by a message or session store.
#[derive(Clone, Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("storage failure: {0}")]
    Storage(String),
}
