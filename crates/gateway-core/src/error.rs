use serde_json::Value;
use std::fmt;

/// Errors raised by the translator core. Mirrors the shape of provider-facing
/// errors elsewhere in the workspace: a flat enum with a hand-written
/// `Display`, not a `thiserror` derive, so call sites can match on variants
/// without pulling in the macro's attribute surface for a handful of arms.
#[derive(Debug)]
pub enum GatewayError {
    /// Request body failed to parse, or failed a structural requirement
    /// (e.g. a tool message missing both `tool_call_id` and `name`).
    InvalidRequest(String),
    /// The upstream connection could not be established or was dropped
    /// before a status line was read.
    Transport(String),
    /// Upstream responded with a non-failover error status. `body` is the
    /// exact JSON forwarded to the client: the upstream's own `{error:{...}}`
    /// shape with only the nested `message` sanitized, or a synthesized
    /// `upstream_error` shape when the body didn't parse that way.
    Upstream { status: u16, body: Value },
    /// The SSE scanner hit a line longer than the configured maximum.
    ResponseTooLarge,
    /// The producer task failed to read a line from the upstream body.
    StreamReadError(String),
    /// No data arrived from upstream within `stream_data_interval_timeout`.
    StreamTimeout,
    Json(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            GatewayError::Transport(msg) => write!(f, "upstream request failed: {msg}"),
            GatewayError::Upstream { status, body } => {
                write!(f, "upstream error {status}: {body}")
            }
            GatewayError::ResponseTooLarge => write!(f, "response_too_large"),
            GatewayError::StreamReadError(msg) => write!(f, "stream_read_error: {msg}"),
            GatewayError::StreamTimeout => write!(f, "stream_timeout"),
            GatewayError::Json(msg) => write!(f, "json error: {msg}"),
        }
    }
}

impl std::error::Error for GatewayError {}

impl GatewayError {
    /// Bare taxonomy token written on the wire in an `event: error` frame.
    /// Never the `Display` text — callers log the detailed error via
    /// `tracing` before surfacing this.
    pub fn wire_token(&self) -> &'static str {
        match self {
            GatewayError::InvalidRequest(_) => "invalid_request_error",
            GatewayError::Transport(_) | GatewayError::Upstream { .. } => "upstream_error",
            GatewayError::ResponseTooLarge => "response_too_large",
            GatewayError::StreamReadError(_) | GatewayError::Json(_) => "stream_read_error",
            GatewayError::StreamTimeout => "stream_timeout",
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::Json(e.to_string())
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        GatewayError::Transport(e.to_string())
    }
}

impl From<url::ParseError> for GatewayError {
    fn from(e: url::ParseError) -> Self {
        GatewayError::InvalidRequest(e.to_string())
    }
}

/// Sentinel signaling "abandon this account and retry on another" — a
/// control-flow value, never logged as a failure in its own right.
#[derive(Debug, Clone, Copy)]
pub struct UpstreamFailoverError {
    pub status: u16,
}
