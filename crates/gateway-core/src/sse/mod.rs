//! SSE Translator: pumps an upstream event stream into a downstream
//! `text/event-stream` body, either passing chat-completions chunks through
//! with light rewriting (`passthrough`) or synthesizing chat-completions
//! chunks from a `responses` event stream (`synthesis`).
//!
//! Both pumps share the same concurrency shape: [`scheduler::spawn_line_producer`]
//! reads upstream lines on a dedicated task and reports them over a buffered
//! channel, while the caller's select loop owns writing to `out_tx`, checking
//! the interval/keepalive tickers, and reacting to downstream cancellation.

mod scheduler;

pub mod passthrough;
pub mod synthesis;

use serde_json::Value;
use std::collections::HashMap;

pub use scheduler::{spawn_line_producer, ScanEvent};

/// Tracks assignment of tool-call indices and synthesized ids across the
/// lifetime of one stream. Indices are handed out in first-appearance order,
/// per [`get_tool_index`].
#[derive(Debug, Default)]
pub struct ToolCallTracker {
    index_of_item: HashMap<String, usize>,
}

impl ToolCallTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the contiguous 0-based index for `item_id`, assigning the
    /// next index the first time this id is seen.
    pub fn get_tool_index(&mut self, item_id: &str) -> usize {
        if let Some(idx) = self.index_of_item.get(item_id) {
            return *idx;
        }
        let idx = self.index_of_item.len();
        self.index_of_item.insert(item_id.to_string(), idx);
        idx
    }
}

/// Shared identity fields stamped on every synthesized
/// `chat.completion.chunk` frame of one response.
#[derive(Debug, Clone)]
pub struct ChatStreamIdentity {
    pub id: String,
    pub created: i64,
    pub original_model: String,
}

/// Builds one `data: {...}\n\n` frame for a `chat.completion.chunk`.
pub fn build_chat_chunk(identity: &ChatStreamIdentity, delta: Value, finish_reason: Option<&str>) -> String {
    let payload = serde_json::json!({
        "id": identity.id,
        "object": "chat.completion.chunk",
        "created": identity.created,
        "model": identity.original_model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish_reason,
        }],
    });
    sse_data_frame(&payload)
}

pub fn sse_data_frame(value: &Value) -> String {
    format!("data: {value}\n\n")
}

/// `event: error` frame, sent at most once per stream. The client already
/// received a `200` with `text/event-stream`, so mid-stream failures are
/// reported this way rather than as an HTTP status.
pub fn sse_error_frame(message: &str) -> String {
    let payload = serde_json::json!({ "error": { "message": message } });
    format!("event: error\ndata: {payload}\n\n")
}

pub fn sse_done_frame() -> &'static str {
    "data: [DONE]\n\n"
}

/// Bare comment frame used as a keep-alive; intentionally not the same
/// framing as `event: error` so clients that only look at `data:`/`event:`
/// lines never see it.
pub fn sse_keepalive_frame() -> &'static str {
    ":\n\n"
}

/// Waits on `ticker`'s next tick, or never resolves if there is no ticker
/// configured. Lets `run_*_stream` select over an optional timer without a
/// guard clause duplicated at every call site.
pub(crate) async fn tick_or_pending(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_index_assigned_in_first_appearance_order() {
        let mut tracker = ToolCallTracker::new();
        assert_eq!(tracker.get_tool_index("item_b"), 0);
        assert_eq!(tracker.get_tool_index("item_a"), 1);
        assert_eq!(tracker.get_tool_index("item_b"), 0);
    }

    #[test]
    fn error_frame_uses_custom_event_name() {
        let frame = sse_error_frame("boom");
        assert!(frame.starts_with("event: error\n"));
        assert!(frame.ends_with("\n\n"));
    }

    #[test]
    fn keepalive_is_bare_comment() {
        assert_eq!(sse_keepalive_frame(), ":\n\n");
    }
}
