//! Synthesis pump: the upstream is a `responses`-API event stream; this
//! module synthesizes `chat.completion.chunk` frames from it so a client
//! that only speaks chat-completions never notices the account underneath
//! is OAuth/responses-backed.

use super::scheduler::{spawn_line_producer, ScanEvent};
use super::{
    build_chat_chunk, sse_data_frame, sse_done_frame, sse_error_frame, sse_keepalive_frame, tick_or_pending,
    ChatStreamIdentity, ToolCallTracker,
};
use crate::error::GatewayError;
use crate::tool_correct::correct_tool_name;
use crate::usage::OpenAIUsage;
use bytes::Bytes;
use serde_json::Value;
use std::time::Duration;
use tokio::io::AsyncBufRead;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub struct SynthesisOptions {
    pub max_line_size: usize,
    pub interval_timeout: Option<Duration>,
    pub keepalive_interval: Option<Duration>,
    pub original_model: String,
    pub include_usage_downstream: bool,
}

pub struct SynthesisOutcome {
    pub usage: OpenAIUsage,
    pub timed_out: bool,
}

/// Per-stream state threaded through successive `process_synthesis_event`
/// calls: the chunk envelope identity (set once, on the first event that
/// carries a response id), whether the role-priming delta has gone out yet,
/// and the tool-call index/name bookkeeping.
#[derive(Default)]
pub struct SynthesisState {
    pub identity: Option<ChatStreamIdentity>,
    pub role_sent: bool,
    pub has_tool_call: bool,
    pub tools: ToolCallTracker,
    pub done: bool,
}

/// What happened when one scanned line was fed to the synthesis state
/// machine: zero or more downstream frames to write, plus whether the
/// response reached a terminal state.
pub struct SynthesisStep {
    pub frames: Vec<String>,
    pub finished: bool,
    pub error: Option<String>,
}

impl SynthesisStep {
    fn frames(frames: Vec<String>) -> Self {
        Self { frames, finished: false, error: None }
    }
    fn none() -> Self {
        Self { frames: Vec::new(), finished: false, error: None }
    }
    fn finished(frames: Vec<String>) -> Self {
        Self { frames, finished: true, error: None }
    }
    fn error(message: String) -> Self {
        Self { frames: Vec::new(), finished: true, error: Some(message) }
    }
}

fn ensure_identity(state: &mut SynthesisState, payload: &Value, original_model: &str) -> ChatStreamIdentity {
    if let Some(identity) = &state.identity {
        return identity.clone();
    }
    let response = payload.get("response").unwrap_or(payload);
    let id = response.get("id").and_then(Value::as_str).unwrap_or("").to_string();
    let created = response.get("created_at").and_then(Value::as_i64).unwrap_or(0);
    let identity = ChatStreamIdentity {
        id,
        created,
        original_model: original_model.to_string(),
    };
    state.identity = Some(identity.clone());
    identity
}

/// Processes one already-scanned SSE line of a `responses` event stream,
/// dispatching on the event's `type` field the way the upstream event
/// protocol defines it, and returns the chat-completions frames (if any)
/// it produces.
pub fn process_synthesis_event(
    line: &str,
    state: &mut SynthesisState,
    usage: &mut OpenAIUsage,
    original_model: &str,
    include_usage_downstream: bool,
) -> SynthesisStep {
    let Some(rest) = line.strip_prefix("data:") else {
        return SynthesisStep::none();
    };
    let payload_str = rest.trim();
    if payload_str.is_empty() || payload_str == "[DONE]" {
        return SynthesisStep::none();
    }
    let Ok(payload) = serde_json::from_str::<Value>(payload_str) else {
        return SynthesisStep::none();
    };

    let event_type = payload.get("type").and_then(Value::as_str).unwrap_or("");

    match event_type {
        "response.created" | "response.in_progress" => {
            let identity = ensure_identity(state, &payload, original_model);
            let mut frames = Vec::new();
            if !state.role_sent {
                state.role_sent = true;
                frames.push(build_chat_chunk(
                    &identity,
                    serde_json::json!({ "role": "assistant", "content": null }),
                    None,
                ));
            }
            SynthesisStep::frames(frames)
        }

        "response.output_item.added" => {
            let Some(item) = payload.get("item").and_then(Value::as_object) else {
                return SynthesisStep::none();
            };
            let item_type = item.get("type").and_then(Value::as_str).unwrap_or("");
            if item_type != "function_call" && item_type != "tool_call" {
                return SynthesisStep::none();
            }
            let identity = ensure_identity(state, &payload, original_model);
            let item_id = item
                .get("id")
                .or_else(|| item.get("call_id"))
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            let call_id = item.get("call_id").and_then(Value::as_str).unwrap_or(&item_id).to_string();
            let (name, _) = correct_tool_name(item.get("name").and_then(Value::as_str).unwrap_or(""));

            let idx = state.tools.get_tool_index(&item_id);
            state.has_tool_call = true;

            let delta = serde_json::json!({
                "tool_calls": [{
                    "index": idx,
                    "id": call_id,
                    "type": "function",
                    "function": { "name": name, "arguments": "" },
                }]
            });
            SynthesisStep::frames(vec![build_chat_chunk(&identity, delta, None)])
        }

        "response.output_text.delta" => {
            let identity = ensure_identity(state, &payload, original_model);
            let text = payload.get("delta").and_then(Value::as_str).unwrap_or("");
            let delta = serde_json::json!({ "content": text });
            SynthesisStep::frames(vec![build_chat_chunk(&identity, delta, None)])
        }

        "response.refusal.delta" => {
            let identity = ensure_identity(state, &payload, original_model);
            let text = payload.get("delta").and_then(Value::as_str).unwrap_or("");
            let delta = serde_json::json!({ "refusal": text });
            SynthesisStep::frames(vec![build_chat_chunk(&identity, delta, None)])
        }

        "response.reasoning_text.delta" | "response.reasoning_summary_text.delta" => {
            let identity = ensure_identity(state, &payload, original_model);
            let text = payload.get("delta").and_then(Value::as_str).unwrap_or("");
            let delta = serde_json::json!({ "reasoning_content": text });
            SynthesisStep::frames(vec![build_chat_chunk(&identity, delta, None)])
        }

        "response.function_call_arguments.delta" => {
            let identity = ensure_identity(state, &payload, original_model);
            let item_id = payload.get("item_id").and_then(Value::as_str).unwrap_or("");
            let idx = state.tools.get_tool_index(item_id);
            let args = payload.get("delta").and_then(Value::as_str).unwrap_or("");
            let delta = serde_json::json!({
                "tool_calls": [{ "index": idx, "function": { "arguments": args } }]
            });
            SynthesisStep::frames(vec![build_chat_chunk(&identity, delta, None)])
        }

        "response.completed" | "response.incomplete" | "response.failed" => {
            let identity = ensure_identity(state, &payload, original_model);
            if let Some(usage_val) = payload.get("response").and_then(|r| r.get("usage")) {
                usage.merge_from_value(usage_val);
            }

            let finish_reason = if state.has_tool_call {
                "tool_calls"
            } else if event_type == "response.incomplete" {
                "length"
            } else {
                "stop"
            };

            let mut frames = vec![build_chat_chunk(&identity, serde_json::json!({}), Some(finish_reason))];
            if include_usage_downstream {
                frames.push(sse_data_frame(&serde_json::json!({
                    "id": identity.id,
                    "object": "chat.completion.chunk",
                    "created": identity.created,
                    "model": identity.original_model,
                    "choices": [],
                    "usage": usage.to_chat_payload(),
                })));
            }
            state.done = true;
            SynthesisStep::finished(frames)
        }

        "error" => {
            let message = payload
                .get("message")
                .or_else(|| payload.pointer("/error/message"))
                .and_then(Value::as_str)
                .unwrap_or("upstream stream error")
                .to_string();
            SynthesisStep::error(message)
        }

        _ => SynthesisStep::none(),
    }
}

/// Drives the synthesis pump end to end, mirroring
/// [`super::passthrough::run_passthrough_stream`]'s scheduling shape but
/// dispatching each line through [`process_synthesis_event`] instead of a
/// one-to-one rewrite.
pub async fn run_synthesis_stream<R>(
    reader: R,
    out_tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    opts: SynthesisOptions,
) -> Result<SynthesisOutcome, GatewayError>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    let mut producer = spawn_line_producer(reader, opts.max_line_size, cancel.clone());
    let mut usage = OpenAIUsage::default();
    let mut state = SynthesisState::default();

    let mut interval_ticker = opts.interval_timeout.map(tokio::time::interval);
    let mut keepalive_ticker = opts.keepalive_interval.map(tokio::time::interval);

    let outcome = 'pump: loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                break 'pump Ok(false);
            }

            event = producer.rx.recv() => {
                match event {
                    Some(ScanEvent::Line(line)) => {
                        if let Some(t) = interval_ticker.as_mut() { t.reset(); }
                        if let Some(t) = keepalive_ticker.as_mut() { t.reset(); }

                        let step = process_synthesis_event(
                            &line,
                            &mut state,
                            &mut usage,
                            &opts.original_model,
                            opts.include_usage_downstream,
                        );
                        for frame in step.frames {
                            if out_tx.send(Bytes::from(frame)).await.is_err() {
                                break 'pump Ok(false);
                            }
                        }
                        if let Some(message) = step.error {
                            break 'pump Err(GatewayError::StreamReadError(message));
                        }
                        if step.finished {
                            break 'pump Ok(false);
                        }
                    }
                    Some(ScanEvent::Err(err)) => {
                        break 'pump Err(err);
                    }
                    None => break 'pump Ok(false),
                }
            }

            _ = tick_or_pending(&mut interval_ticker) => {
                break 'pump Ok(true);
            }

            _ = tick_or_pending(&mut keepalive_ticker) => {
                if out_tx.send(Bytes::from_static(sse_keepalive_frame().as_bytes())).await.is_err() {
                    break 'pump Ok(false);
                }
            }
        }
    };

    match outcome {
        Ok(true) => {
            let _ = out_tx.send(Bytes::from(sse_error_frame("stream_timeout"))).await;
            Err(GatewayError::StreamTimeout)
        }
        Ok(false) => {
            let _ = out_tx.send(Bytes::from_static(sse_done_frame().as_bytes())).await;
            Ok(SynthesisOutcome { usage, timed_out: false })
        }
        Err(err) => {
            tracing::warn!(error = %err, "synthesis stream ended with error");
            let _ = out_tx.send(Bytes::from(sse_error_frame(err.wire_token()))).await;
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn upstream_error_event_surfaces_bare_taxonomy_token_and_skips_done_frame() {
        let body = Cursor::new(b"data: {\"type\":\"error\",\"message\":\"upstream exploded with a secret sk-abc123\"}\n\n".to_vec());
        let (tx, mut rx) = mpsc::channel::<Bytes>(16);
        let cancel = CancellationToken::new();

        let result = run_synthesis_stream(
            body,
            tx,
            cancel,
            SynthesisOptions {
                max_line_size: 4096,
                interval_timeout: None,
                keepalive_interval: None,
                original_model: "gpt-5".to_string(),
                include_usage_downstream: true,
            },
        )
        .await;
        assert!(matches!(result, Err(GatewayError::StreamReadError(_))));

        let frame = String::from_utf8(rx.recv().await.expect("error frame").to_vec()).unwrap();
        assert!(frame.starts_with("event: error"));
        assert!(frame.contains("stream_read_error"));
        assert!(!frame.contains("sk-abc123"), "raw upstream detail must not reach the wire");

        assert!(rx.recv().await.is_none(), "no [DONE] frame follows an error frame");
    }

    #[test]
    fn role_frame_emitted_once_on_created() {
        let mut state = SynthesisState::default();
        let mut usage = OpenAIUsage::default();
        let line = r#"data: {"type":"response.created","response":{"id":"r1","created_at":100}}"#;
        let step = process_synthesis_event(line, &mut state, &mut usage, "gpt-5", true);
        assert_eq!(step.frames.len(), 1);
        assert!(step.frames[0].contains("\"role\":\"assistant\""));

        let step2 = process_synthesis_event(line, &mut state, &mut usage, "gpt-5", true);
        assert!(step2.frames.is_empty());
    }

    #[test]
    fn text_delta_becomes_content_chunk() {
        let mut state = SynthesisState::default();
        let mut usage = OpenAIUsage::default();
        let line = r#"data: {"type":"response.output_text.delta","response":{"id":"r1"},"delta":"hi"}"#;
        let step = process_synthesis_event(line, &mut state, &mut usage, "gpt-5", true);
        assert!(step.frames[0].contains("\"content\":\"hi\""));
        assert!(step.frames[0].contains("\"model\":\"gpt-5\""));
    }

    #[test]
    fn tool_call_added_then_args_delta_share_index() {
        let mut state = SynthesisState::default();
        let mut usage = OpenAIUsage::default();
        let added = r#"data: {"type":"response.output_item.added","response":{"id":"r1"},"item":{"type":"function_call","id":"item_1","call_id":"call_1","name":"ShellExec"}}"#;
        let step1 = process_synthesis_event(added, &mut state, &mut usage, "gpt-5", true);
        assert!(step1.frames[0].contains("\"index\":0"));
        assert!(step1.frames[0].contains("shell_exec"));

        let delta = r#"data: {"type":"response.function_call_arguments.delta","item_id":"item_1","delta":"{\"x\":1}"}"#;
        let step2 = process_synthesis_event(delta, &mut state, &mut usage, "gpt-5", true);
        assert!(step2.frames[0].contains("\"index\":0"));
    }

    #[test]
    fn completed_sets_finish_reason_and_usage_frame() {
        let mut state = SynthesisState::default();
        state.has_tool_call = true;
        let mut usage = OpenAIUsage::default();
        let line = r#"data: {"type":"response.completed","response":{"id":"r1","usage":{"input_tokens":2,"output_tokens":3}}}"#;
        let step = process_synthesis_event(line, &mut state, &mut usage, "gpt-5", true);
        assert!(step.finished);
        assert!(step.frames[0].contains("\"finish_reason\":\"tool_calls\""));
        assert!(step.frames[1].contains("\"total_tokens\":5"));
    }

    #[test]
    fn completed_omits_usage_frame_when_not_requested() {
        let mut state = SynthesisState::default();
        let mut usage = OpenAIUsage::default();
        let line = r#"data: {"type":"response.completed","response":{"id":"r1","usage":{"input_tokens":2,"output_tokens":3}}}"#;
        let step = process_synthesis_event(line, &mut state, &mut usage, "gpt-5", false);
        assert_eq!(step.frames.len(), 1);
        assert!(step.frames[0].contains("\"finish_reason\":\"stop\""));
    }

    #[test]
    fn error_event_surfaces_message() {
        let mut state = SynthesisState::default();
        let mut usage = OpenAIUsage::default();
        let line = r#"data: {"type":"error","message":"upstream exploded"}"#;
        let step = process_synthesis_event(line, &mut state, &mut usage, "gpt-5", true);
        assert_eq!(step.error.as_deref(), Some("upstream exploded"));
    }
}
