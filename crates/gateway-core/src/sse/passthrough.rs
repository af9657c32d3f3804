//! Passthrough pump: the upstream is already chat-completions-shaped SSE,
//! so each `data:` line only needs model substitution, tool-name
//! correction, and usage-frame bookkeeping before being forwarded.

use super::scheduler::{spawn_line_producer, ScanEvent};
use super::{sse_done_frame, sse_error_frame, sse_keepalive_frame, tick_or_pending};
use crate::error::GatewayError;
use crate::tool_correct::correct_tool_calls_in_value;
use crate::usage::{has_empty_choices, strip_usage, update_chat_usage_from_stream_chunk, OpenAIUsage};
use bytes::Bytes;
use serde_json::Value;
use std::time::Duration;
use tokio::io::AsyncBufRead;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub struct PassthroughOptions {
    pub max_line_size: usize,
    pub interval_timeout: Option<Duration>,
    pub keepalive_interval: Option<Duration>,
    pub original_model: String,
    pub mapped_model: String,
    /// Whether the caller asked for `stream_options.include_usage`; if not,
    /// the usage-only terminal frame the Request Rewriter forced upstream
    /// must be dropped before reaching the client.
    pub include_usage_downstream: bool,
}

pub struct PassthroughOutcome {
    pub usage: OpenAIUsage,
    pub timed_out: bool,
}

/// Rewrites one already-scanned line of an upstream chat-completions SSE
/// body. Non-`data:` lines (blank separators, comments) pass through
/// unchanged. Returns `None` when the line should be dropped entirely (a
/// usage-only frame once usage is stripped and `choices` is left empty).
pub fn process_passthrough_line(
    line: &str,
    original_model: &str,
    mapped_model: &str,
    include_usage_downstream: bool,
    usage: &mut OpenAIUsage,
) -> Option<String> {
    let Some(rest) = line.strip_prefix("data:") else {
        return Some(format!("{line}\n"));
    };
    let payload = rest.trim();
    if payload.is_empty() {
        return Some(format!("{line}\n"));
    }
    if payload == "[DONE]" {
        return Some("data: [DONE]\n".to_string());
    }

    let Ok(mut value) = serde_json::from_str::<Value>(payload) else {
        return Some(format!("{line}\n"));
    };

    update_chat_usage_from_stream_chunk(&value, usage);
    correct_tool_calls_in_value(&mut value);

    if original_model != mapped_model && value.get("model").and_then(Value::as_str) == Some(mapped_model) {
        value["model"] = Value::String(original_model.to_string());
    }

    if !include_usage_downstream {
        if let Value::Object(map) = &mut value {
            if strip_usage(map) && has_empty_choices(map) {
                return None;
            }
        }
    }

    Some(format!("data: {value}\n"))
}

fn is_done_line(line: &str) -> bool {
    line.strip_prefix("data:").map(|p| p.trim()) == Some("[DONE]")
}

/// Drives the passthrough pump end to end: spawns the line producer,
/// selects between scanned lines, the idle-data timeout, the keep-alive
/// ticker, and downstream cancellation, writing rewritten frames to
/// `out_tx` as it goes.
pub async fn run_passthrough_stream<R>(
    reader: R,
    out_tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    opts: PassthroughOptions,
) -> Result<PassthroughOutcome, GatewayError>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    let mut producer = spawn_line_producer(reader, opts.max_line_size, cancel.clone());
    let mut usage = OpenAIUsage::default();
    let mut done_sent = false;

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

                        if is_done_line(&line) {
                            done_sent = true;
                        }

                        if let Some(frame) = process_passthrough_line(
                            &line,
                            &opts.original_model,
                            &opts.mapped_model,
                            opts.include_usage_downstream,
                            &mut usage,
                        ) {
                            if out_tx.send(Bytes::from(frame)).await.is_err() {
                                break 'pump Ok(false);
                            }
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
            if !done_sent {
                let _ = out_tx.send(Bytes::from_static(sse_done_frame().as_bytes())).await;
            }
            Ok(PassthroughOutcome { usage, timed_out: false })
        }
        Err(err) => {
            tracing::warn!(error = %err, "passthrough stream ended with error");
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
    async fn error_frame_never_followed_by_done_frame() {
        let body = Cursor::new(b"abcdefghij\n".to_vec());
        let (tx, mut rx) = mpsc::channel::<Bytes>(16);
        let cancel = CancellationToken::new();

        let result = run_passthrough_stream(
            body,
            tx,
            cancel,
            PassthroughOptions {
                max_line_size: 4,
                interval_timeout: None,
                keepalive_interval: None,
                original_model: "a".to_string(),
                mapped_model: "a".to_string(),
                include_usage_downstream: true,
            },
        )
        .await;
        assert!(matches!(result, Err(GatewayError::ResponseTooLarge)));

        let frame = String::from_utf8(rx.recv().await.expect("error frame").to_vec()).unwrap();
        assert!(frame.starts_with("event: error"));
        assert!(frame.contains("response_too_large"));
        assert!(!frame.contains("\"type\""));

        assert!(rx.recv().await.is_none(), "no [DONE] frame follows an error frame");
    }

    #[test]
    fn rewrites_model_back_to_original() {
        let mut usage = OpenAIUsage::default();
        let line = r#"data: {"id":"1","model":"beta","choices":[{"index":0,"delta":{"content":"hi"}}]}"#;
        let out = process_passthrough_line(line, "alpha", "beta", true, &mut usage).unwrap();
        let value: Value = serde_json::from_str(out.trim_start_matches("data: ").trim()).unwrap();
        assert_eq!(value["model"], "alpha");
    }

    #[test]
    fn drops_usage_only_frame_when_not_requested() {
        let mut usage = OpenAIUsage::default();
        let line = r#"data: {"id":"1","model":"beta","choices":[],"usage":{"prompt_tokens":3,"completion_tokens":4}}"#;
        let out = process_passthrough_line(line, "beta", "beta", false, &mut usage);
        assert!(out.is_none());
        assert_eq!(usage.input_tokens, 3);
        assert_eq!(usage.output_tokens, 4);
    }

    #[test]
    fn keeps_usage_frame_when_requested() {
        let mut usage = OpenAIUsage::default();
        let line = r#"data: {"id":"1","model":"beta","choices":[],"usage":{"prompt_tokens":3,"completion_tokens":4}}"#;
        let out = process_passthrough_line(line, "beta", "beta", true, &mut usage);
        assert!(out.is_some());
    }

    #[test]
    fn non_data_lines_pass_through_unchanged() {
        let mut usage = OpenAIUsage::default();
        assert_eq!(process_passthrough_line("", "a", "a", true, &mut usage).unwrap(), "\n");
    }

    #[test]
    fn corrects_tool_names_inline() {
        let mut usage = OpenAIUsage::default();
        let line = r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"type":"function","function":{"name":"ShellExec"}}]}}]}"#;
        let out = process_passthrough_line(line, "a", "a", true, &mut usage).unwrap();
        assert!(out.contains("shell_exec"));
    }
}
