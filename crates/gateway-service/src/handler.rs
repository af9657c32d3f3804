use crate::state::AppState;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use futures::StreamExt;
use gateway_core::error::GatewayError;
use gateway_core::forwarder::{forward, ForwardOutcome, ForwardRequest};
use gateway_core::request_rewriter::rewrite_request;
use gateway_core::response_rewriter::{convert_responses_to_chat_completions, extract_final_response_frame};
use gateway_core::sse::passthrough::{run_passthrough_stream, PassthroughOptions};
use gateway_core::sse::synthesis::{run_synthesis_stream, SynthesisOptions};
use gateway_core::tool_correct::correct_tool_calls_in_value;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

fn error_json(status: StatusCode, message: &str) -> Response {
    error_json_typed(status, "invalid_request_error", message)
}

fn error_json_typed(status: StatusCode, error_type: &str, message: &str) -> Response {
    let body = serde_json::json!({ "error": { "message": message, "type": error_type } });
    (status, Json(body)).into_response()
}

fn is_authorized(state: &AppState, headers: &HeaderMap) -> bool {
    if state.api_keys.is_empty() {
        return true;
    }
    let Some(value) = headers.get(axum::http::header::AUTHORIZATION) else {
        return false;
    };
    let Ok(value) = value.to_str() else { return false };
    let Some(token) = value.strip_prefix("Bearer ") else { return false };
    state.api_keys.iter().any(|k| k == token)
}

pub async fn chat_completions(State(state): State<Arc<AppState>>, headers: HeaderMap, Json(mut body): Json<Value>) -> Response {
    if !is_authorized(&state, &headers) {
        return error_json(StatusCode::UNAUTHORIZED, "invalid api key");
    }

    let requested_model = body.get("model").and_then(Value::as_str).unwrap_or("").to_string();
    let Some(account) = state.accounts.pick_for_model(&requested_model) else {
        return error_json(StatusCode::SERVICE_UNAVAILABLE, "no upstream account configured");
    };

    let client_requested_stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);

    let rewrite_outcome = match rewrite_request(&mut body, account) {
        Ok(outcome) => outcome,
        Err(GatewayError::InvalidRequest(msg)) => return error_json(StatusCode::BAD_REQUEST, &msg),
        Err(err) => return error_json(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    };

    let access_token = match state.token_provider.get_access_token(account).await {
        Ok(token) => token,
        Err(err) => return error_json(StatusCode::BAD_GATEWAY, &err.to_string()),
    };

    let path = if rewrite_outcome.use_responses_api { "/v1/responses" } else { "/v1/chat/completions" };

    let forward_result = forward(
        ForwardRequest {
            account,
            access_token: &access_token,
            path,
            client_headers: &headers,
            body: &body,
        },
        &state.config,
        state.ops.as_ref(),
    )
    .await;

    let response = match forward_result {
        Ok(ForwardOutcome::Dispatch(resp)) => resp,
        Ok(ForwardOutcome::Failover(failover)) => {
            return error_json(
                StatusCode::from_u16(failover.status).unwrap_or(StatusCode::BAD_GATEWAY),
                "upstream account unavailable; no failover account configured",
            );
        }
        Err(GatewayError::Upstream { status, body }) => {
            return (StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY), Json(body)).into_response();
        }
        Err(GatewayError::Transport(detail)) => {
            tracing::warn!(error = detail, "upstream transport error");
            return error_json_typed(StatusCode::BAD_GATEWAY, "upstream_error", "Upstream request failed");
        }
        Err(err) => return error_json(StatusCode::BAD_GATEWAY, &err.to_string()),
    };

    record_codex_usage_snapshot(&state, account, &response);
    let upstream_headers = response.headers().clone();

    let mut out = if client_requested_stream {
        stream_response(&state, account, rewrite_outcome, response)
    } else {
        buffered_response(rewrite_outcome, response).await
    };
    gateway_core::config::write_filtered_headers(out.headers_mut(), &upstream_headers, &state.config.response_headers);
    out
}

async fn buffered_response(
    rewrite_outcome: gateway_core::request_rewriter::RewriteOutcome,
    response: reqwest::Response,
) -> Response {
    let bytes = match response.bytes().await {
        Ok(b) => b,
        Err(err) => return error_json(StatusCode::BAD_GATEWAY, &err.to_string()),
    };

    if rewrite_outcome.use_responses_api {
        let Some(frame) = extract_final_response_frame(&bytes) else {
            return error_json(StatusCode::BAD_GATEWAY, "upstream returned no response frame");
        };
        let (chat, _usage) =
            convert_responses_to_chat_completions(frame, &rewrite_outcome.original_model, &rewrite_outcome.mapped_model);
        Json(chat).into_response()
    } else {
        let mut value: Value = match extract_final_response_frame(&bytes).or_else(|| serde_json::from_slice(&bytes).ok()) {
            Some(v) => v,
            None => return error_json(StatusCode::BAD_GATEWAY, "upstream returned a non-JSON body"),
        };
        correct_tool_calls_in_value(&mut value);
        if rewrite_outcome.original_model != rewrite_outcome.mapped_model
            && value.get("model").and_then(Value::as_str) == Some(rewrite_outcome.mapped_model.as_str())
        {
            value["model"] = Value::String(rewrite_outcome.original_model.clone());
        }
        Json(value).into_response()
    }
}

fn stream_response(
    state: &Arc<AppState>,
    account: &gateway_core::account::Account,
    rewrite_outcome: gateway_core::request_rewriter::RewriteOutcome,
    response: reqwest::Response,
) -> Response {
    let (out_tx, out_rx) = mpsc::channel::<Bytes>(16);
    let cancel = CancellationToken::new();

    let byte_stream = response
        .bytes_stream()
        .map(|item| item.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)));
    let reader = tokio::io::BufReader::new(StreamReader::new(byte_stream));

    let max_line_size = state.config.max_line_size;
    let interval_timeout = non_zero_duration(state.config.stream_data_interval_timeout_secs);
    let keepalive_interval = non_zero_duration(state.config.stream_keepalive_interval_secs);
    let use_responses_api = rewrite_outcome.use_responses_api;
    let original_model = rewrite_outcome.original_model.clone();
    let mapped_model = rewrite_outcome.mapped_model.clone();
    let include_usage_downstream = rewrite_outcome.include_usage_downstream;

    let rate_limiter = state.rate_limiter.clone();
    let account = account.clone();

    tokio::spawn(async move {
        let result = if use_responses_api {
            run_synthesis_stream(
                reader,
                out_tx,
                cancel,
                SynthesisOptions {
                    max_line_size,
                    interval_timeout,
                    keepalive_interval,
                    original_model: original_model.clone(),
                    include_usage_downstream,
                },
            )
            .await
            .map(|outcome| outcome.timed_out)
        } else {
            run_passthrough_stream(
                reader,
                out_tx,
                cancel,
                PassthroughOptions {
                    max_line_size,
                    interval_timeout,
                    keepalive_interval,
                    original_model: original_model.clone(),
                    mapped_model: mapped_model.clone(),
                    include_usage_downstream,
                },
            )
            .await
            .map(|outcome| outcome.timed_out)
        };

        if matches!(result, Err(GatewayError::StreamTimeout)) {
            rate_limiter.handle_stream_timeout(&account, &mapped_model).await;
        }
    });

    let body_stream = ReceiverStream::new(out_rx).map(Ok::<Bytes, std::convert::Infallible>);
    let body = Body::from_stream(body_stream);

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .header("connection", "keep-alive")
        .header("x-accel-buffering", "no")
        .body(body)
        .expect("static headers form a valid response")
}

/// Forwards any `x-ratelimit-*`/`x-codex-*` response headers to the usage
/// snapshot sink so Codex/OAuth quota dashboards stay current. Plain OpenAI
/// accounts simply won't have these headers and the snapshot comes back
/// empty.
fn record_codex_usage_snapshot(state: &Arc<AppState>, account: &gateway_core::account::Account, response: &reqwest::Response) {
    let mut headers = std::collections::HashMap::new();
    for (name, value) in response.headers() {
        let lower = name.as_str().to_ascii_lowercase();
        if lower.starts_with("x-ratelimit") || lower.starts_with("x-codex") {
            if let Ok(v) = value.to_str() {
                headers.insert(lower, v.to_string());
            }
        }
    }
    if headers.is_empty() {
        return;
    }
    let usage_sink = state.usage_sink.clone();
    let account_id = account.id;
    tokio::spawn(async move {
        usage_sink
            .update_codex_usage_snapshot(account_id, gateway_core::collaborators::CodexUsageSnapshot { headers })
            .await;
    });
}

fn non_zero_duration(secs: u64) -> Option<Duration> {
    if secs == 0 {
        None
    } else {
        Some(Duration::from_secs(secs))
    }
}
