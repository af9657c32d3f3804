use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

/// Upstream statuses that should cause the outer dispatcher to retry a
/// different account rather than surface the error to the client.
pub fn is_failover_status(status: u16) -> bool {
    matches!(status, 401 | 402 | 403 | 429) || (500..600).contains(&status)
}

fn url_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"https?://\S+").unwrap())
}

fn bearer_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(sk-|Bearer\s+)[A-Za-z0-9._-]+").unwrap())
}

fn uuid_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}")
            .unwrap()
    })
}

/// Strips URLs, bearer/API tokens, and UUID-shaped provider-internal
/// identifiers from a free-text upstream error message before it is written
/// to the client or the ops log.
pub fn sanitize_upstream_error_message(message: &str) -> String {
    let redacted = url_pattern().replace_all(message, "[url]");
    let redacted = bearer_pattern().replace_all(&redacted, "[redacted]");
    let redacted = uuid_pattern().replace_all(&redacted, "[id]");
    redacted.trim().to_string()
}

/// Truncates `body` to at most `max_bytes`, respecting UTF-8 boundaries,
/// for bounded verbatim capture into the ops record.
pub fn truncate_string(body: &str, max_bytes: usize) -> String {
    if body.len() <= max_bytes {
        return body.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_string()
}

/// Best-effort extraction of `{"error":{"message": "..."}}` from an
/// upstream error body.
pub fn extract_upstream_error_message(body: &[u8]) -> String {
    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        return String::new();
    };
    value
        .pointer("/error/message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Builds the JSON body forwarded to the client for a permanent upstream
/// error. When the upstream body parses as `{"error": {"message": ...}}`,
/// the original shape is preserved verbatim — `type`, `code`, `param` and
/// any other sibling keys — with only the nested `message` sanitized in
/// place. Otherwise synthesizes the same `upstream_error` shape used for
/// transport failures.
pub fn build_upstream_error_body(body: &[u8], status: u16) -> Value {
    if let Ok(mut value) = serde_json::from_slice::<Value>(body) {
        let message = value.pointer("/error/message").and_then(Value::as_str).map(str::to_string);
        if let Some(message) = message {
            if let Some(error_obj) = value.get_mut("error").and_then(Value::as_object_mut) {
                error_obj.insert("message".to_string(), Value::String(sanitize_upstream_error_message(&message)));
                return value;
            }
        }
    }
    serde_json::json!({ "error": { "message": default_upstream_message(status), "type": "upstream_error" } })
}

/// Default client-facing message for a permanent upstream error, keyed on
/// status when the body did not parse as `{error:{message}}`.
pub fn default_upstream_message(status: u16) -> &'static str {
    match status {
        401 => "Upstream authentication failed, please contact administrator",
        402 => "Upstream payment required: insufficient balance or billing issue",
        403 => "Upstream access forbidden, please contact administrator",
        429 => "Upstream rate limit exceeded, please retry later",
        _ => "Upstream request failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failover_set_covers_spec_statuses() {
        for status in [401, 402, 403, 429, 500, 502, 529] {
            assert!(is_failover_status(status), "{status} should fail over");
        }
        for status in [400, 404, 422] {
            assert!(!is_failover_status(status), "{status} should not fail over");
        }
    }

    #[test]
    fn sanitizes_urls_and_tokens() {
        let msg = "call failed at https://api.internal.example.com/v1/x with key sk-abc123DEF";
        let cleaned = sanitize_upstream_error_message(msg);
        assert!(!cleaned.contains("https://"));
        assert!(!cleaned.contains("sk-abc123DEF"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let body = "héllo world";
        let truncated = truncate_string(body, 3);
        assert!(body.as_bytes().len() >= truncated.as_bytes().len());
        assert!(std::str::from_utf8(truncated.as_bytes()).is_ok());
    }

    #[test]
    fn extracts_error_message_shape() {
        let body = br#"{"error":{"message":"bad request"}}"#;
        assert_eq!(extract_upstream_error_message(body), "bad request");
    }

    #[test]
    fn upstream_error_body_preserves_original_shape_sanitizing_message_only() {
        let body = br#"{"error":{"message":"token sk-abc123DEF rejected","type":"invalid_request_error","code":"invalid_api_key","param":null}}"#;
        let value = build_upstream_error_body(body, 401);
        assert_eq!(value["error"]["type"], "invalid_request_error");
        assert_eq!(value["error"]["code"], "invalid_api_key");
        assert!(!value["error"]["message"].as_str().unwrap().contains("sk-abc123DEF"));
    }

    #[test]
    fn upstream_error_body_falls_back_when_unparseable() {
        let value = build_upstream_error_body(b"not json", 500);
        assert_eq!(value["error"]["type"], "upstream_error");
        assert_eq!(value["error"]["message"], "Upstream request failed");
    }
}
