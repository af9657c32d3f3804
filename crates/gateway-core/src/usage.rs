use serde_json::{Map, Value};

/// Mutable token accumulator carried through a single request. `total_tokens`
/// is never stored — it is always `input_tokens + output_tokens` at the
/// point something asks for it.
#[derive(Debug, Clone, Default, Copy)]
pub struct OpenAIUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_input_tokens: i64,
}

impl OpenAIUsage {
    pub fn total_tokens(&self) -> i64 {
        self.input_tokens + self.output_tokens
    }

    /// Downstream chat-completions `usage` object, as emitted on the
    /// terminal streaming chunk or the non-streaming envelope.
    pub fn to_chat_payload(&self) -> Value {
        serde_json::json!({
            "prompt_tokens": self.input_tokens,
            "completion_tokens": self.output_tokens,
            "total_tokens": self.total_tokens(),
            "prompt_tokens_details": { "cached_tokens": self.cache_read_input_tokens },
            "completion_tokens_details": { "reasoning_tokens": 0 },
        })
    }

    /// Merge a `usage` object found in either chat or responses wire shape.
    /// Absent fields leave the prior value untouched.
    pub fn merge_from_value(&mut self, usage: &Value) {
        if let Some(v) = usage.get("prompt_tokens").and_then(Value::as_i64) {
            self.input_tokens = v;
        } else if let Some(v) = usage.get("input_tokens").and_then(Value::as_i64) {
            self.input_tokens = v;
        }

        if let Some(v) = usage.get("completion_tokens").and_then(Value::as_i64) {
            self.output_tokens = v;
        } else if let Some(v) = usage.get("output_tokens").and_then(Value::as_i64) {
            self.output_tokens = v;
        }

        if let Some(cached) = usage
            .get("prompt_tokens_details")
            .and_then(|d| d.get("cached_tokens"))
            .and_then(Value::as_i64)
        {
            self.cache_read_input_tokens = cached;
        } else if let Some(cached) = usage
            .get("input_tokens_details")
            .and_then(|d| d.get("cached_tokens"))
            .and_then(Value::as_i64)
        {
            self.cache_read_input_tokens = cached;
        }
    }
}

/// Updates `usage` from a chat-completions SSE data payload. Returns `true`
/// iff the payload carried a `usage` object.
pub fn update_chat_usage_from_stream_chunk(payload: &Value, usage: &mut OpenAIUsage) -> bool {
    match payload.get("usage") {
        Some(v) if !v.is_null() => {
            usage.merge_from_value(v);
            true
        }
        _ => false,
    }
}

/// Strips `usage` from a chat-completions SSE chunk in place. Returns
/// `false` if there was no `usage` key (the chunk is unchanged). Returns
/// `true` when `usage` was removed; the caller must then check whether
/// `choices` is now empty and, if so, drop the chunk entirely rather than
/// forward it (an empty-`choices`, usage-only frame has nothing left to say).
pub fn strip_usage(payload: &mut Map<String, Value>) -> bool {
    payload.remove("usage").is_some()
}

pub fn has_empty_choices(payload: &Map<String, Value>) -> bool {
    matches!(payload.get("choices"), Some(Value::Array(a)) if a.is_empty())
}
