use crate::tool_correct::correct_tool_name;
use crate::usage::OpenAIUsage;
use serde_json::{Map, Value};

/// Extracts the final JSON frame from a body that might actually be an SSE
/// stream (upstream sometimes returns `text/event-stream` even though the
/// client asked for a buffered response). Returns the parsed frame of the
/// last `data:` line that is not `[DONE]`, or parses `body` directly as
/// JSON if it contains no `data:` lines at all.
pub fn extract_final_response_frame(body: &[u8]) -> Option<Value> {
    let text = std::str::from_utf8(body).ok()?;
    if !text.contains("data:") {
        return serde_json::from_slice(body).ok();
    }
    let mut last = None;
    for line in text.lines() {
        let Some(rest) = line.strip_prefix("data:") else { continue };
        let payload = rest.trim();
        if payload.is_empty() || payload == "[DONE]" {
            continue;
        }
        if let Ok(value) = serde_json::from_str::<Value>(payload) {
            last = Some(value);
        }
    }
    last
}

/// Converts a buffered `responses`-shape body into a chat-completions
/// envelope, mapping the model back to the client's original string when it
/// was rewritten upstream.
pub fn convert_responses_to_chat_completions(
    mut resp: Value,
    original_model: &str,
    mapped_model: &str,
) -> (Value, OpenAIUsage) {
    if original_model != mapped_model {
        if resp.get("model").and_then(Value::as_str) == Some(mapped_model) {
            resp["model"] = Value::String(original_model.to_string());
        }
    }

    let id = resp.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
    let created = resp.get("created_at").and_then(Value::as_i64).unwrap_or(0);
    let model = resp.get("model").and_then(Value::as_str).unwrap_or_default().to_string();

    let (mut message, tool_calls, reasoning_content, refusal_text, annotations) =
        extract_chat_message_from_responses(&resp);

    let has_tool_calls = !tool_calls.is_empty();
    let finish_reason = resolve_finish_reason_from_response(&resp, has_tool_calls);

    if let Value::Object(msg) = &mut message {
        if has_tool_calls {
            msg.insert("tool_calls".to_string(), Value::Array(tool_calls));
        }
        if !reasoning_content.is_empty() {
            msg.insert("reasoning_content".to_string(), Value::String(reasoning_content));
        }
        if !refusal_text.is_empty() {
            msg.insert("refusal".to_string(), Value::String(refusal_text));
        }
        if !annotations.is_empty() {
            msg.insert("annotations".to_string(), Value::Array(annotations));
        }
    }

    let mut usage = OpenAIUsage::default();
    if let Some(usage_val) = resp.get("usage") {
        usage.merge_from_value(usage_val);
    }

    let chat_response = serde_json::json!({
        "id": id,
        "object": "chat.completion",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": finish_reason,
        }],
        "usage": usage.to_chat_payload(),
    });

    (chat_response, usage)
}

fn extract_chat_message_from_responses(resp: &Value) -> (Value, Vec<Value>, String, String, Vec<Value>) {
    let mut message = Map::new();
    message.insert("role".to_string(), Value::String("assistant".to_string()));

    let Some(output) = resp.get("output").and_then(Value::as_array) else {
        message.insert("content".to_string(), Value::Null);
        return (Value::Object(message), Vec::new(), String::new(), String::new(), Vec::new());
    };

    let mut content_parts = Vec::new();
    let mut reasoning_parts = Vec::new();
    let mut refusal_parts = Vec::new();
    let mut annotations = Vec::new();
    let mut tool_calls = Vec::new();

    for item in output {
        let Some(item_map) = item.as_object() else { continue };
        match item_map.get("type").and_then(Value::as_str).unwrap_or("") {
            "message" => {
                if let Some(role) = item_map.get("role").and_then(Value::as_str) {
                    if !role.is_empty() {
                        message.insert("role".to_string(), Value::String(role.to_string()));
                    }
                }
                if let Some(parts) = item_map.get("content").and_then(Value::as_array) {
                    for part in parts {
                        let Some(part_map) = part.as_object() else { continue };
                        match part_map.get("type").and_then(Value::as_str).unwrap_or("") {
                            "output_text" => {
                                if let Some(text) = part_map.get("text").and_then(Value::as_str) {
                                    content_parts.push(text.to_string());
                                }
                                if let Some(ann) = part_map.get("annotations").and_then(Value::as_array) {
                                    annotations.extend(ann.iter().cloned());
                                }
                            }
                            "reasoning_text" | "reasoning_summary_text" | "output_reasoning" => {
                                if let Some(text) = part_map.get("text").and_then(Value::as_str) {
                                    reasoning_parts.push(text.to_string());
                                }
                            }
                            "refusal" => {
                                if let Some(text) = part_map.get("text").and_then(Value::as_str) {
                                    refusal_parts.push(text.to_string());
                                }
                            }
                            _ => {}
                        }
                    }
                }
            }
            "function_call" | "tool_call" => {
                if let Some(tool_call) = convert_responses_tool_call_to_chat(item_map) {
                    tool_calls.push(tool_call);
                }
            }
            _ => {}
        }
    }

    if content_parts.is_empty() {
        message.insert("content".to_string(), Value::Null);
    } else {
        message.insert("content".to_string(), Value::String(content_parts.join("")));
    }

    (
        Value::Object(message),
        tool_calls,
        reasoning_parts.join(""),
        refusal_parts.join(""),
        annotations,
    )
}

fn convert_responses_tool_call_to_chat(item: &Map<String, Value>) -> Option<Value> {
    let call_id = item
        .get("call_id")
        .and_then(Value::as_str)
        .or_else(|| item.get("id").and_then(Value::as_str))
        .unwrap_or_default();
    let raw_name = item.get("name").and_then(Value::as_str).unwrap_or_default();
    let (name, _) = correct_tool_name(raw_name);

    let mut function = Map::new();
    function.insert("name".to_string(), Value::String(name));
    if let Some(args) = item.get("arguments") {
        if !args.is_null() {
            function.insert("arguments".to_string(), args.clone());
        }
    }

    Some(serde_json::json!({
        "id": call_id,
        "type": "function",
        "function": function,
    }))
}

fn resolve_finish_reason_from_response(resp: &Value, has_tool_calls: bool) -> &'static str {
    if has_tool_calls {
        return "tool_calls";
    }
    if resp.get("status").and_then(Value::as_str) == Some("incomplete") {
        return "length";
    }
    "stop"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_final_frame_from_sse_body() {
        let body = b"data: {\"id\":\"a\"}\n\ndata: {\"id\":\"b\"}\n\ndata: [DONE]\n\n";
        let frame = extract_final_response_frame(body).unwrap();
        assert_eq!(frame["id"], "b");
    }

    #[test]
    fn converts_text_message_to_chat_completion() {
        let resp = serde_json::json!({
            "id": "r1",
            "model": "g",
            "created_at": 1000,
            "status": "completed",
            "output": [{
                "type": "message",
                "role": "assistant",
                "content": [{"type": "output_text", "text": "hello"}],
            }],
            "usage": {"input_tokens": 1, "output_tokens": 2},
        });
        let (chat, usage) = convert_responses_to_chat_completions(resp, "g", "g");
        assert_eq!(chat["choices"][0]["message"]["content"], "hello");
        assert_eq!(chat["choices"][0]["finish_reason"], "stop");
        assert_eq!(usage.input_tokens, 1);
        assert_eq!(usage.output_tokens, 2);
    }

    #[test]
    fn tool_call_forces_tool_calls_finish_reason() {
        let resp = serde_json::json!({
            "id": "r1",
            "model": "g",
            "output": [{
                "type": "function_call",
                "call_id": "c1",
                "name": "ShellExec",
                "arguments": "{}",
            }],
        });
        let (chat, _) = convert_responses_to_chat_completions(resp, "g", "g");
        assert_eq!(chat["choices"][0]["finish_reason"], "tool_calls");
        assert_eq!(
            chat["choices"][0]["message"]["tool_calls"][0]["function"]["name"],
            "shell_exec"
        );
    }

    #[test]
    fn model_is_rewritten_back_to_original() {
        let resp = serde_json::json!({"id": "r1", "model": "beta", "output": []});
        let (chat, _) = convert_responses_to_chat_completions(resp, "alpha", "beta");
        assert_eq!(chat["model"], "alpha");
    }
}
