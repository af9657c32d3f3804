use crate::account::{Account, AccountType};
use crate::codex_model::normalize_codex_model;
use crate::error::GatewayError;
use serde_json::{Map, Value};

/// What the Forwarder needs to know after the Request Rewriter has run.
#[derive(Debug, Clone)]
pub struct RewriteOutcome {
    pub use_responses_api: bool,
    pub include_usage_downstream: bool,
    pub original_model: String,
    pub mapped_model: String,
}

/// Applies the full Request Rewriter transformation chain in place on
/// `body` and reports the decisions the rest of the pipeline needs.
pub fn rewrite_request(body: &mut Value, account: &Account) -> Result<RewriteOutcome, GatewayError> {
    let obj = body
        .as_object_mut()
        .ok_or_else(|| GatewayError::InvalidRequest("request body must be a JSON object".into()))?;

    let original_model = obj
        .get("model")
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::InvalidRequest("model is required".into()))?
        .to_string();

    let account_mapped = account.map_model(&original_model);
    let mapped_model = normalize_codex_model(&account_mapped).unwrap_or(account_mapped);
    if mapped_model != original_model {
        obj.insert("model".to_string(), Value::String(mapped_model.clone()));
    }

    let stream = obj.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let include_usage_downstream = obj
        .get("stream_options")
        .and_then(|v| v.get("include_usage"))
        .and_then(Value::as_bool)
        .unwrap_or(false);

    if stream && !include_usage_downstream {
        ensure_stream_usage(obj);
    }

    normalize_reasoning_effort(obj);

    let use_responses_api = account.account_type == AccountType::OAuthResponses;
    if use_responses_api {
        convert_chat_completions_to_responses(obj)?;
    }

    Ok(RewriteOutcome {
        use_responses_api,
        include_usage_downstream,
        original_model,
        mapped_model,
    })
}

fn ensure_stream_usage(obj: &mut Map<String, Value>) {
    let entry = obj
        .entry("stream_options")
        .or_insert_with(|| Value::Object(Map::new()));
    if let Value::Object(stream_options) = entry {
        stream_options.insert("include_usage".to_string(), Value::Bool(true));
    }
}

fn normalize_reasoning_effort(obj: &mut Map<String, Value>) {
    if let Some(Value::String(effort)) = obj.remove("reasoning_effort") {
        let effort = effort.trim();
        if !effort.is_empty() {
            let reasoning = obj
                .entry("reasoning")
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(reasoning_map) = reasoning {
                reasoning_map
                    .entry("effort")
                    .or_insert_with(|| Value::String(effort.to_string()));
            }
        }
    }

    if let Some(Value::Object(reasoning)) = obj.get_mut("reasoning") {
        if reasoning.get("effort").and_then(Value::as_str) == Some("minimal") {
            reasoning.insert("effort".to_string(), Value::String("none".to_string()));
        }
    }
}

/// Rewrites a chat-completions request body into responses shape in place.
fn convert_chat_completions_to_responses(obj: &mut Map<String, Value>) -> Result<(), GatewayError> {
    let messages = obj
        .remove("messages")
        .and_then(|v| if let Value::Array(a) = v { Some(a) } else { None })
        .ok_or_else(|| GatewayError::InvalidRequest("messages must be an array".into()))?;

    let mut filtered = Vec::with_capacity(messages.len());
    let mut instructions_parts = Vec::new();
    for msg in messages {
        let Some(msg_map) = msg.as_object() else { continue };
        let role = msg_map.get("role").and_then(Value::as_str).unwrap_or("").trim();
        if role == "system" {
            let content = extract_chat_content_as_string(msg_map.get("content"));
            if !content.trim().is_empty() {
                instructions_parts.push(content);
            }
            continue;
        }
        filtered.push(msg);
    }

    let input_items = convert_chat_messages_to_input(&filtered)?;
    obj.insert("input".to_string(), Value::Array(input_items));

    if !obj.contains_key("instructions") && !instructions_parts.is_empty() {
        obj.insert(
            "instructions".to_string(),
            Value::String(instructions_parts.join("\n")),
        );
    }

    obj.entry("store").or_insert(Value::Bool(false));
    let needs_stream = !matches!(obj.get("stream"), Some(Value::Bool(true)));
    if needs_stream {
        obj.insert("stream".to_string(), Value::Bool(true));
    }

    if !obj.contains_key("tools") {
        if let Some(Value::Array(functions)) = obj.remove("functions") {
            obj.insert("tools".to_string(), Value::Array(convert_chat_functions_to_tools(functions)));
        }
    }
    obj.remove("functions");

    if !obj.contains_key("tool_choice") {
        if let Some(function_call) = obj.remove("function_call") {
            obj.insert("tool_choice".to_string(), convert_function_call_to_tool_choice(function_call));
        }
    }
    obj.remove("function_call");

    if !obj.contains_key("text") {
        if let Some(response_format) = obj.remove("response_format") {
            let mut text = Map::new();
            text.insert("format".to_string(), response_format);
            obj.insert("text".to_string(), Value::Object(text));
        }
    }
    obj.remove("response_format");

    if !obj.contains_key("max_output_tokens") {
        if let Some(v) = obj.remove("max_completion_tokens") {
            obj.insert("max_output_tokens".to_string(), v);
        } else if let Some(v) = obj.remove("max_tokens") {
            obj.insert("max_output_tokens".to_string(), v);
        }
    }
    obj.remove("max_completion_tokens");
    obj.remove("max_tokens");

    Ok(())
}

fn convert_chat_messages_to_input(messages: &[Value]) -> Result<Vec<Value>, GatewayError> {
    let mut input = Vec::with_capacity(messages.len());
    for msg in messages {
        let Some(msg_map) = msg.as_object() else { continue };
        let role = msg_map.get("role").and_then(Value::as_str).unwrap_or("").trim().to_string();
        if role.is_empty() {
            continue;
        }

        if role == "tool" || role == "function" {
            let output = extract_chat_content_as_string(msg_map.get("content"));
            let call_id = msg_map
                .get("tool_call_id")
                .and_then(Value::as_str)
                .map(str::trim)
                .unwrap_or("");
            let name = msg_map.get("name").and_then(Value::as_str).map(str::trim).unwrap_or("");
            if call_id.is_empty() && name.is_empty() {
                return Err(GatewayError::InvalidRequest(
                    "tool messages require tool_call_id or name".into(),
                ));
            }
            let mut item = Map::new();
            item.insert("type".to_string(), Value::String("function_call_output".to_string()));
            item.insert("output".to_string(), Value::String(output));
            item.insert(
                "call_id".to_string(),
                Value::String(if call_id.is_empty() { name.to_string() } else { call_id.to_string() }),
            );
            if !name.is_empty() {
                item.insert("name".to_string(), Value::String(name.to_string()));
            }
            input.push(Value::Object(item));
            continue;
        }

        if role == "assistant" {
            if let Some(Value::Array(tool_calls)) = msg_map.get("tool_calls") {
                for call in tool_calls {
                    if let Some(item) = convert_chat_tool_call_to_input(call) {
                        input.push(item);
                    }
                }
            }
            if let Some(Value::Object(function_call)) = msg_map.get("function_call") {
                if let Some(item) = convert_chat_function_call_to_input(function_call) {
                    input.push(item);
                }
            }
        }

        let Some(content_parts) = convert_chat_content_to_input_parts(msg_map.get("content")) else {
            continue;
        };
        let mut message_item = Map::new();
        message_item.insert("role".to_string(), Value::String(role));
        message_item.insert("content".to_string(), Value::Array(content_parts));
        if let Some(name) = msg_map.get("name").and_then(Value::as_str) {
            if !name.trim().is_empty() {
                message_item.insert("name".to_string(), Value::String(name.to_string()));
            }
        }
        input.push(Value::Object(message_item));
    }
    Ok(input)
}

fn convert_chat_content_to_input_parts(content: Option<&Value>) -> Option<Vec<Value>> {
    match content {
        Some(Value::String(s)) => {
            if s.trim().is_empty() {
                None
            } else {
                Some(vec![serde_json::json!({"type": "input_text", "text": s})])
            }
        }
        Some(Value::Array(parts)) => {
            let mut out = Vec::with_capacity(parts.len());
            for part in parts {
                let Some(part_map) = part.as_object() else { continue };
                match part_map.get("type").and_then(Value::as_str).unwrap_or("").trim() {
                    "text" => {
                        if let Some(text) = part_map.get("text") {
                            out.push(serde_json::json!({"type": "input_text", "text": text}));
                        }
                    }
                    "image_url" => {
                        if let Some(image_url) = part_map.get("image_url") {
                            out.push(serde_json::json!({"type": "input_image", "image_url": image_url}));
                        }
                    }
                    _ => out.push(part.clone()),
                }
            }
            if out.is_empty() { None } else { Some(out) }
        }
        _ => None,
    }
}

fn extract_chat_content_as_string(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

fn convert_chat_tool_call_to_input(call: &Value) -> Option<Value> {
    let call_map = call.as_object()?;
    let call_id = call_map.get("id").and_then(Value::as_str).unwrap_or("").trim();
    let function = call_map.get("function").and_then(Value::as_object);
    let name = function.and_then(|f| f.get("name")).and_then(Value::as_str).unwrap_or("").trim();
    let arguments = function.and_then(|f| f.get("arguments"));

    let mut item = Map::new();
    item.insert("type".to_string(), Value::String("function_call".to_string()));
    if !call_id.is_empty() {
        item.insert("call_id".to_string(), Value::String(call_id.to_string()));
        item.insert("id".to_string(), Value::String(call_id.to_string()));
    }
    if !name.is_empty() {
        item.insert("name".to_string(), Value::String(name.to_string()));
    }
    if let Some(args) = arguments {
        item.insert("arguments".to_string(), args.clone());
    }
    Some(Value::Object(item))
}

fn convert_chat_function_call_to_input(function_call: &Map<String, Value>) -> Option<Value> {
    let name = function_call.get("name").and_then(Value::as_str).unwrap_or("").trim();
    let arguments = function_call.get("arguments");
    if name.is_empty() && arguments.is_none() {
        return None;
    }
    let mut item = Map::new();
    item.insert("type".to_string(), Value::String("function_call".to_string()));
    if !name.is_empty() {
        item.insert("name".to_string(), Value::String(name.to_string()));
        item.insert("call_id".to_string(), Value::String(name.to_string()));
        item.insert("id".to_string(), Value::String(name.to_string()));
    }
    if let Some(args) = arguments {
        item.insert("arguments".to_string(), args.clone());
    }
    Some(Value::Object(item))
}

fn convert_chat_functions_to_tools(functions: Vec<Value>) -> Vec<Value> {
    functions
        .into_iter()
        .filter(|f| f.is_object())
        .map(|f| serde_json::json!({"type": "function", "function": f}))
        .collect()
}

fn convert_function_call_to_tool_choice(function_call: Value) -> Value {
    match &function_call {
        Value::String(_) => function_call,
        Value::Object(map) => {
            let name = map.get("name").and_then(Value::as_str).unwrap_or("").trim();
            if name.is_empty() {
                function_call
            } else {
                serde_json::json!({"type": "function", "name": name})
            }
        }
        _ => function_call,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn chat_account(account_type: AccountType) -> Account {
        Account::new(1, "test", account_type, "token")
    }

    #[test]
    fn model_mapping_applies_before_codex_normalization() {
        let mut map = HashMap::new();
        map.insert("alpha".to_string(), "codex-mini-2024-09-01".to_string());
        let account = chat_account(AccountType::ChatNative).with_model_map(map);
        let mut body = serde_json::json!({"model": "alpha", "messages": []});
        let outcome = rewrite_request(&mut body, &account).unwrap();
        assert_eq!(outcome.original_model, "alpha");
        assert_eq!(outcome.mapped_model, "codex-mini");
        assert_eq!(body["model"], "codex-mini");
    }

    #[test]
    fn single_rename_path_without_codex_suffix() {
        let mut map = HashMap::new();
        map.insert("alpha".to_string(), "beta".to_string());
        let account = chat_account(AccountType::ChatNative).with_model_map(map);
        let mut body = serde_json::json!({"model": "alpha", "messages": []});
        let outcome = rewrite_request(&mut body, &account).unwrap();
        assert_eq!(outcome.mapped_model, "beta");
    }

    #[test]
    fn injects_stream_usage_when_missing() {
        let account = chat_account(AccountType::ChatNative);
        let mut body = serde_json::json!({"model": "gpt-4o", "messages": [], "stream": true});
        let outcome = rewrite_request(&mut body, &account).unwrap();
        assert!(!outcome.include_usage_downstream);
        assert_eq!(body["stream_options"]["include_usage"], true);
    }

    #[test]
    fn reasoning_effort_minimal_becomes_none() {
        let account = chat_account(AccountType::ChatNative);
        let mut body = serde_json::json!({"model": "g", "messages": [], "reasoning_effort": "minimal"});
        rewrite_request(&mut body, &account).unwrap();
        assert!(body.get("reasoning_effort").is_none());
        assert_eq!(body["reasoning"]["effort"], "none");
    }

    #[test]
    fn oauth_account_converts_to_responses_shape() {
        let account = chat_account(AccountType::OAuthResponses);
        let mut body = serde_json::json!({
            "model": "g",
            "messages": [
                {"role": "system", "content": "be nice"},
                {"role": "user", "content": "hi"},
            ],
            "stream": false,
        });
        let outcome = rewrite_request(&mut body, &account).unwrap();
        assert!(outcome.use_responses_api);
        assert_eq!(body["instructions"], "be nice");
        assert_eq!(body["store"], false);
        assert_eq!(body["stream"], true);
        assert!(body.get("messages").is_none());
        assert_eq!(body["input"][0]["role"], "user");
    }

    #[test]
    fn tool_call_round_trips_through_responses_shape() {
        use crate::response_rewriter::convert_responses_to_chat_completions;

        let account = chat_account(AccountType::OAuthResponses);
        let mut body = serde_json::json!({
            "model": "g",
            "messages": [
                {"role": "user", "content": "run it"},
                {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": { "name": "ShellExec", "arguments": "{\"cmd\":\"ls\"}" },
                    }],
                },
            ],
        });
        rewrite_request(&mut body, &account).unwrap();

        // The request rewriter turned the assistant's prior tool call into a
        // `function_call` input item; simulate the upstream echoing that same
        // item back as its `output`, then decode it back to chat shape.
        let function_call_item = body["input"]
            .as_array()
            .unwrap()
            .iter()
            .find(|item| item["type"] == "function_call")
            .cloned()
            .expect("assistant tool_calls must produce a function_call input item");

        let simulated_response = serde_json::json!({
            "id": "resp_1",
            "model": "g",
            "output": [function_call_item],
        });
        let (chat, _usage) = convert_responses_to_chat_completions(simulated_response, "g", "g");

        let tool_call = &chat["choices"][0]["message"]["tool_calls"][0];
        assert_eq!(tool_call["id"], "call_1");
        assert_eq!(tool_call["function"]["name"], "shell_exec");
        assert_eq!(tool_call["function"]["arguments"], "{\"cmd\":\"ls\"}");
        assert_eq!(chat["choices"][0]["finish_reason"], "tool_calls");
    }

    #[test]
    fn tool_message_without_identifiers_is_rejected() {
        let account = chat_account(AccountType::OAuthResponses);
        let mut body = serde_json::json!({
            "model": "g",
            "messages": [{"role": "tool", "content": "result"}],
        });
        let err = rewrite_request(&mut body, &account).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest(_)));
    }
}
