use serde_json::Value;

/// Known malformed -> canonical tool/function name pairs. Not meant to be
/// exhaustive; upstream providers occasionally emit names with casing or
/// separator variants that differ from what the client's tool schema
/// declared, and the corrector canonicalizes just those.
const KNOWN_CORRECTIONS: &[(&str, &str)] = &[
    ("ShellExec", "shell_exec"),
    ("shellExec", "shell_exec"),
    ("Shell-Exec", "shell_exec"),
    ("WebSearch", "web_search"),
    ("ReadFile", "read_file"),
    ("WriteFile", "write_file"),
];

/// Canonicalizes a single tool/function name. Returns `(name, false)`
/// unchanged when no correction applies.
pub fn correct_tool_name(name: &str) -> (String, bool) {
    for (bad, good) in KNOWN_CORRECTIONS {
        if *bad == name {
            return (good.to_string(), true);
        }
    }
    (name.to_string(), false)
}

fn correct_tool_calls_value(value: &mut Value) -> bool {
    let mut changed = false;
    match value {
        Value::Object(map) => {
            if map.get("type").and_then(Value::as_str) == Some("function") {
                if let Some(Value::Object(function)) = map.get_mut("function") {
                    if let Some(Value::String(name)) = function.get_mut("name") {
                        let (corrected, did_change) = correct_tool_name(name);
                        if did_change {
                            *name = corrected;
                            changed = true;
                        }
                    }
                }
            }
            if map.get("call_id").is_some() || map.get("name").is_some() {
                if let Some(Value::String(name)) = map.get_mut("name") {
                    let (corrected, did_change) = correct_tool_name(name);
                    if did_change {
                        *name = corrected;
                        changed = true;
                    }
                }
            }
            for v in map.values_mut() {
                changed |= correct_tool_calls_value(v);
            }
        }
        Value::Array(items) => {
            for item in items {
                changed |= correct_tool_calls_value(item);
            }
        }
        _ => {}
    }
    changed
}

/// Walks a whole SSE data payload (already parsed) looking for tool-call /
/// function-call fragments and rewrites their names in place. Returns
/// whether anything changed, so callers can decide whether to re-serialize.
pub fn correct_tool_calls_in_value(value: &mut Value) -> bool {
    correct_tool_calls_value(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrects_known_name() {
        let (name, changed) = correct_tool_name("ShellExec");
        assert_eq!(name, "shell_exec");
        assert!(changed);
    }

    #[test]
    fn leaves_unknown_name_alone() {
        let (name, changed) = correct_tool_name("already_snake_case");
        assert_eq!(name, "already_snake_case");
        assert!(!changed);
    }

    #[test]
    fn rewrites_nested_function_call_name() {
        let mut value = serde_json::json!({
            "choices": [{
                "delta": {
                    "tool_calls": [{
                        "index": 0,
                        "type": "function",
                        "function": { "name": "ShellExec", "arguments": "{}" }
                    }]
                }
            }]
        });
        assert!(correct_tool_calls_in_value(&mut value));
        assert_eq!(
            value["choices"][0]["delta"]["tool_calls"][0]["function"]["name"],
            "shell_exec"
        );
    }
}
