//! Flat Java-properties rendering for the Conqueso compatibility API.

use serde_json::Value;

/// Flatten a property tree into `key=value` lines. Nested mappings take
/// dotted keys, scalar sequences render comma-separated, and nulls and
/// non-scalar sequence items are skipped.
pub fn flatten(tree: &Value) -> String {
    let mut lines = Vec::new();
    walk("", tree, &mut lines);
    lines.join("\n")
}

fn walk(prefix: &str, node: &Value, lines: &mut Vec<String>) {
    match node {
        Value::Object(map) => {
            for (key, value) in map {
                let child = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                walk(&child, value, lines);
            }
        }
        Value::Array(items) => {
            let scalars: Vec<String> = items.iter().filter_map(scalar).collect();
            lines.push(format!("{}={}", prefix, scalars.join(",")));
        }
        Value::Null => {}
        other => {
            if let Some(text) = scalar(other) {
                lines.push(format!("{}={}", prefix, text));
            }
        }
    }
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
