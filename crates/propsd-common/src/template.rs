//! `{{ dotted.path }}` interpolation against a property tree.
//!
//! Recognized references are `{{` WS ident (`.` ident)* WS `}}` where ident
//! is `[A-Za-z0-9_-]+`. A reference that does not resolve to a scalar fails
//! the whole coercion with [`Error::UnresolvedTemplate`]. Sequences are not
//! descended into.

use crate::error::{Error, Result};
use crate::properties;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

lazy_static! {
    static ref REFERENCE: Regex =
        Regex::new(r"\{\{\s*([A-Za-z0-9_-]+(?:\.[A-Za-z0-9_-]+)*)\s*\}\}").unwrap();
}

/// Substitute every `{{ path }}` occurrence in `input` with the string form
/// of the value at that dotted path in `scope`.
pub fn render(input: &str, scope: &Value) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut last = 0;

    for caps in REFERENCE.captures_iter(input) {
        let whole = caps.get(0).unwrap();
        let path = caps.get(1).unwrap().as_str();

        let value = properties::get_path(scope, path)
            .ok_or_else(|| Error::UnresolvedTemplate(path.to_string()))?;
        let rendered = match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            // Mappings, sequences, and null have no scalar string form
            _ => return Err(Error::UnresolvedTemplate(path.to_string())),
        };

        out.push_str(&input[last..whole.start()]);
        out.push_str(&rendered);
        last = whole.end();
    }

    out.push_str(&input[last..]);
    Ok(out)
}

/// Interpolate the string values of a parameters mapping against `scope`.
/// Non-string values pass through unchanged; sequences are not walked.
pub fn render_parameters(parameters: &Value, scope: &Value) -> Result<Value> {
    match parameters {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, value) in map {
                let value = match value {
                    Value::String(s) => Value::String(render(s, scope)?),
                    other => other.clone(),
                };
                out.insert(key.clone(), value);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}
