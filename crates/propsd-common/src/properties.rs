//! Property-tree utilities.
//!
//! A property tree is a `serde_json::Value` whose mappings preserve
//! insertion order (the `preserve_order` feature). Merging is recursive for
//! mappings; sequences and scalars are replaced wholesale by the overlay.

use serde_json::map::Entry;
use serde_json::{Map, Value};
use sha1::{Digest, Sha1};

/// Deep-merge `overlay` into `base` in place. Overlay mappings fold key by
/// key into existing mappings; anything else (scalars, sequences, or a
/// mapping landing on a non-mapping) replaces the node wholesale.
pub fn merge_into(base: &mut Value, overlay: Value) {
    match overlay {
        Value::Object(incoming) if base.is_object() => {
            let target = base.as_object_mut().unwrap();
            for (key, value) in incoming {
                match target.entry(key) {
                    Entry::Occupied(mut slot) => merge_into(slot.get_mut(), value),
                    Entry::Vacant(slot) => {
                        slot.insert(value);
                    }
                }
            }
        }
        other => *base = other,
    }
}

/// Look up the value at a dotted path, descending through mappings only.
pub fn get_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(root, |node, key| node.as_object()?.get(key))
}

/// Set `value` at `path` inside `root`, creating intermediate mappings as
/// needed. A non-mapping node along the way is replaced by a mapping.
pub fn set_path(root: &mut Value, path: &[String], value: Value) {
    if path.is_empty() {
        *root = value;
        return;
    }
    if !root.is_object() {
        *root = Value::Object(Map::new());
    }
    let map = root.as_object_mut().unwrap();
    if path.len() == 1 {
        map.insert(path[0].clone(), value);
        return;
    }
    let child = map
        .entry(path[0].clone())
        .or_insert_with(|| Value::Object(Map::new()));
    set_path(child, &path[1..], value);
}

/// Serialize with lexicographically sorted mapping keys, so the result is
/// independent of insertion order.
pub fn canonical_json(value: &Value) -> String {
    fn write(value: &Value, out: &mut String) {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                out.push('{');
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&serde_json::to_string(key).unwrap());
                    out.push(':');
                    write(&map[key.as_str()], out);
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write(item, out);
                }
                out.push(']');
            }
            other => out.push_str(&serde_json::to_string(other).unwrap()),
        }
    }
    let mut out = String::new();
    write(value, &mut out);
    out
}

/// Content signature: hex SHA-1 over the canonical JSON form.
pub fn signature(value: &Value) -> String {
    let mut hasher = Sha1::new();
    hasher.update(canonical_json(value).as_bytes());
    hex::encode(hasher.finalize())
}

/// An empty mapping, the identity element for [`merge_into`].
pub fn empty() -> Value {
    Value::Object(Map::new())
}
