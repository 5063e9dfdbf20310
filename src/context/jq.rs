//! JSON-pointer-ish path selection used by the `jq:<varref>:<path>`
//! interpolation prefix (spec.md §4.1). Supports dotted field access,
//! `name[index]` array indexing, and a terminal `length` selector.
//!
//! Trimmed down from the teacher's `extractors/mod.rs`, which walked the
//! same kind of path to pull values out of HTTP response bodies for its
//! (spec-less) per-step `extract` list.

use serde_json::Value;

pub fn select(value: &Value, path: &str) -> Option<Value> {
    let mut current = value.clone();
    if path.is_empty() {
        return Some(current);
    }
    for raw_token in path.split('.') {
        if raw_token == "length" {
            current = match &current {
                Value::Array(a) => Value::from(a.len()),
                Value::String(s) => Value::from(s.chars().count()),
                Value::Object(o) => Value::from(o.len()),
                _ => return None,
            };
            continue;
        }

        let (name, index) = split_index(raw_token);
        if !name.is_empty() {
            current = current.get(name)?.clone();
        }
        if let Some(i) = index {
            current = current.get(i)?.clone();
        }
    }
    Some(current)
}

/// `"items[2]"` -> `("items", Some(2))`; `"[2]"` -> `("", Some(2))`;
/// `"items"` -> `("items", None)`.
fn split_index(token: &str) -> (&str, Option<usize>) {
    if let Some(open) = token.find('[') {
        if let Some(close) = token.find(']') {
            if close > open {
                let name = &token[..open];
                let idx = token[open + 1..close].parse::<usize>().ok();
                return (name, idx);
            }
        }
    }
    (token, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dotted_field() {
        let v = json!({"data": {"token": "abc123"}});
        assert_eq!(select(&v, "data.token"), Some(json!("abc123")));
    }

    #[test]
    fn array_index() {
        let v = json!({"items": ["a", "b", "c"]});
        assert_eq!(select(&v, "items[1]"), Some(json!("b")));
    }

    #[test]
    fn length_terminal() {
        let v = json!({"items": ["a", "b", "c"]});
        assert_eq!(select(&v, "items.length"), Some(json!(3)));
    }

    #[test]
    fn missing_field_is_none() {
        let v = json!({"data": {}});
        assert_eq!(select(&v, "data.missing.deeper"), None);
    }
}
