//! Recursive `${...}` substitution over the state map.
//!
//! Templates reference state entries with `${path}` or bare `$name` tokens;
//! paths are dotted (`request.user.id`). A string that consists of exactly
//! one reference is replaced by the referenced value itself, so non-string
//! values survive expansion with their type intact. Unresolvable references
//! are left verbatim. Expansion never mutates the source state and recursion
//! is depth-bounded, which breaks reference cycles.

use serde_json::{Map, Value};

use crate::state::State;

/// Maximum substitution depth before a value is returned as-is.
const MAX_DEPTH: usize = 8;

/// Expand every reference in a value tree, returning a new tree.
pub fn expand_value(state: &State, value: &Value) -> Value {
    expand_value_at(state, value, 0)
}

/// Expand a template string. A lone reference keeps the value's type.
pub fn expand_string(state: &State, text: &str) -> Value {
    expand_string_at(state, text, 0)
}

/// Render a value the way it appears inside an expanded string.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

fn expand_value_at(state: &State, value: &Value, depth: usize) -> Value {
    if depth >= MAX_DEPTH {
        return value.clone();
    }
    match value {
        Value::String(text) => expand_string_at(state, text, depth),
        Value::Object(map) => {
            let mut expanded = Map::new();
            for (key, item) in map {
                let key = match expand_string_at(state, key, depth) {
                    Value::String(k) => k,
                    other => value_to_text(&other),
                };
                expanded.insert(key, expand_value_at(state, item, depth));
            }
            Value::Object(expanded)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| expand_value_at(state, item, depth))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn expand_string_at(state: &State, text: &str, depth: usize) -> Value {
    if depth >= MAX_DEPTH || !text.contains('$') {
        return Value::String(text.to_string());
    }
    let segments = parse_segments(text);

    if let [Segment::Reference { path, .. }] = segments.as_slice() {
        return match state.get_path(path) {
            Some(Value::String(inner)) => expand_string_at(state, &inner, depth + 1),
            Some(value) => expand_value_at(state, &value, depth + 1),
            None => Value::String(text.to_string()),
        };
    }

    let mut output = String::with_capacity(text.len());
    for segment in &segments {
        match segment {
            Segment::Text(chunk) => output.push_str(chunk),
            Segment::Reference { path, raw } => match state.get_path(path) {
                Some(Value::String(inner)) => {
                    output.push_str(&value_to_text(&expand_string_at(state, &inner, depth + 1)));
                }
                Some(value) => output.push_str(&value_to_text(&value)),
                // Keep the unresolved token verbatim.
                None => output.push_str(raw),
            },
        }
    }
    Value::String(output)
}

#[derive(Debug, PartialEq)]
enum Segment {
    Text(String),
    Reference { path: String, raw: String },
}

/// Split a template into literal text and `$`-references.
fn parse_segments(text: &str) -> Vec<Segment> {
    let chars: Vec<char> = text.chars().collect();
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut i = 0;

    while i < chars.len() {
        if chars[i] == '$' && i + 1 < chars.len() {
            if chars[i + 1] == '{' {
                if let Some(close) = chars[i + 2..].iter().position(|&c| c == '}') {
                    let path: String = chars[i + 2..i + 2 + close].iter().collect();
                    if !path.is_empty() {
                        if !literal.is_empty() {
                            segments.push(Segment::Text(std::mem::take(&mut literal)));
                        }
                        let raw = format!("${{{}}}", path);
                        segments.push(Segment::Reference { path, raw });
                        i += close + 3;
                        continue;
                    }
                }
            } else if chars[i + 1].is_ascii_alphabetic() || chars[i + 1] == '_' {
                let mut end = i + 1;
                while end < chars.len()
                    && (chars[end].is_ascii_alphanumeric() || chars[end] == '_' || chars[end] == '.')
                {
                    end += 1;
                }
                let mut path: String = chars[i + 1..end].iter().collect();
                // A trailing dot belongs to the surrounding text, not the path.
                while path.ends_with('.') {
                    path.pop();
                    end -= 1;
                }
                if !literal.is_empty() {
                    segments.push(Segment::Text(std::mem::take(&mut literal)));
                }
                let raw = format!("${}", path);
                segments.push(Segment::Reference { path, raw });
                i = end;
                continue;
            }
        }
        literal.push(chars[i]);
        i += 1;
    }
    if !literal.is_empty() {
        segments.push(Segment::Text(literal));
    }
    segments
}
