//! Shared state map with dotted-path lookup.
//!
//! The state is a string-keyed map of [`serde_json::Value`] trees. It backs
//! workflow data, request parameters, and every variable binding. Values are
//! addressed either by top-level key or by dotted path (`a.b.0.c`), where a
//! numeric segment indexes into a sequence.

use std::sync::{Arc, RwLock};

use serde_json::{Map, Value};

use crate::expand;

/// Cheap-to-clone handle to a state map.
///
/// Cloning the handle shares the underlying map; use [`State::deep_clone`]
/// to produce an independent copy.
#[derive(Debug, Clone, Default)]
pub struct State {
    inner: Arc<RwLock<Map<String, Value>>>,
}

impl State {
    /// Create an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a state from an existing map.
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(map)),
        }
    }

    /// Set a top-level key.
    pub fn put(&self, key: impl Into<String>, value: Value) {
        let mut map = self.inner.write().expect("state lock poisoned");
        map.insert(key.into(), value);
    }

    /// Get a top-level key.
    pub fn get(&self, key: &str) -> Option<Value> {
        let map = self.inner.read().expect("state lock poisoned");
        map.get(key).cloned()
    }

    /// Remove a top-level key.
    pub fn remove(&self, key: &str) -> Option<Value> {
        let mut map = self.inner.write().expect("state lock poisoned");
        map.remove(key)
    }

    /// Whether a top-level key is present.
    pub fn has(&self, key: &str) -> bool {
        let map = self.inner.read().expect("state lock poisoned");
        map.contains_key(key)
    }

    /// Resolve a dotted path into the state tree.
    pub fn get_path(&self, path: &str) -> Option<Value> {
        let map = self.inner.read().expect("state lock poisoned");
        lookup_path(&map, path)
    }

    /// Copy of the whole map.
    pub fn snapshot(&self) -> Map<String, Value> {
        let map = self.inner.read().expect("state lock poisoned");
        map.clone()
    }

    /// Independent state holding a copy of this one's map.
    pub fn deep_clone(&self) -> State {
        State::from_map(self.snapshot())
    }

    /// Expand every `${...}` / `$name` reference in a value tree against
    /// this state. See [`crate::expand`].
    pub fn expand(&self, value: &Value) -> Value {
        expand::expand_value(self, value)
    }

    /// Expand a template string; a lone reference keeps its value type.
    pub fn expand_str(&self, text: &str) -> Value {
        expand::expand_string(self, text)
    }

    /// Expand a template string into text.
    pub fn expand_text(&self, text: &str) -> String {
        expand::value_to_text(&self.expand_str(text))
    }

    /// Number of top-level keys.
    pub fn len(&self) -> usize {
        let map = self.inner.read().expect("state lock poisoned");
        map.len()
    }

    /// Whether the state has no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Walk `path` segments through a value tree.
fn lookup_path(map: &Map<String, Value>, path: &str) -> Option<Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = map.get(first)?.clone();
    for segment in segments {
        current = match current {
            Value::Object(ref obj) => obj.get(segment)?.clone(),
            Value::Array(ref items) => {
                let index: usize = segment.parse().ok()?;
                items.get(index)?.clone()
            }
            _ => return None,
        };
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_put_get() {
        let state = State::new();
        state.put("name", json!("tester"));
        assert_eq!(state.get("name"), Some(json!("tester")));
        assert_eq!(state.get("missing"), None);
        assert!(state.has("name"));
    }

    #[test]
    fn test_get_path() {
        let state = State::new();
        state.put("request", json!({"user": {"id": 7}, "tags": ["a", "b"]}));
        assert_eq!(state.get_path("request.user.id"), Some(json!(7)));
        assert_eq!(state.get_path("request.tags.1"), Some(json!("b")));
        assert_eq!(state.get_path("request.user.missing"), None);
        assert_eq!(state.get_path("request.tags.9"), None);
    }

    #[test]
    fn test_deep_clone_is_independent() {
        let state = State::new();
        state.put("k", json!(1));
        let copy = state.deep_clone();
        copy.put("k", json!(2));
        assert_eq!(state.get("k"), Some(json!(1)));
        assert_eq!(copy.get("k"), Some(json!(2)));
    }

    #[test]
    fn test_handle_clone_shares() {
        let state = State::new();
        let handle = state.clone();
        handle.put("k", json!(true));
        assert_eq!(state.get("k"), Some(json!(true)));
    }
}
