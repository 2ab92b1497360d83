//! Variable bindings between state maps.
//!
//! A binding is an ordered list of rules copied from a source state into a
//! target state. Rules run in order, so later rules observe earlier writes
//! when source and target are the same state. The first failing rule aborts
//! the whole application.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, EngineResult};
use crate::state::State;

/// One binding rule.
///
/// `From` names a dotted source path (expanded first); an empty `From`
/// falls back to the literal `Value`. A `->` prefix on `Name` writes the
/// resolved value without expanding it. `Persist` keeps the value in the
/// engine's variable store and uses that store as a fallback source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Variable {
    pub name: String,
    pub from: String,
    pub value: Value,
    pub required: bool,
    pub persist: bool,
}

/// Ordered set of binding rules.
pub type Variables = Vec<Variable>;

/// Engine-held store for persisted variables. In-memory only; workflow
/// state never survives the process.
#[derive(Debug, Clone, Default)]
pub struct VarStore {
    inner: Arc<Mutex<HashMap<String, Value>>>,
}

impl VarStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Save a value under a name.
    pub fn put(&self, name: impl Into<String>, value: Value) {
        let mut store = self.inner.lock().expect("variable store lock poisoned");
        store.insert(name.into(), value);
    }

    /// Fetch a saved value.
    pub fn get(&self, name: &str) -> Option<Value> {
        let store = self.inner.lock().expect("variable store lock poisoned");
        store.get(name).cloned()
    }
}

/// Apply binding rules from `source` into `target`.
pub fn apply(
    rules: &[Variable],
    source: &State,
    target: &State,
    store: &VarStore,
) -> EngineResult<()> {
    for rule in rules {
        if rule.name.is_empty() {
            continue;
        }
        let (name, raw) = match rule.name.strip_prefix("->") {
            Some(stripped) => (stripped, true),
            None => (rule.name.as_str(), false),
        };

        let mut resolved = if rule.from.is_empty() {
            match &rule.value {
                Value::Null => None,
                value if raw => Some(value.clone()),
                value => Some(source.expand(value)),
            }
        } else {
            let from = source.expand_text(&rule.from);
            source.get_path(&from).map(|value| {
                if raw {
                    value
                } else {
                    source.expand(&value)
                }
            })
        };

        if resolved.is_none() && rule.persist {
            resolved = store.get(name);
        }

        if rule.required && is_missing(resolved.as_ref()) {
            return Err(EngineError::MissingVariable(format!(
                "'{}' (from: '{}')",
                name, rule.from
            )));
        }

        let value = resolved.unwrap_or(Value::Null);
        if rule.persist {
            store.put(name, value.clone());
        }
        target.put(name, value);
    }
    Ok(())
}

fn is_missing(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule(name: &str, from: &str) -> Variable {
        Variable {
            name: name.to_string(),
            from: from.to_string(),
            ..Variable::default()
        }
    }

    #[test]
    fn test_copy_from_source() {
        let source = State::new();
        source.put("status", json!("ok"));
        let target = State::new();
        apply(&[rule("result", "status")], &source, &target, &VarStore::new()).unwrap();
        assert_eq!(target.get("result"), Some(json!("ok")));
    }

    #[test]
    fn test_literal_value_expanded() {
        let source = State::new();
        source.put("host", json!("db1"));
        let target = State::new();
        let rules = vec![Variable {
            name: "endpoint".into(),
            value: json!("http://${host}/"),
            ..Variable::default()
        }];
        apply(&rules, &source, &target, &VarStore::new()).unwrap();
        assert_eq!(target.get("endpoint"), Some(json!("http://db1/")));
    }

    #[test]
    fn test_arrow_prefix_skips_expansion() {
        let source = State::new();
        source.put("host", json!("db1"));
        let target = State::new();
        let rules = vec![Variable {
            name: "->template".into(),
            value: json!("http://${host}/"),
            ..Variable::default()
        }];
        apply(&rules, &source, &target, &VarStore::new()).unwrap();
        assert_eq!(target.get("template"), Some(json!("http://${host}/")));
    }

    #[test]
    fn test_later_rules_observe_earlier_writes() {
        let state = State::new();
        state.put("a", json!("seed"));
        let rules = vec![rule("b", "a"), rule("c", "b")];
        apply(&rules, &state, &state, &VarStore::new()).unwrap();
        assert_eq!(state.get("c"), Some(json!("seed")));
    }

    #[test]
    fn test_required_missing_fails() {
        let source = State::new();
        let target = State::new();
        let rules = vec![Variable {
            name: "must".into(),
            from: "absent".into(),
            required: true,
            ..Variable::default()
        }];
        let err = apply(&rules, &source, &target, &VarStore::new()).unwrap_err();
        assert!(matches!(err, EngineError::MissingVariable(_)));
        assert!(!target.has("must"));
    }

    #[test]
    fn test_failure_aborts_remaining_rules() {
        let source = State::new();
        let target = State::new();
        let rules = vec![
            Variable {
                name: "must".into(),
                from: "absent".into(),
                required: true,
                ..Variable::default()
            },
            Variable {
                name: "later".into(),
                value: json!("x"),
                ..Variable::default()
            },
        ];
        assert!(apply(&rules, &source, &target, &VarStore::new()).is_err());
        assert!(!target.has("later"));
    }

    #[test]
    fn test_persist_round_trip() {
        let store = VarStore::new();
        let source = State::new();
        source.put("token", json!("abc"));
        let target = State::new();
        let rules = vec![Variable {
            name: "token".into(),
            from: "token".into(),
            persist: true,
            ..Variable::default()
        }];
        apply(&rules, &source, &target, &store).unwrap();

        // A later run without the source value falls back to the store.
        let empty = State::new();
        let restored = State::new();
        let rules = vec![Variable {
            name: "token".into(),
            from: "token".into(),
            persist: true,
            required: true,
            ..Variable::default()
        }];
        apply(&rules, &empty, &restored, &store).unwrap();
        assert_eq!(restored.get("token"), Some(json!("abc")));
    }

    #[test]
    fn test_dotted_from_path() {
        let source = State::new();
        source.put("response", json!({"user": {"id": 5}}));
        let target = State::new();
        apply(&[rule("uid", "response.user.id")], &source, &target, &VarStore::new()).unwrap();
        assert_eq!(target.get("uid"), Some(json!(5)));
    }
}
