//! Expected-vs-actual comparison.
//!
//! Two layers: [`check`] compares scalars, honoring directive prefixes on
//! the expected side, and [`assert_values`] walks structured values,
//! collecting mismatches into a [`Validation`] record instead of failing.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, EngineResult};
use crate::expand::value_to_text;

/// A single mismatch discovered during structural assertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Failure {
    pub path: String,
    pub expected: Value,
    pub actual: Value,
    pub message: String,
}

/// Outcome of asserting a group of expected values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Validation {
    #[serde(rename = "TagID")]
    pub tag_id: String,
    pub description: String,
    pub passed_count: u32,
    pub failures: Vec<Failure>,
}

impl Validation {
    /// Create an empty validation record.
    pub fn new(tag_id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            tag_id: tag_id.into(),
            description: description.into(),
            passed_count: 0,
            failures: Vec::new(),
        }
    }

    /// Whether any assertion failed.
    pub fn has_failed(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Record a failure.
    pub fn add_failure(&mut self, failure: Failure) {
        self.failures.push(failure);
    }

    /// Fold another validation's counters and failures into this one.
    pub fn merge_from(&mut self, other: Validation) {
        self.passed_count += other.passed_count;
        self.failures.extend(other.failures);
    }
}

/// Compare an actual value against an expected one.
///
/// When the expected value is a string it may carry a directive prefix:
/// `!value` (not equal), `/regex/` (match), `<`, `<=`, `>`, `>=` (numeric),
/// `~value` (contains). Anything else is coercing equality, so `1`, `1.0`
/// and `"1"` compare equal. Errors are reserved for malformed directives.
pub fn check(expected: &Value, actual: &Value) -> EngineResult<bool> {
    if let Value::String(text) = expected {
        if let Some(rest) = text.strip_prefix('!') {
            return Ok(!values_equal(&Value::String(rest.to_string()), actual));
        }
        if text.len() >= 2 && text.starts_with('/') && text.ends_with('/') {
            let pattern = &text[1..text.len() - 1];
            let expr = Regex::new(pattern).map_err(|e| {
                EngineError::Criteria(format!("invalid match expression '{}': {}", pattern, e))
            })?;
            return Ok(expr.is_match(&value_to_text(actual)));
        }
        if let Some(rest) = text.strip_prefix("<=") {
            return numeric_compare(rest, actual, |a, b| a <= b);
        }
        if let Some(rest) = text.strip_prefix(">=") {
            return numeric_compare(rest, actual, |a, b| a >= b);
        }
        if let Some(rest) = text.strip_prefix('<') {
            return numeric_compare(rest, actual, |a, b| a < b);
        }
        if let Some(rest) = text.strip_prefix('>') {
            return numeric_compare(rest, actual, |a, b| a > b);
        }
        if let Some(rest) = text.strip_prefix('~') {
            return Ok(value_to_text(actual).contains(rest));
        }
    }
    Ok(values_equal(expected, actual))
}

/// Recursively assert `expected` against `actual`, accumulating results.
///
/// Expected mappings are compared per expected key (extra actual keys are
/// ignored), sequences element-wise, everything else through [`check`].
pub fn assert_values(
    path: &str,
    expected: &Value,
    actual: &Value,
    validation: &mut Validation,
) -> EngineResult<()> {
    match expected {
        Value::Object(expected_map) => {
            let Value::Object(actual_map) = actual else {
                validation.add_failure(Failure {
                    path: path.to_string(),
                    expected: expected.clone(),
                    actual: actual.clone(),
                    message: "expected a mapping".to_string(),
                });
                return Ok(());
            };
            for (key, expected_item) in expected_map {
                let item_path = format!("{}.{}", path, key);
                match actual_map.get(key) {
                    Some(actual_item) => {
                        assert_values(&item_path, expected_item, actual_item, validation)?;
                    }
                    None => validation.add_failure(Failure {
                        path: item_path,
                        expected: expected_item.clone(),
                        actual: Value::Null,
                        message: format!("missing field '{}'", key),
                    }),
                }
            }
        }
        Value::Array(expected_items) => {
            let Value::Array(actual_items) = actual else {
                validation.add_failure(Failure {
                    path: path.to_string(),
                    expected: expected.clone(),
                    actual: actual.clone(),
                    message: "expected a sequence".to_string(),
                });
                return Ok(());
            };
            if expected_items.len() != actual_items.len() {
                validation.add_failure(Failure {
                    path: path.to_string(),
                    expected: expected.clone(),
                    actual: actual.clone(),
                    message: format!(
                        "expected {} items but had {}",
                        expected_items.len(),
                        actual_items.len()
                    ),
                });
                return Ok(());
            }
            for (index, (expected_item, actual_item)) in
                expected_items.iter().zip(actual_items).enumerate()
            {
                let item_path = format!("{}[{}]", path, index);
                assert_values(&item_path, expected_item, actual_item, validation)?;
            }
        }
        _ => {
            if check(expected, actual)? {
                validation.passed_count += 1;
            } else {
                validation.add_failure(Failure {
                    path: path.to_string(),
                    expected: expected.clone(),
                    actual: actual.clone(),
                    message: format!(
                        "expected '{}' but had '{}'",
                        value_to_text(expected),
                        value_to_text(actual)
                    ),
                });
            }
        }
    }
    Ok(())
}

fn numeric_compare(
    expected: &str,
    actual: &Value,
    op: impl Fn(f64, f64) -> bool,
) -> EngineResult<bool> {
    let expected_num: f64 = expected.trim().parse().map_err(|_| {
        EngineError::Criteria(format!("non-numeric comparison operand: '{}'", expected))
    })?;
    let actual_num: f64 = match as_number(actual) {
        Some(n) => n,
        None => return Ok(false),
    };
    Ok(op(actual_num, expected_num))
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Coercing equality: numeric when both sides are numbers, text otherwise.
fn values_equal(expected: &Value, actual: &Value) -> bool {
    if expected == actual {
        return true;
    }
    if let (Some(a), Some(b)) = (as_number(expected), as_number(actual)) {
        return a == b;
    }
    match (expected, actual) {
        (Value::Object(_), _) | (_, Value::Object(_)) => false,
        (Value::Array(_), _) | (_, Value::Array(_)) => false,
        _ => value_to_text(expected) == value_to_text(actual),
    }
}
