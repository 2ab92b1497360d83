//! Run-criteria gating.
//!
//! A criterion is an `ACTUAL:EXPECTED` pair. Both sides are expanded
//! against the context state and compared by the validator; an empty
//! criterion is always eligible.

use serde_json::json;

use crate::context::Context;
use crate::error::{EngineError, EngineResult};
use crate::event::EventLevel;
use crate::validator;

/// Event emitted for every evaluated criterion.
pub const EVAL_RUN_CRITERIA_EVENT: &str = "EvalRunCriteria";

/// Evaluate a run criterion against the context state.
pub fn evaluate(context: &Context, criteria: &str) -> EngineResult<bool> {
    if criteria.is_empty() {
        return Ok(true);
    }
    let Some((actual_fragment, expected_fragment)) = criteria.split_once(':') else {
        return Err(EngineError::Criteria(format!(
            "run criteria must contain ':' but had: {}",
            criteria
        )));
    };
    let actual = context.state().expand_str(actual_fragment.trim());
    let expected = context.state().expand_str(expected_fragment.trim());
    let eligible = validator::check(&expected, &actual)?;
    context.add_event(
        EVAL_RUN_CRITERIA_EVENT,
        EventLevel::Debug,
        json!({"actual": actual, "expected": expected, "eligible": eligible}),
    );
    Ok(eligible)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Engine;

    #[test]
    fn test_empty_criteria_is_eligible() {
        let engine = Engine::new();
        let context = engine.new_context("s");
        assert!(evaluate(&context, "").unwrap());
    }

    #[test]
    fn test_missing_colon_fails() {
        let engine = Engine::new();
        let context = engine.new_context("s");
        let err = evaluate(&context, "$x").unwrap_err();
        assert!(matches!(err, EngineError::Criteria(_)));
    }

    #[test]
    fn test_state_reference_comparison() {
        let engine = Engine::new();
        let context = engine.new_context("s");
        context.state().put("x", json!(1));
        assert!(evaluate(&context, "$x:1").unwrap());
        assert!(!evaluate(&context, "$x:2").unwrap());
        assert!(evaluate(&context, "$x:!2").unwrap());
    }

    #[test]
    fn test_emits_debug_event() {
        let engine = Engine::new();
        let context = engine.new_context("s");
        context.state().put("env", json!("dev"));
        evaluate(&context, "$env:dev").unwrap();

        let events = context.events().snapshot();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EVAL_RUN_CRITERIA_EVENT);
        assert_eq!(events[0].payload["eligible"], json!(true));
        assert_eq!(events[0].payload["actual"], json!("dev"));
    }
}
