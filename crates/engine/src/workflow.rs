//! Workflow definition model.
//!
//! A workflow is an ordered list of tasks; a task is an ordered list of
//! service actions. Definitions are plain serde structs so they load from
//! JSON or YAML sources and register programmatically.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{EngineError, EngineResult};
use crate::storage::Resource;
use crate::variables::Variables;

/// A named declarative program composed of tasks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Workflow {
    pub name: String,
    pub description: String,
    pub source: Resource,
    pub data: Map<String, Value>,
    pub init: Variables,
    pub post: Variables,
    pub tasks: Vec<WorkflowTask>,
    pub sleep_in_ms: u64,
}

/// An ordered group of actions with its own bindings and run criterion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct WorkflowTask {
    pub name: String,
    pub description: String,
    pub actions: Vec<ServiceAction>,
    pub init: Variables,
    pub post: Variables,
    pub run_criteria: String,
    /// Minimum wall time for the task; the runtime sleeps out any remainder.
    pub time_spent_ms: u64,
}

/// A single call into a named service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct ServiceAction {
    pub service: String,
    pub action: String,
    pub request: Map<String, Value>,
    pub init: Variables,
    pub post: Variables,
    pub run_criteria: String,
    pub tag: String,
    pub tag_index: String,
    pub tag_id: String,
    pub tag_description: String,
    pub description: String,
    pub r#async: bool,
    pub sleep_in_ms: u64,
}

impl ServiceAction {
    /// Human-readable label for error and event reporting.
    pub fn label(&self) -> String {
        if self.tag.is_empty() {
            format!("{}.{}", self.service, self.action)
        } else if self.tag_index.is_empty() {
            format!("[{}]", self.tag)
        } else {
            format!("[{}{}]", self.tag, self.tag_index)
        }
    }
}

impl Workflow {
    /// Check structural invariants: non-empty workflow name, unique
    /// non-empty task names, and fully addressed actions.
    pub fn validate(&self) -> EngineResult<()> {
        if self.name.is_empty() {
            return Err(EngineError::Validation("workflow name is empty".to_string()));
        }
        let mut seen = std::collections::HashSet::new();
        for task in &self.tasks {
            if task.name.is_empty() {
                return Err(EngineError::Validation(format!(
                    "workflow '{}' has a task with an empty name",
                    self.name
                )));
            }
            if !seen.insert(task.name.as_str()) {
                return Err(EngineError::Validation(format!(
                    "workflow '{}' has a duplicate task name: {}",
                    self.name, task.name
                )));
            }
            for action in &task.actions {
                if action.service.is_empty() || action.action.is_empty() {
                    return Err(EngineError::Validation(format!(
                        "task '{}' in workflow '{}' has an action without service or action name",
                        task.name, self.name
                    )));
                }
            }
        }
        Ok(())
    }
}
