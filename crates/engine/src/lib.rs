//! Runbook workflow engine.
//!
//! A declarative workflow runtime used as a test-automation and
//! orchestration harness:
//!
//! - **Workflows** are trees of tasks containing actions; each action
//!   invokes a registered [`service::Service`].
//! - **State** is a shared, expandable map: `${path}` references resolve
//!   against it at run time.
//! - **Contexts** carry state, an event stream, and the session id;
//!   children are cheap scoped copies.
//! - **Dispatch** is synchronous in declared order, with optional async
//!   fan-out per task and whole-workflow background runs.
//!
//! ## Modules
//!
//! - [`context`]: the engine value and execution context
//! - [`runtime`]: the workflow service (register / load / run)
//! - [`state`] / [`expand`]: state map and template expansion
//! - [`variables`]: Init/Post binding rules
//! - [`validator`] / [`criteria`]: comparisons and run-criteria gating
//! - [`event`] / [`event_log`]: event stream and file sink
//! - [`service`]: the service contract and registry
//! - [`storage`]: local and in-memory storage backends
//! - [`loader`]: workflow source decoding
//!
//! ## Example
//!
//! ```ignore
//! use runbook_engine::{Engine, WorkflowService};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let engine = Engine::new();
//!     engine.register_service(WorkflowService::new());
//!     let context = engine.new_context("session-1");
//!     let service = context.service("workflow")?;
//!     let request = service.new_request(
//!         "run",
//!         serde_json::json!({"Name": "regress", "WorkflowURL": "workflow/regress.yaml"}),
//!     )?;
//!     let response = service.run(&context, request).await;
//!     println!("{}", response.status);
//!     Ok(())
//! }
//! ```

pub mod context;
pub mod criteria;
pub mod error;
pub mod event;
pub mod event_log;
pub mod expand;
pub mod loader;
pub mod runtime;
pub mod service;
pub mod session;
pub mod state;
pub mod storage;
pub mod validator;
pub mod variables;
pub mod workflow;

pub use context::{Context, Engine};
pub use error::{EngineError, EngineResult};
pub use event::{Event, EventLevel, EventStream};
pub use event_log::EventLogger;
pub use runtime::{
    Activity, WorkflowLoadRequest, WorkflowLoadResponse, WorkflowRegisterRequest,
    WorkflowRunRequest, WorkflowRunResponse, WorkflowService, WORKFLOW_SERVICE_ID,
};
pub use service::{Service, ServiceRegistry, ServiceRequest, ServiceResponse, STATUS_ERR, STATUS_OK};
pub use state::State;
pub use storage::{
    FileMeta, LocalStorage, MemoryStorage, Resource, StorageService, USE_MEMORY_SERVICE,
};
pub use validator::{Failure, Validation};
pub use variables::{Variable, Variables};
pub use workflow::{ServiceAction, Workflow, WorkflowTask};
