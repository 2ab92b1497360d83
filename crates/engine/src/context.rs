//! Execution engine and context.
//!
//! The [`Engine`] owns everything process-wide: the service registry, the
//! session table, the in-memory storage instance, and the persisted
//! variable store. There are no globals; tests build fresh engines.
//!
//! A [`Context`] is the execution environment handed to services: state,
//! events, session id, and a handle back to the engine. Cloning the struct
//! clones the handle (same underlying state and events); [`Context::clone_child`]
//! creates a child with its own state copy and a fresh event stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;

use crate::error::EngineResult;
use crate::event::{Event, EventLevel, EventStream};
use crate::event_log::EventLogger;
use crate::service::{Service, ServiceRegistry};
use crate::session::SessionTable;
use crate::state::State;
use crate::storage::{LocalStorage, MemoryStorage, Resource, StorageService, USE_MEMORY_SERVICE};
use crate::variables::VarStore;
use crate::workflow::Workflow;

/// Process-wide execution engine.
#[derive(Debug)]
pub struct Engine {
    handle: Weak<Engine>,
    services: ServiceRegistry,
    sessions: SessionTable,
    memory_storage: MemoryStorage,
    persisted: VarStore,
}

impl Engine {
    /// Create a fresh engine.
    pub fn new() -> Arc<Engine> {
        Arc::new_cyclic(|handle| Engine {
            handle: handle.clone(),
            services: ServiceRegistry::new(),
            sessions: SessionTable::new(),
            memory_storage: MemoryStorage::new(),
            persisted: VarStore::new(),
        })
    }

    /// Register a service under its id.
    pub fn register_service(&self, service: Arc<dyn Service>) {
        self.services.register(service);
    }

    /// Look up a registered service.
    pub fn service(&self, id: &str) -> EngineResult<Arc<dyn Service>> {
        self.services.get(id)
    }

    /// The service registry.
    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    /// The session table.
    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    /// Handle to the engine's in-memory storage.
    pub fn memory_storage(&self) -> &MemoryStorage {
        &self.memory_storage
    }

    /// Store backing `Persist` variable bindings.
    pub fn persisted(&self) -> &VarStore {
        &self.persisted
    }

    /// Create a root context for a session.
    pub fn new_context(&self, session_id: impl Into<String>) -> Context {
        Context {
            engine: self.handle.upgrade().expect("engine was dropped"),
            session_id: session_id.into(),
            state: State::new(),
            workflows: Arc::new(Mutex::new(Vec::new())),
            events: EventStream::new(),
            event_logger: Arc::new(Mutex::new(None)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Execution environment carrying state, events, and the session.
///
/// `Clone` yields another handle onto the same context. Use
/// [`Context::clone_child`] for the scoped copy the runtime gives each
/// workflow, and [`Context::make_async_safe`] before handing a child to a
/// concurrent worker.
#[derive(Clone)]
pub struct Context {
    engine: Arc<Engine>,
    session_id: String,
    state: State,
    workflows: Arc<Mutex<Vec<Arc<Workflow>>>>,
    events: EventStream,
    event_logger: Arc<Mutex<Option<Arc<EventLogger>>>>,
    closed: Arc<AtomicBool>,
}

impl Context {
    /// Engine this context belongs to.
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Session id carried by every request in this conversation.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The context's state map.
    pub fn state(&self) -> &State {
        &self.state
    }

    /// The context's event stream.
    pub fn events(&self) -> &EventStream {
        &self.events
    }

    /// Look up a registered service.
    pub fn service(&self, id: &str) -> EngineResult<Arc<dyn Service>> {
        self.engine.service(id)
    }

    /// Child context: own copy of the state, fresh event stream, same
    /// session, shared engine, workflow stack, and closed flag.
    pub fn clone_child(&self) -> Context {
        let logger = self.event_logger.lock().expect("event logger lock poisoned").clone();
        Context {
            engine: Arc::clone(&self.engine),
            session_id: self.session_id.clone(),
            state: self.state.deep_clone(),
            workflows: Arc::clone(&self.workflows),
            events: EventStream::new(),
            event_logger: Arc::new(Mutex::new(logger)),
            closed: Arc::clone(&self.closed),
        }
    }

    /// Detach this context for use by a concurrent worker: re-copy the
    /// state and drop the logger so buffered events are only forwarded
    /// once, at flush time.
    pub fn make_async_safe(&mut self) {
        self.state = self.state.deep_clone();
        self.events = EventStream::new();
        self.event_logger = Arc::new(Mutex::new(None));
    }

    /// Attach an event logger sink.
    pub fn set_event_logger(&self, logger: Arc<EventLogger>) {
        let mut slot = self.event_logger.lock().expect("event logger lock poisoned");
        *slot = Some(logger);
    }

    /// The attached event logger, if any.
    pub fn event_logger(&self) -> Option<Arc<EventLogger>> {
        self.event_logger.lock().expect("event logger lock poisoned").clone()
    }

    /// Append an event and forward it to the logger sink when attached.
    pub fn add_event(&self, event_type: impl Into<String>, level: EventLevel, payload: Value) {
        let event = Event::new(event_type, level, payload);
        self.forward_to_logger(&event);
        self.events.push(event);
    }

    /// Fold a batch of worker events into this context's stream.
    pub fn publish_events(&self, batch: Vec<Event>) {
        if batch.is_empty() {
            return;
        }
        for event in &batch {
            self.forward_to_logger(event);
        }
        self.events.extend(batch);
    }

    fn forward_to_logger(&self, event: &Event) {
        if let Some(logger) = self.event_logger() {
            if let Err(e) = logger.log(event) {
                tracing::warn!(error = %e, event_type = %event.event_type, "failed to log event");
            }
        }
    }

    /// Push a workflow onto the execution stack.
    pub fn push_workflow(&self, workflow: Arc<Workflow>) {
        let mut stack = self.workflows.lock().expect("workflow stack lock poisoned");
        stack.push(workflow);
    }

    /// Pop the innermost workflow.
    pub fn pop_workflow(&self) -> Option<Arc<Workflow>> {
        let mut stack = self.workflows.lock().expect("workflow stack lock poisoned");
        stack.pop()
    }

    /// Innermost currently executing workflow.
    pub fn current_workflow(&self) -> Option<Arc<Workflow>> {
        let stack = self.workflows.lock().expect("workflow stack lock poisoned");
        stack.last().cloned()
    }

    /// Signal cooperative shutdown to long-running services.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Whether shutdown was requested.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Expand a value tree against this context's state.
    pub fn expand(&self, value: &Value) -> Value {
        self.state.expand(value)
    }

    /// Expand a template string into text.
    pub fn expand_text(&self, text: &str) -> String {
        self.state.expand_text(text)
    }

    /// Emit a `Sleep` event and wait.
    pub async fn sleep(&self, sleep_time_ms: u64) {
        if sleep_time_ms == 0 {
            return;
        }
        self.add_event(
            "Sleep",
            EventLevel::Info,
            serde_json::json!({"SleepTimeMs": sleep_time_ms}),
        );
        tokio::time::sleep(std::time::Duration::from_millis(sleep_time_ms)).await;
    }

    /// Storage backend for a resource, honoring the in-memory override flag.
    pub fn storage_for(&self, resource: &Resource) -> EngineResult<Arc<dyn StorageService>> {
        if self.state.has(USE_MEMORY_SERVICE) {
            return Ok(Arc::new(self.engine.memory_storage().clone()));
        }
        match resource.scheme() {
            "mem" => Ok(Arc::new(self.engine.memory_storage().clone())),
            "" | "file" | "local" => Ok(Arc::new(LocalStorage::new())),
            other => Err(crate::error::EngineError::Storage(format!(
                "unsupported storage scheme '{}' for {}",
                other, resource.url
            ))),
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("session_id", &self.session_id)
            .field("events", &self.events.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_child_state_is_independent() {
        let engine = Engine::new();
        let context = engine.new_context("s1");
        context.state().put("k", json!("parent"));

        let child = context.clone_child();
        child.state().put("k", json!("child"));
        child.state().put("only_child", json!(1));

        assert_eq!(context.state().get("k"), Some(json!("parent")));
        assert!(!context.state().has("only_child"));
        assert_eq!(child.session_id(), "s1");
    }

    #[test]
    fn test_child_events_are_fresh_and_publishable() {
        let engine = Engine::new();
        let context = engine.new_context("s1");
        context.add_event("parent", EventLevel::Info, json!({}));

        let child = context.clone_child();
        assert!(child.events().is_empty());
        child.add_event("from-child", EventLevel::Info, json!({}));

        context.publish_events(child.events().drain());
        let types: Vec<String> =
            context.events().snapshot().into_iter().map(|e| e.event_type).collect();
        assert_eq!(types, vec!["parent", "from-child"]);
    }

    #[test]
    fn test_closed_flag_is_shared() {
        let engine = Engine::new();
        let context = engine.new_context("s1");
        let child = context.clone_child();
        context.close();
        assert!(child.is_closed());
    }

    #[test]
    fn test_workflow_stack_shared_with_children() {
        let engine = Engine::new();
        let context = engine.new_context("s1");
        let workflow = Arc::new(Workflow {
            name: "w".to_string(),
            ..Workflow::default()
        });
        context.push_workflow(workflow);
        let child = context.clone_child();
        assert_eq!(child.current_workflow().unwrap().name, "w");
        child.pop_workflow();
        assert!(context.current_workflow().is_none());
    }

    #[test]
    fn test_make_async_safe_detaches() {
        let engine = Engine::new();
        let context = engine.new_context("s1");
        context.state().put("k", json!(1));
        let mut worker = context.clone_child();
        worker.make_async_safe();
        worker.state().put("k", json!(2));
        assert_eq!(context.state().get("k"), Some(json!(1)));
        assert!(worker.event_logger().is_none());
    }

    #[test]
    fn test_storage_for_memory_flag() {
        let engine = Engine::new();
        let context = engine.new_context("s1");
        context.state().put(USE_MEMORY_SERVICE, json!(true));
        // Scheme would normally pick the local backend.
        assert!(context.storage_for(&Resource::new("file:///tmp")).is_ok());
        engine.memory_storage().write("file:///tmp/x", b"v".to_vec());
        let storage = context.storage_for(&Resource::new("file:///tmp")).unwrap();
        let fetched = futures_block(storage.download("file:///tmp/x"));
        assert_eq!(fetched.unwrap(), b"v");
    }

    #[test]
    fn test_storage_for_unknown_scheme() {
        let engine = Engine::new();
        let context = engine.new_context("s1");
        assert!(context.storage_for(&Resource::new("scp://host/x")).is_err());
    }

    fn futures_block<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("test runtime")
            .block_on(future)
    }
}
