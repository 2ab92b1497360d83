//! Workflow runtime service.
//!
//! Owns the workflow registry and executes workflows: tasks run strictly in
//! declared order, synchronous actions run in order with fail-fast, and
//! async actions fan out into workers whose events are folded back into the
//! parent stream before the task's post bindings run.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::context::Context;
use crate::criteria;
use crate::error::{EngineError, EngineResult};
use crate::event::EventLevel;
use crate::event_log::EventLogger;
use crate::loader;
use crate::service::{Service, ServiceRequest, ServiceResponse};
use crate::state::State;
use crate::storage::Resource;
use crate::variables::{self, Variables};
use crate::workflow::{ServiceAction, Workflow, WorkflowTask};

/// Id of the workflow runtime service.
pub const WORKFLOW_SERVICE_ID: &str = "workflow";

/// State key holding the per-action activity record.
pub const ACTIVITY_KEY: &str = "activity";

/// State key holding the currently executing task.
pub const TASK_STATE_KEY: &str = ":task";

/// Settle time before async workers start, absorbing scheduling jitter.
const ASYNC_START_DELAY_MS: u64 = 200;

/// How long a finished async session lingers before removal.
const SESSION_LINGER_MS: u64 = 2_000;

/// Request to run a registered or loadable workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct WorkflowRunRequest {
    pub name: String,
    #[serde(rename = "WorkflowURL")]
    pub workflow_url: String,
    pub params: Map<String, Value>,
    pub publish_parameters: bool,
    /// Task selector: empty or `*` for all, else a comma list of `name`
    /// or `name=idx1:idx2` entries.
    pub tasks: String,
    pub r#async: bool,
    pub enable_logging: bool,
    pub logging_directory: String,
}

/// Request to register an in-memory workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WorkflowRegisterRequest {
    pub workflow: Workflow,
}

/// Request to load and register a workflow from a source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WorkflowLoadRequest {
    pub source: Resource,
}

/// Response of a workflow run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct WorkflowRunResponse {
    #[serde(rename = "SessionID")]
    pub session_id: String,
    pub data: Map<String, Value>,
}

/// Response of a workflow load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WorkflowLoadResponse {
    pub workflow: Workflow,
}

/// Per-invocation execution record, bound under [`ACTIVITY_KEY`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Activity {
    pub workflow: String,
    pub service: String,
    pub action: String,
    pub tag: String,
    pub tag_index: String,
    pub tag_id: String,
    pub description: String,
    pub tag_description: String,
    pub start_time: DateTime<Utc>,
    pub ineligible: bool,
    pub request: Value,
    pub response: Value,
    pub error: String,
}

/// The workflow runtime service.
#[derive(Debug, Default)]
pub struct WorkflowService {
    registry: Mutex<HashMap<String, Arc<Workflow>>>,
}

impl WorkflowService {
    /// Create the service.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Validate and insert a workflow. Re-registering an identical
    /// definition is idempotent; a different definition under the same
    /// name is rejected.
    pub fn register(&self, workflow: Workflow) -> EngineResult<()> {
        workflow.validate()?;
        let mut registry = self.registry.lock().expect("workflow registry lock poisoned");
        if let Some(existing) = registry.get(&workflow.name) {
            if **existing == workflow {
                return Ok(());
            }
            return Err(EngineError::Validation(format!(
                "workflow '{}' is already registered with a different definition",
                workflow.name
            )));
        }
        registry.insert(workflow.name.clone(), Arc::new(workflow));
        Ok(())
    }

    /// Whether a workflow is registered.
    pub fn has(&self, name: &str) -> bool {
        let registry = self.registry.lock().expect("workflow registry lock poisoned");
        registry.contains_key(name)
    }

    /// Look up a registered workflow.
    pub fn lookup(&self, name: &str) -> EngineResult<Arc<Workflow>> {
        let registry = self.registry.lock().expect("workflow registry lock poisoned");
        registry
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::Validation(format!("failed to look up workflow: {}", name)))
    }

    /// Number of registered workflows.
    pub fn registered_count(&self) -> usize {
        let registry = self.registry.lock().expect("workflow registry lock poisoned");
        registry.len()
    }

    async fn load(
        &self,
        context: &Context,
        request: WorkflowLoadRequest,
    ) -> EngineResult<WorkflowLoadResponse> {
        let workflow = loader::load(context, &request.source).await.map_err(|e| {
            EngineError::Execution(format!(
                "failed to load workflow {}: {}",
                request.source.url, e
            ))
        })?;
        self.register(workflow.clone())?;
        Ok(WorkflowLoadResponse { workflow })
    }

    async fn load_if_needed(&self, context: &Context, name: &str, url: &str) -> EngineResult<()> {
        if name.is_empty() {
            return Err(EngineError::Validation("workflow name is required".to_string()));
        }
        if self.has(name) {
            return Ok(());
        }
        let source = if url.is_empty() {
            self.resolve_repo_source(context, name).await?
        } else {
            Resource::new(url)
        };
        let workflow = loader::load(context, &source).await?;
        self.register(workflow)
    }

    /// Probe the conventional repo-relative locations of a workflow.
    async fn resolve_repo_source(&self, context: &Context, name: &str) -> EngineResult<Resource> {
        for candidate in [
            format!("workflow/{}.json", name),
            format!("workflow/{}.yaml", name),
        ] {
            let resource = Resource::new(&candidate);
            let storage = context.storage_for(&resource)?;
            if storage.exists(&candidate).await? {
                return Ok(resource);
            }
        }
        Err(EngineError::Validation(format!(
            "workflow '{}' is not registered and no source was provided",
            name
        )))
    }

    async fn run_workflow(
        &self,
        upstream: &Context,
        request: &WorkflowRunRequest,
    ) -> EngineResult<WorkflowRunResponse> {
        if request.enable_logging && !request.logging_directory.is_empty() {
            let directory = Path::new(&request.logging_directory).join(upstream.session_id());
            upstream.set_event_logger(Arc::new(EventLogger::new(directory)));
        }

        self.load_if_needed(upstream, &request.name, &request.workflow_url).await?;
        let workflow = self.lookup(&request.name)?;
        upstream.add_event(
            "Workflow.Loaded",
            EventLevel::Info,
            json!({"workflow": workflow.name}),
        );

        upstream.push_workflow(Arc::clone(&workflow));
        let context = upstream.clone_child();
        let result = self.run_workflow_scoped(&context, &workflow, request).await;
        // Child events were already forwarded to the logger sink; fold the
        // raw stream back without forwarding again.
        upstream.events().extend(context.events().drain());
        upstream.pop_workflow();

        Ok(WorkflowRunResponse {
            session_id: upstream.session_id().to_string(),
            data: result?,
        })
    }

    async fn run_workflow_scoped(
        &self,
        context: &Context,
        workflow: &Arc<Workflow>,
        request: &WorkflowRunRequest,
    ) -> EngineResult<Map<String, Value>> {
        let state = context.state();
        if !workflow.source.url.is_empty() {
            state.put("ownerURL", json!(workflow.source.url));
        }
        state.put("data", Value::Object(workflow.data.clone()));

        let params = build_params(request, context);
        if request.publish_parameters {
            for (key, value) in &params {
                state.put(key.clone(), state.expand(value));
            }
        }
        state.put("params", Value::Object(params));

        variables::apply(&workflow.init, state, state, context.engine().persisted())?;
        add_variable_event(context, "Workflow.Init", &workflow.init);
        context.add_event(
            "State.Init",
            EventLevel::Debug,
            json!({"state": Value::Object(state.snapshot())}),
        );

        for task in &workflow.tasks {
            run_task(context, workflow, task, request).await?;
        }

        let output = State::new();
        variables::apply(&workflow.post, state, &output, context.engine().persisted())?;
        add_variable_event(context, "Workflow.Post", &workflow.post);

        if workflow.sleep_in_ms > 0 {
            context.sleep(workflow.sleep_in_ms).await;
        }
        Ok(output.snapshot())
    }

    /// Launch a whole workflow in the background, emitting the terminal
    /// events on completion and scheduling session removal when this call
    /// started the session.
    fn spawn_run(
        self: Arc<Self>,
        context: &Context,
        request: WorkflowRunRequest,
        started_session: bool,
    ) {
        let background = context.clone();
        tokio::spawn(async move {
            let result = self.run_workflow(&background, &request).await;
            let response = match result {
                Ok(response) => ServiceResponse::ok(
                    serde_json::to_value(response).unwrap_or(Value::Null),
                ),
                Err(e) => {
                    tracing::error!(workflow = %request.name, error = %e, "async workflow failed");
                    background.add_event("Error", EventLevel::Info, json!({"error": e.to_string()}));
                    ServiceResponse::error(format!("failed to run workflow {}: {}", request.name, e))
                }
            };
            background.add_event(
                "Run.End",
                EventLevel::Info,
                json!({
                    "service": WORKFLOW_SERVICE_ID,
                    "action": "run",
                    "response": serde_json::to_value(&response).unwrap_or(Value::Null),
                }),
            );
            if started_session {
                let engine = Arc::clone(background.engine());
                let session_id = background.session_id().to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(SESSION_LINGER_MS)).await;
                    engine.sessions().remove(&session_id);
                });
            }
        });
    }
}

#[async_trait]
impl Service for WorkflowService {
    fn id(&self) -> &str {
        WORKFLOW_SERVICE_ID
    }

    fn new_request(&self, action: &str, payload: Value) -> EngineResult<ServiceRequest> {
        match action {
            "run" => ServiceRequest::decode::<WorkflowRunRequest>(self.id(), action, payload),
            "register" => {
                ServiceRequest::decode::<WorkflowRegisterRequest>(self.id(), action, payload)
            }
            "load" => ServiceRequest::decode::<WorkflowLoadRequest>(self.id(), action, payload),
            _ => Err(EngineError::UnknownAction {
                service: self.id().to_string(),
                action: action.to_string(),
            }),
        }
    }

    async fn run(self: Arc<Self>, context: &Context, request: ServiceRequest) -> ServiceResponse {
        let started_session = context.engine().sessions().start(context.session_id());
        let action = request.action().to_string();
        context.add_event(
            "Run.Begin",
            EventLevel::Info,
            json!({
                "service": WORKFLOW_SERVICE_ID,
                "action": action,
                "request": request.payload(),
            }),
        );
        let run_async = action == "run"
            && request
                .payload()
                .get("Async")
                .and_then(Value::as_bool)
                .unwrap_or(false);

        let response = match action.as_str() {
            "run" => match request.take::<WorkflowRunRequest>() {
                Ok(req) if req.r#async => {
                    let session_id = context.session_id().to_string();
                    Arc::clone(&self).spawn_run(context, req, started_session);
                    ServiceResponse::ok(
                        serde_json::to_value(WorkflowRunResponse {
                            session_id,
                            data: Map::new(),
                        })
                        .unwrap_or(Value::Null),
                    )
                }
                Ok(req) => match self.run_workflow(context, &req).await {
                    Ok(resp) => {
                        ServiceResponse::ok(serde_json::to_value(resp).unwrap_or(Value::Null))
                    }
                    Err(e) => ServiceResponse::error(format!(
                        "failed to run workflow {}: {}",
                        req.name, e
                    )),
                },
                Err(e) => ServiceResponse::error(e.to_string()),
            },
            "register" => match request.take::<WorkflowRegisterRequest>() {
                Ok(req) => {
                    let name = req.workflow.name.clone();
                    match self.register(req.workflow) {
                        Ok(()) => ServiceResponse::ok(json!({})),
                        Err(e) => ServiceResponse::error(format!(
                            "failed to register workflow {}: {}",
                            name, e
                        )),
                    }
                }
                Err(e) => ServiceResponse::error(e.to_string()),
            },
            "load" => match request.take::<WorkflowLoadRequest>() {
                Ok(req) => match self.load(context, req).await {
                    Ok(resp) => {
                        ServiceResponse::ok(serde_json::to_value(resp).unwrap_or(Value::Null))
                    }
                    Err(e) => ServiceResponse::error(e.to_string()),
                },
                Err(e) => ServiceResponse::error(e.to_string()),
            },
            other => ServiceResponse::error(
                EngineError::UnknownAction {
                    service: WORKFLOW_SERVICE_ID.to_string(),
                    action: other.to_string(),
                }
                .to_string(),
            ),
        };

        if !response.error.is_empty() {
            context.add_event("Error", EventLevel::Info, json!({"error": response.error}));
        }
        if !run_async {
            context.add_event(
                "Run.End",
                EventLevel::Info,
                json!({
                    "service": WORKFLOW_SERVICE_ID,
                    "action": action,
                    "response": serde_json::to_value(&response).unwrap_or(Value::Null),
                }),
            );
        }
        response
    }
}

/// Gate a task by the request's task selector.
///
/// Returns whether the task may run and, for a `name=idx1:idx2` entry, the
/// set of allowed synchronous action indices.
pub(crate) fn is_task_allowed(
    task: &WorkflowTask,
    selector: &str,
) -> (bool, Option<HashSet<usize>>) {
    let selector = selector.trim();
    if selector.is_empty() || selector == "*" {
        return (true, None);
    }
    for entry in selector.split(',') {
        let entry = entry.trim();
        match entry.split_once('=') {
            Some((name, indices)) => {
                if name == task.name {
                    let allowed = indices
                        .split(':')
                        .filter_map(|index| index.trim().parse::<usize>().ok())
                        .collect::<HashSet<usize>>();
                    return (true, Some(allowed));
                }
            }
            None => {
                if entry == task.name {
                    return (true, None);
                }
            }
        }
    }
    (false, None)
}

async fn run_task(
    context: &Context,
    workflow: &Arc<Workflow>,
    task: &WorkflowTask,
    request: &WorkflowRunRequest,
) -> EngineResult<()> {
    let started = tokio::time::Instant::now();
    context
        .state()
        .put(TASK_STATE_KEY, serde_json::to_value(task).unwrap_or(Value::Null));

    let (allowed, allowed_actions) = is_task_allowed(task, &request.tasks);
    if !allowed {
        return Ok(());
    }

    variables::apply(&task.init, context.state(), context.state(), context.engine().persisted())?;
    add_variable_event(context, "Task.Init", &task.init);

    if !criteria::evaluate(context, &task.run_criteria)? {
        return Ok(());
    }

    context.add_event("Task.Begin", EventLevel::Info, json!({"task": task.name}));
    let outcome = run_task_steps(context, workflow, task, allowed_actions, started).await;
    context.add_event(
        "Task.End",
        EventLevel::Info,
        json!({"task": task.name, "ok": outcome.is_ok()}),
    );
    outcome
}

async fn run_task_steps(
    context: &Context,
    workflow: &Arc<Workflow>,
    task: &WorkflowTask,
    allowed_actions: Option<HashSet<usize>>,
    started: tokio::time::Instant,
) -> EngineResult<()> {
    let mut async_actions: Vec<ServiceAction> = Vec::new();
    for (index, action) in task.actions.iter().enumerate() {
        if action.r#async {
            context.add_event(
                "AsyncServiceAction",
                EventLevel::Info,
                json!({
                    "workflow": workflow.name,
                    "task": context.expand_text(&task.name),
                    "service": action.service,
                    "action": action.action,
                    "tagId": action.tag_id,
                    "description": context.expand_text(&action.description),
                }),
            );
            async_actions.push(action.clone());
            continue;
        }
        if let Some(allowed) = &allowed_actions {
            if !allowed.contains(&index) {
                continue;
            }
        }
        run_action(context, action).await.map_err(|e| {
            EngineError::Execution(format!("failed to run action {}: {}", action.label(), e))
        })?;
    }

    run_async_actions(context, async_actions).await?;

    variables::apply(&task.post, context.state(), context.state(), context.engine().persisted())?;
    add_variable_event(context, "Task.Post", &task.post);

    if task.time_spent_ms > 0 {
        let elapsed = started.elapsed().as_millis() as u64;
        if task.time_spent_ms > elapsed {
            context.sleep(task.time_spent_ms - elapsed).await;
        }
    }
    Ok(())
}

/// Fan async actions out into workers. Each worker runs against an
/// async-safe child context and flushes its events into the parent when it
/// completes; the first error wins after all workers joined.
async fn run_async_actions(context: &Context, actions: Vec<ServiceAction>) -> EngineResult<()> {
    if actions.is_empty() {
        return Ok(());
    }
    context.sleep(ASYNC_START_DELAY_MS).await;

    let mut workers = Vec::with_capacity(actions.len());
    for action in actions {
        let mut worker_context = context.clone_child();
        worker_context.make_async_safe();
        let parent = context.clone();
        workers.push(tokio::spawn(async move {
            let result = run_action(&worker_context, &action).await.map_err(|e| {
                EngineError::Execution(format!("failed to run action {}: {}", action.label(), e))
            });
            parent.publish_events(worker_context.events().drain());
            result
        }));
    }

    let mut first_error: Option<EngineError> = None;
    for worker in workers {
        match worker.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
            Err(e) => {
                if first_error.is_none() {
                    first_error =
                        Some(EngineError::Execution(format!("async action worker failed: {}", e)));
                }
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn run_action(context: &Context, action: &ServiceAction) -> EngineResult<()> {
    let workflow_name = context
        .current_workflow()
        .map(|w| w.name.clone())
        .unwrap_or_default();
    let mut activity = Activity {
        workflow: workflow_name,
        service: action.service.clone(),
        action: action.action.clone(),
        tag: action.tag.clone(),
        tag_index: action.tag_index.clone(),
        tag_id: action.tag_id.clone(),
        description: context.expand_text(&action.description),
        tag_description: context.expand_text(&action.tag_description),
        start_time: Utc::now(),
        ineligible: false,
        request: Value::Object(action.request.clone()),
        response: Value::Null,
        error: String::new(),
    };
    bind_activity(context, &activity);
    context.add_event(
        "Action.Begin",
        EventLevel::Info,
        json!({"activity": serde_json::to_value(&activity).unwrap_or(Value::Null)}),
    );

    let outcome = run_action_steps(context, action, &mut activity).await;
    if let Err(e) = &outcome {
        activity.error = e.to_string();
    }
    bind_activity(context, &activity);
    context.add_event(
        "Action.End",
        EventLevel::Info,
        json!({"activity": serde_json::to_value(&activity).unwrap_or(Value::Null)}),
    );
    outcome
}

async fn run_action_steps(
    context: &Context,
    action: &ServiceAction,
    activity: &mut Activity,
) -> EngineResult<()> {
    if !criteria::evaluate(context, &action.run_criteria)? {
        activity.ineligible = true;
        return Ok(());
    }

    variables::apply(&action.init, context.state(), context.state(), context.engine().persisted())?;
    add_variable_event(context, "Action.Init", &action.init);

    let service = context.service(&action.service)?;
    let expanded = context.expand(&Value::Object(action.request.clone()));
    let request_map = match expanded {
        Value::Object(map) => map,
        other => {
            return Err(EngineError::Validation(format!(
                "expected request map for {}.{} but expansion produced {}",
                action.service,
                action.action,
                value_kind(&other)
            )))
        }
    };

    let request = service.new_request(&action.action, Value::Object(request_map))?;
    activity.request = request.payload().clone();
    bind_activity(context, activity);

    let response = service.run(context, request).await;
    activity.response = response.response.clone();
    if !response.error.is_empty() {
        return Err(EngineError::Execution(response.error));
    }

    let response_source = match response.response {
        Value::Object(map) => State::from_map(map),
        _ => State::new(),
    };
    variables::apply(&action.post, &response_source, context.state(), context.engine().persisted())?;
    add_variable_event(context, "Action.Post", &action.post);

    context.sleep(action.sleep_in_ms).await;
    Ok(())
}

fn bind_activity(context: &Context, activity: &Activity) {
    context
        .state()
        .put(ACTIVITY_KEY, serde_json::to_value(activity).unwrap_or(Value::Null));
}

/// Emit a debug event describing applied variable bindings.
fn add_variable_event(context: &Context, name: &str, rules: &Variables) {
    if rules.is_empty() {
        return;
    }
    let mut values = Map::new();
    for rule in rules {
        let key = rule.name.strip_prefix("->").unwrap_or(&rule.name);
        values.insert(
            key.to_string(),
            context.state().get_path(key).unwrap_or(Value::Null),
        );
    }
    context.add_event(
        name,
        EventLevel::Debug,
        json!({
            "variables": serde_json::to_value(rules).unwrap_or(Value::Null),
            "values": values,
        }),
    );
}

/// Build the request parameter map, expanding string parameters in the
/// workflow's scope.
fn build_params(request: &WorkflowRunRequest, context: &Context) -> Map<String, Value> {
    let mut params = Map::new();
    for (key, value) in &request.params {
        match value {
            Value::String(text) => {
                params.insert(key.clone(), context.state().expand_str(text));
            }
            other => {
                params.insert(key.clone(), other.clone());
            }
        }
    }
    params
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a sequence",
        Value::Object(_) => "a mapping",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Engine;
    use crate::event::Event;

    /// Test service echoing its request map back as the response, with
    /// optional sleep and scripted failure.
    #[derive(Debug, Serialize, Deserialize)]
    struct EchoRequest {
        #[serde(default, rename = "SleepMs")]
        sleep_ms: u64,
        #[serde(default, rename = "Fail")]
        fail: String,
        #[serde(flatten)]
        data: Map<String, Value>,
    }

    #[derive(Debug, Default)]
    struct EchoService {
        calls: Mutex<u32>,
    }

    impl EchoService {
        fn call_count(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl Service for EchoService {
        fn id(&self) -> &str {
            "test/echo"
        }

        fn new_request(&self, action: &str, payload: Value) -> EngineResult<ServiceRequest> {
            match action {
                "echo" => ServiceRequest::decode::<EchoRequest>(self.id(), action, payload),
                _ => Err(EngineError::UnknownAction {
                    service: self.id().to_string(),
                    action: action.to_string(),
                }),
            }
        }

        async fn run(
            self: Arc<Self>,
            _context: &Context,
            request: ServiceRequest,
        ) -> ServiceResponse {
            let req = match request.take::<EchoRequest>() {
                Ok(req) => req,
                Err(e) => return ServiceResponse::error(e.to_string()),
            };
            *self.calls.lock().unwrap() += 1;
            if req.sleep_ms > 0 {
                tokio::time::sleep(Duration::from_millis(req.sleep_ms)).await;
            }
            if !req.fail.is_empty() {
                return ServiceResponse::error(req.fail);
            }
            ServiceResponse::ok(Value::Object(req.data))
        }
    }

    fn echo_action(tag: &str, request: Value) -> ServiceAction {
        ServiceAction {
            service: "test/echo".to_string(),
            action: "echo".to_string(),
            tag: tag.to_string(),
            request: request.as_object().cloned().unwrap_or_default(),
            ..ServiceAction::default()
        }
    }

    fn binding(name: &str, from: &str) -> crate::variables::Variable {
        crate::variables::Variable {
            name: name.to_string(),
            from: from.to_string(),
            ..crate::variables::Variable::default()
        }
    }

    struct Harness {
        engine: Arc<Engine>,
        context: Context,
        workflow_service: Arc<WorkflowService>,
        echo: Arc<EchoService>,
    }

    fn harness() -> Harness {
        let engine = Engine::new();
        let workflow_service = WorkflowService::new();
        let echo = Arc::new(EchoService::default());
        engine.register_service(workflow_service.clone());
        engine.register_service(echo.clone());
        let context = engine.new_context("session-test");
        Harness {
            engine,
            context,
            workflow_service,
            echo,
        }
    }

    async fn run_by_name(h: &Harness, name: &str, tasks: &str) -> ServiceResponse {
        let service = h.context.service(WORKFLOW_SERVICE_ID).unwrap();
        let request = service
            .new_request("run", json!({"Name": name, "Tasks": tasks}))
            .unwrap();
        service.run(&h.context, request).await
    }

    fn events_of_type(events: &[Event], event_type: &str) -> Vec<Event> {
        events
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    fn action_begin_tags(events: &[Event]) -> Vec<String> {
        events_of_type(events, "Action.Begin")
            .iter()
            .filter_map(|e| e.payload["activity"]["Tag"].as_str().map(str::to_string))
            .collect()
    }

    fn assert_begins_have_ends(events: &[Event]) {
        let begins = events_of_type(events, "Action.Begin").len();
        let ends = events_of_type(events, "Action.End").len();
        assert_eq!(begins, ends, "every Action.Begin needs a matching Action.End");
    }

    #[tokio::test]
    async fn test_linear_workflow_with_criteria() {
        let h = harness();
        let workflow = Workflow {
            name: "linear".to_string(),
            tasks: vec![WorkflowTask {
                name: "T1".to_string(),
                actions: vec![
                    ServiceAction {
                        post: vec![binding("x", "value")],
                        ..echo_action("A1", json!({"value": 1}))
                    },
                    ServiceAction {
                        run_criteria: "$x:1".to_string(),
                        post: vec![binding("y", "got")],
                        ..echo_action("A2", json!({"got": "$x"}))
                    },
                ],
                ..WorkflowTask::default()
            }],
            post: vec![binding("final", "y")],
            ..Workflow::default()
        };
        h.workflow_service.register(workflow).unwrap();

        let response = run_by_name(&h, "linear", "").await;
        assert!(response.is_ok(), "error: {}", response.error);
        assert_eq!(response.response["Data"]["final"], json!(1));
        assert_eq!(response.response["SessionID"], json!("session-test"));
        assert_eq!(h.echo.call_count(), 2);

        let events = h.context.events().snapshot();
        assert_eq!(action_begin_tags(&events), vec!["A1", "A2"]);
        assert_begins_have_ends(&events);
    }

    #[tokio::test]
    async fn test_task_selector_restricts_action_indices() {
        let h = harness();
        let workflow = Workflow {
            name: "selective".to_string(),
            tasks: vec![WorkflowTask {
                name: "T1".to_string(),
                actions: vec![
                    echo_action("A0", json!({})),
                    echo_action("A1", json!({})),
                    echo_action("A2", json!({})),
                ],
                ..WorkflowTask::default()
            }],
            ..Workflow::default()
        };
        h.workflow_service.register(workflow).unwrap();

        let response = run_by_name(&h, "selective", "T1=0:2").await;
        assert!(response.is_ok(), "error: {}", response.error);
        assert_eq!(h.echo.call_count(), 2);

        let events = h.context.events().snapshot();
        let tags = action_begin_tags(&events);
        assert!(tags.contains(&"A0".to_string()));
        assert!(tags.contains(&"A2".to_string()));
        assert!(!tags.contains(&"A1".to_string()));
    }

    #[tokio::test]
    async fn test_unmatched_task_is_skipped() {
        let h = harness();
        let workflow = Workflow {
            name: "skip".to_string(),
            tasks: vec![WorkflowTask {
                name: "T1".to_string(),
                actions: vec![echo_action("A0", json!({}))],
                ..WorkflowTask::default()
            }],
            ..Workflow::default()
        };
        h.workflow_service.register(workflow).unwrap();
        let response = run_by_name(&h, "skip", "Other").await;
        assert!(response.is_ok());
        assert_eq!(h.echo.call_count(), 0);
    }

    #[tokio::test]
    async fn test_async_fan_out_runs_concurrently() {
        let h = harness();
        let mut actions = Vec::new();
        for index in 0..3 {
            actions.push(ServiceAction {
                r#async: true,
                ..echo_action(&format!("W{}", index), json!({"SleepMs": 100}))
            });
        }
        let workflow = Workflow {
            name: "fanout".to_string(),
            tasks: vec![WorkflowTask {
                name: "T1".to_string(),
                actions,
                ..WorkflowTask::default()
            }],
            ..Workflow::default()
        };
        h.workflow_service.register(workflow).unwrap();

        let started = std::time::Instant::now();
        let response = run_by_name(&h, "fanout", "").await;
        let elapsed = started.elapsed();
        assert!(response.is_ok(), "error: {}", response.error);
        assert_eq!(h.echo.call_count(), 3);
        // 200 ms settle + 100 ms parallel sleeps; serial would exceed 500 ms.
        assert!(elapsed < Duration::from_millis(450), "took {:?}", elapsed);

        let events = h.context.events().snapshot();
        assert_eq!(events_of_type(&events, "AsyncServiceAction").len(), 3);
        let tags = action_begin_tags(&events);
        for tag in ["W0", "W1", "W2"] {
            assert!(tags.contains(&tag.to_string()), "missing {}", tag);
        }
        assert_begins_have_ends(&events);
    }

    #[tokio::test]
    async fn test_async_first_error_wins_after_join() {
        let h = harness();
        let workflow = Workflow {
            name: "fanout-err".to_string(),
            tasks: vec![WorkflowTask {
                name: "T1".to_string(),
                actions: vec![
                    ServiceAction {
                        r#async: true,
                        ..echo_action("BAD", json!({"Fail": "boom"}))
                    },
                    ServiceAction {
                        r#async: true,
                        ..echo_action("SLOW", json!({"SleepMs": 50}))
                    },
                ],
                ..WorkflowTask::default()
            }],
            ..Workflow::default()
        };
        h.workflow_service.register(workflow).unwrap();

        let response = run_by_name(&h, "fanout-err", "").await;
        assert!(!response.is_ok());
        assert!(response.error.contains("boom"), "error: {}", response.error);
        // The slow worker still ran to completion.
        assert_eq!(h.echo.call_count(), 2);
    }

    #[tokio::test]
    async fn test_sync_error_halts_task() {
        let h = harness();
        let workflow = Workflow {
            name: "halt".to_string(),
            tasks: vec![WorkflowTask {
                name: "T1".to_string(),
                actions: vec![
                    echo_action("FAIL", json!({"Fail": "broken"})),
                    echo_action("NEVER", json!({})),
                ],
                ..WorkflowTask::default()
            }],
            ..Workflow::default()
        };
        h.workflow_service.register(workflow).unwrap();

        let response = run_by_name(&h, "halt", "").await;
        assert!(!response.is_ok());
        assert!(response.error.contains("broken"));
        assert_eq!(h.echo.call_count(), 1);
        let events = h.context.events().snapshot();
        assert_eq!(events_of_type(&events, "Error").len(), 1);
    }

    #[tokio::test]
    async fn test_ineligible_action_is_recorded_not_run() {
        let h = harness();
        let workflow = Workflow {
            name: "gated".to_string(),
            tasks: vec![WorkflowTask {
                name: "T1".to_string(),
                actions: vec![ServiceAction {
                    run_criteria: "$missing_key:present".to_string(),
                    ..echo_action("GATED", json!({}))
                }],
                ..WorkflowTask::default()
            }],
            ..Workflow::default()
        };
        h.workflow_service.register(workflow).unwrap();

        let response = run_by_name(&h, "gated", "").await;
        assert!(response.is_ok(), "error: {}", response.error);
        assert_eq!(h.echo.call_count(), 0);

        let events = h.context.events().snapshot();
        let ends = events_of_type(&events, "Action.End");
        assert_eq!(ends.len(), 1);
        assert_eq!(ends[0].payload["activity"]["Ineligible"], json!(true));
    }

    #[tokio::test]
    async fn test_register_duplicate_semantics() {
        let h = harness();
        let workflow = Workflow {
            name: "dup".to_string(),
            tasks: vec![],
            ..Workflow::default()
        };
        h.workflow_service.register(workflow.clone()).unwrap();
        // Identical re-registration is idempotent.
        h.workflow_service.register(workflow.clone()).unwrap();
        assert_eq!(h.workflow_service.registered_count(), 1);

        let mut changed = workflow;
        changed.sleep_in_ms = 5;
        assert!(h.workflow_service.register(changed).is_err());
    }

    #[tokio::test]
    async fn test_load_workflow_from_source() {
        let h = harness();
        h.engine.memory_storage().write(
            "mem://repo/loaded.json",
            serde_json::to_vec(&json!({
                "Name": "loaded",
                "Tasks": [{"Name": "T1", "Actions": [
                    {"Service": "test/echo", "Action": "echo", "Request": {"v": 1},
                     "Post": [{"Name": "out", "From": "v"}]}
                ]}],
                "Post": [{"Name": "out", "From": "out"}]
            }))
            .unwrap(),
        );

        let service = h.context.service(WORKFLOW_SERVICE_ID).unwrap();
        let request = service
            .new_request("load", json!({"Source": {"URL": "mem://repo/loaded.json"}}))
            .unwrap();
        let response = service.run(&h.context, request).await;
        assert!(response.is_ok(), "error: {}", response.error);
        assert_eq!(response.response["Workflow"]["Name"], json!("loaded"));

        // Re-loading the same source leaves the registry unchanged.
        let service = h.context.service(WORKFLOW_SERVICE_ID).unwrap();
        let request = service
            .new_request("load", json!({"Source": {"URL": "mem://repo/loaded.json"}}))
            .unwrap();
        let response = service.run(&h.context, request).await;
        assert!(response.is_ok(), "error: {}", response.error);
        assert_eq!(h.workflow_service.registered_count(), 1);

        let run = run_by_name(&h, "loaded", "").await;
        assert!(run.is_ok(), "error: {}", run.error);
        assert_eq!(run.response["Data"]["out"], json!(1));
    }

    #[tokio::test]
    async fn test_run_by_url_loads_on_demand() {
        let h = harness();
        h.engine.memory_storage().write(
            "mem://repo/ondemand.json",
            serde_json::to_vec(&json!({"Name": "ondemand", "Tasks": []})).unwrap(),
        );
        let service = h.context.service(WORKFLOW_SERVICE_ID).unwrap();
        let request = service
            .new_request(
                "run",
                json!({"Name": "ondemand", "WorkflowURL": "mem://repo/ondemand.json"}),
            )
            .unwrap();
        let response = service.run(&h.context, request).await;
        assert!(response.is_ok(), "error: {}", response.error);
        assert!(h.workflow_service.has("ondemand"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_workflow_returns_session_and_cleans_up() {
        let h = harness();
        let workflow = Workflow {
            name: "bg".to_string(),
            tasks: vec![WorkflowTask {
                name: "T1".to_string(),
                actions: vec![echo_action("A", json!({"SleepMs": 50}))],
                ..WorkflowTask::default()
            }],
            ..Workflow::default()
        };
        h.workflow_service.register(workflow).unwrap();

        let service = h.context.service(WORKFLOW_SERVICE_ID).unwrap();
        let request = service
            .new_request("run", json!({"Name": "bg", "Async": true}))
            .unwrap();
        let response = service.run(&h.context, request).await;
        assert!(response.is_ok());
        assert_eq!(response.response["SessionID"], json!("session-test"));
        assert_eq!(response.response["Data"], json!({}));
        assert!(h.engine.sessions().has("session-test"));

        // Wait for the background run to emit its terminal event.
        let mut finished = false;
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let events = h.context.events().snapshot();
            if !events_of_type(&events, "Run.End").is_empty() {
                finished = true;
                break;
            }
        }
        assert!(finished, "async workflow never finished");
        assert_eq!(h.echo.call_count(), 1);

        // Session removal is scheduled ~2 s after completion.
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert!(!h.engine.sessions().has("session-test"));
    }

    #[tokio::test]
    async fn test_publish_parameters() {
        let h = harness();
        let workflow = Workflow {
            name: "params".to_string(),
            tasks: vec![WorkflowTask {
                name: "T1".to_string(),
                actions: vec![ServiceAction {
                    post: vec![binding("echoed", "env")],
                    ..echo_action("A", json!({"env": "$env"}))
                }],
                ..WorkflowTask::default()
            }],
            post: vec![binding("env", "echoed")],
            ..Workflow::default()
        };
        h.workflow_service.register(workflow).unwrap();

        let service = h.context.service(WORKFLOW_SERVICE_ID).unwrap();
        let request = service
            .new_request(
                "run",
                json!({
                    "Name": "params",
                    "Params": {"env": "staging"},
                    "PublishParameters": true
                }),
            )
            .unwrap();
        let response = service.run(&h.context, request).await;
        assert!(response.is_ok(), "error: {}", response.error);
        assert_eq!(response.response["Data"]["env"], json!("staging"));
    }

    #[test]
    fn test_is_task_allowed_parsing() {
        let task = WorkflowTask {
            name: "deploy".to_string(),
            ..WorkflowTask::default()
        };
        assert_eq!(is_task_allowed(&task, ""), (true, None));
        assert_eq!(is_task_allowed(&task, "*"), (true, None));
        assert_eq!(is_task_allowed(&task, "deploy"), (true, None));
        assert_eq!(is_task_allowed(&task, "other").0, false);
        assert_eq!(is_task_allowed(&task, "other,deploy"), (true, None));

        let (allowed, indices) = is_task_allowed(&task, "deploy=0:2");
        assert!(allowed);
        let indices = indices.unwrap();
        assert!(indices.contains(&0) && indices.contains(&2) && !indices.contains(&1));
    }

    #[tokio::test]
    async fn test_bad_criteria_surfaces_error() {
        let h = harness();
        let workflow = Workflow {
            name: "badcrit".to_string(),
            tasks: vec![WorkflowTask {
                name: "T1".to_string(),
                run_criteria: "no-colon-here".to_string(),
                actions: vec![echo_action("A", json!({}))],
                ..WorkflowTask::default()
            }],
            ..Workflow::default()
        };
        h.workflow_service.register(workflow).unwrap();
        let response = run_by_name(&h, "badcrit", "").await;
        assert!(!response.is_ok());
        assert!(response.error.contains("':'"), "error: {}", response.error);
    }
}
