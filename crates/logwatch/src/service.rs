//! Log validation service.
//!
//! Three actions: `listen` installs log types and starts a tailer over
//! their source, `assert` checks queued records against expected ones with
//! a bounded wait, and `reset` discards everything queued so far.
//! Assertion mismatches are recorded into the returned validations, never
//! raised as errors.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use runbook_engine::storage::{file_name, Resource};
use runbook_engine::validator::{assert_values, Failure, Validation};
use runbook_engine::{
    Context, EngineError, EngineResult, EventLevel, Service, ServiceRequest, ServiceResponse,
};

use crate::iterator::LogRecordIterator;
use crate::types::{match_log_index, LogRecord, LogType, LogTypeMeta};

/// Id of the log validation service.
pub const LOG_VALIDATOR_SERVICE_ID: &str = "validator/log";

/// Default tail cadence.
const DEFAULT_FREQUENCY_MS: u64 = 400;

/// Default wait per retry round while asserting.
const DEFAULT_LOG_WAIT_TIME_MS: u64 = 500;

/// Default number of retry rounds while asserting.
const DEFAULT_LOG_WAIT_RETRY_COUNT: u32 = 3;

/// Request to start watching log types under a source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct LogValidatorListenRequest {
    pub source: Resource,
    pub frequency_ms: u64,
    pub types: Vec<LogType>,
}

/// Expected records for one log type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct ExpectedLogRecords {
    #[serde(rename = "Type")]
    pub type_name: String,
    #[serde(rename = "TagID")]
    pub tag_id: String,
    pub records: Vec<Value>,
}

/// Request to assert queued records against expected ones.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct LogValidatorAssertRequest {
    pub description: String,
    pub log_wait_time_ms: u64,
    pub log_wait_retry_count: u32,
    pub expected_log_records: Vec<ExpectedLogRecords>,
}

/// Validations produced by an assert call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct LogValidatorAssertResponse {
    pub description: String,
    pub validations: Vec<Validation>,
}

/// Request to discard queued records for the named types.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct LogValidatorResetRequest {
    pub log_types: Vec<String>,
}

/// The log validation service.
#[derive(Debug, Default)]
pub struct LogValidatorService {
    pub(crate) registry: Mutex<HashMap<String, Arc<LogTypeMeta>>>,
}

impl LogValidatorService {
    /// Create the service.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registered meta for a log type.
    pub fn meta(&self, name: &str) -> Option<Arc<LogTypeMeta>> {
        let registry = self.registry.lock().expect("log meta registry lock poisoned");
        registry.get(name).cloned()
    }

    async fn listen(
        self: Arc<Self>,
        context: &Context,
        request: LogValidatorListenRequest,
    ) -> EngineResult<Value> {
        let source = Resource {
            url: context.expand_text(&request.source.url),
            credential: context.expand_text(&request.source.credential),
        };
        {
            let registry = self.registry.lock().expect("log meta registry lock poisoned");
            for log_type in &request.types {
                if registry.contains_key(&log_type.name) {
                    return Err(EngineError::Validation(format!(
                        "listener is already registered for '{}'",
                        log_type.name
                    )));
                }
            }
        }

        // Initial snapshot; the tailer opens its own client afterwards.
        let storage = context.storage_for(&source)?;
        self.read_log_files(&storage, &source, &request.types).await?;
        drop(storage);

        let mut response_meta = Map::new();
        for log_type in &request.types {
            let meta = {
                let mut registry =
                    self.registry.lock().expect("log meta registry lock poisoned");
                Arc::clone(registry.entry(log_type.name.clone()).or_insert_with(|| {
                    Arc::new(LogTypeMeta::new(source.clone(), log_type.clone()))
                }))
            };
            let snapshot = meta.as_value();
            context
                .state()
                .put(format!("meta_{}", log_type.name), snapshot.clone());
            response_meta.insert(log_type.name.clone(), snapshot);
        }

        self.spawn_tailer(context, source, request);
        Ok(json!({ "Meta": response_meta }))
    }

    /// One tailer per listen call: re-read the source on a fixed cadence
    /// until the context closes. I/O failures end only this tailer.
    fn spawn_tailer(
        self: Arc<Self>,
        context: &Context,
        source: Resource,
        request: LogValidatorListenRequest,
    ) {
        let frequency = if request.frequency_ms == 0 {
            DEFAULT_FREQUENCY_MS
        } else {
            request.frequency_ms
        };
        let tail_context = context.clone();
        tokio::spawn(async move {
            let storage = match tail_context.storage_for(&source) {
                Ok(storage) => storage,
                Err(e) => {
                    tracing::warn!(source = %source.url, error = %e, "failed to open log storage");
                    return;
                }
            };
            while !tail_context.is_closed() {
                if let Err(e) = self.read_log_files(&storage, &source, &request.types).await {
                    tracing::warn!(source = %source.url, error = %e, "failed to read log files");
                    break;
                }
                tokio::time::sleep(Duration::from_millis(frequency)).await;
            }
        });
    }

    async fn assert(
        &self,
        context: &Context,
        request: LogValidatorAssertRequest,
    ) -> EngineResult<Value> {
        let wait_time_ms = if request.log_wait_time_ms == 0 {
            DEFAULT_LOG_WAIT_TIME_MS
        } else {
            request.log_wait_time_ms
        };
        let retry_count = if request.log_wait_retry_count == 0 {
            DEFAULT_LOG_WAIT_RETRY_COUNT
        } else {
            request.log_wait_retry_count
        };

        let mut response = LogValidatorAssertResponse {
            description: request.description.clone(),
            validations: Vec::new(),
        };

        for group in &request.expected_log_records {
            let meta = self.meta(&group.type_name).ok_or_else(|| {
                EngineError::Validation(format!(
                    "unknown log type '{}', call listen with it first",
                    group.type_name
                ))
            })?;
            let index_expr = meta.log_type.index_expr()?;
            let mut iterator = LogRecordIterator::new(Arc::clone(&meta));

            for expected in &group.records {
                let mut validation = Validation::new(
                    group.tag_id.clone(),
                    format!("log validation: {}", group.type_name),
                );

                let mut retries = retry_count;
                while retries > 0 && !iterator.has_next() {
                    retries -= 1;
                    context.sleep(wait_time_ms).await;
                }
                if !iterator.has_next() {
                    validation.add_failure(Failure {
                        path: format!("[{}]", group.tag_id),
                        expected: expected.clone(),
                        actual: Value::Null,
                        message: "missing log record".to_string(),
                    });
                    response.validations.push(validation);
                    return Ok(serde_json::to_value(response)?);
                }

                let record = self.consume_record(&mut iterator, index_expr.as_ref(), expected)?;
                let Some(record) = record else {
                    validation.add_failure(Failure {
                        path: format!("[{}]", group.tag_id),
                        expected: expected.clone(),
                        actual: Value::Null,
                        message: "missing log record".to_string(),
                    });
                    response.validations.push(validation);
                    return Ok(serde_json::to_value(response)?);
                };

                let actual = if expected.is_object() {
                    record.as_json()?
                } else {
                    Value::String(record.line.clone())
                };

                let path = format!("{}:{}", file_name(&record.url), record.number);
                let mut record_validation = Validation::new(group.tag_id.clone(), path.clone());
                assert_values(&path, expected, &actual, &mut record_validation)?;
                context.add_event(
                    "LogRecordAssert",
                    EventLevel::Info,
                    json!({
                        "TagID": group.tag_id,
                        "Expected": expected,
                        "Actual": actual,
                        "Passed": !record_validation.has_failed(),
                    }),
                );
                validation.merge_from(record_validation);
                response.validations.push(validation);
            }
        }
        Ok(serde_json::to_value(response)?)
    }

    /// Pull the next record: by captured index key when the type indexes
    /// and the expected record yields one, FIFO otherwise.
    fn consume_record(
        &self,
        iterator: &mut LogRecordIterator,
        index_expr: Option<&regex::Regex>,
        expected: &Value,
    ) -> EngineResult<Option<Arc<LogRecord>>> {
        if let Some(expr) = index_expr {
            let expected_text = match expected {
                Value::Object(_) | Value::Array(_) => serde_json::to_string(expected)?,
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            if let Some(key) = match_log_index(expr, &expected_text) {
                return Ok(iterator.next_indexed(&key));
            }
        }
        Ok(iterator.next_record())
    }

    fn reset(&self, request: LogValidatorResetRequest) -> EngineResult<Value> {
        let mut reset_files = Vec::new();
        for name in &request.log_types {
            let Some(meta) = self.meta(name) else {
                continue;
            };
            for file in meta.files_snapshot() {
                file.reset_consumed();
                reset_files.push(file.name.clone());
            }
        }
        Ok(json!({ "LogFiles": reset_files }))
    }
}

#[async_trait]
impl Service for LogValidatorService {
    fn id(&self) -> &str {
        LOG_VALIDATOR_SERVICE_ID
    }

    fn new_request(&self, action: &str, payload: Value) -> EngineResult<ServiceRequest> {
        match action {
            "listen" => {
                ServiceRequest::decode::<LogValidatorListenRequest>(self.id(), action, payload)
            }
            "assert" => {
                ServiceRequest::decode::<LogValidatorAssertRequest>(self.id(), action, payload)
            }
            "reset" => {
                ServiceRequest::decode::<LogValidatorResetRequest>(self.id(), action, payload)
            }
            _ => Err(EngineError::UnknownAction {
                service: self.id().to_string(),
                action: action.to_string(),
            }),
        }
    }

    async fn run(self: Arc<Self>, context: &Context, request: ServiceRequest) -> ServiceResponse {
        let action = request.action().to_string();
        let result: EngineResult<Value> = match action.as_str() {
            "listen" => match request.take::<LogValidatorListenRequest>() {
                Ok(req) => Arc::clone(&self).listen(context, req).await,
                Err(e) => Err(e),
            },
            "assert" => match request.take::<LogValidatorAssertRequest>() {
                Ok(req) => self.assert(context, req).await,
                Err(e) => Err(e),
            },
            "reset" => match request.take::<LogValidatorResetRequest>() {
                Ok(req) => self.reset(req),
                Err(e) => Err(e),
            },
            other => Err(EngineError::UnknownAction {
                service: LOG_VALIDATOR_SERVICE_ID.to_string(),
                action: other.to_string(),
            }),
        };
        let response = ServiceResponse::from_result(result);
        if !response.error.is_empty() {
            context.add_event("Error", EventLevel::Info, json!({"error": response.error}));
        }
        response
    }
}
