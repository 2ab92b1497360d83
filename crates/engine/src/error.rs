//! Engine error types.

use thiserror::Error;

/// Errors raised by the workflow runtime and its services.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed workflow, request, or configuration.
    #[error("validation error: {0}")]
    Validation(String),

    /// No service registered under the requested id.
    #[error("unknown service: {0}")]
    ServiceNotFound(String),

    /// The service does not expose the requested action.
    #[error("unknown action '{action}' on service '{service}'")]
    UnknownAction { service: String, action: String },

    /// A request payload could not be decoded into the service's request type.
    #[error("failed to decode request for {service}.{action}: {message}")]
    RequestDecode {
        service: String,
        action: String,
        message: String,
    },

    /// A service invocation reported an error.
    #[error("{0}")]
    Execution(String),

    /// Malformed run criteria or comparison directive.
    #[error("criteria error: {0}")]
    Criteria(String),

    /// A required variable resolved to nothing.
    #[error("missing required variable: {0}")]
    MissingVariable(String),

    /// Storage backend failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML deserialization error.
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type alias using [`EngineError`].
pub type EngineResult<T> = Result<T, EngineError>;
