/*!
 * Error Types
 * Centralized error handling with thiserror, miette, and serde support
 *
 * Admission outcomes (attach, disable, shutdown) are plain value enums in
 * `core::types`; only failures that reach a caller's callback live here.
 */

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure reported by the spawner collaborator
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Diagnostic)]
#[serde(tag = "error_type", content = "details", rename_all = "snake_case")]
pub enum SpawnError {
    #[error("Spawn timed out: {0}")]
    #[diagnostic(
        code(spawn::timeout),
        help("The application did not finish its startup handshake in time. Check its startup logs.")
    )]
    Timeout(String),

    #[error("Spawn hit a resource limit: {0}")]
    #[diagnostic(
        code(spawn::resource_limit),
        help("The system refused to create another worker. Free resources or lower the pool size.")
    )]
    ResourceLimit(String),

    #[error("Handshake with the application failed: {0}")]
    #[diagnostic(
        code(spawn::handshake),
        help("The worker started but did not report a usable endpoint.")
    )]
    Handshake(String),

    #[error("Internal spawner error: {0}")]
    #[diagnostic(code(spawn::internal), help("View logs for details."))]
    Internal(String),
}

/// Failure delivered to a get callback instead of a session
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Diagnostic)]
#[serde(tag = "error_type", content = "details", rename_all = "snake_case")]
pub enum GetError {
    #[error("Request queue full (max {max})")]
    #[diagnostic(
        code(pool::request_queue_full),
        help("Too many requests are waiting for this application. Raise max_request_queue_size or add capacity.")
    )]
    RequestQueueFull { max: usize },

    #[error("Could not spawn a process for this application: {0}")]
    #[diagnostic(code(pool::spawn_failed))]
    SpawnFailed(#[diagnostic_source] SpawnError),

    #[error("Request aborted: {0}")]
    #[diagnostic(
        code(pool::aborted),
        help("The application was detached, destroyed or restarted while the request was queued.")
    )]
    Aborted(String),

    #[error("The pool is shutting down")]
    #[diagnostic(code(pool::shutting_down))]
    PoolShuttingDown,

    #[error("Timed out waiting for a session")]
    #[diagnostic(code(pool::timeout))]
    Timeout,
}

impl From<SpawnError> for GetError {
    fn from(err: SpawnError) -> Self {
        GetError::SpawnFailed(err)
    }
}

/// Invalid pool configuration
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Diagnostic)]
#[serde(tag = "error_type", content = "details", rename_all = "snake_case")]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {key}")]
    #[diagnostic(
        code(config::invalid_value),
        help("Expected a non-negative integer or a boolean.")
    )]
    InvalidValue { key: String, value: String },

    #[error("Invalid configuration: {0}")]
    #[diagnostic(code(config::invalid))]
    Invalid(String),
}

pub type GetResult<T> = Result<T, GetError>;
pub type SpawnOutcome<T> = Result<T, SpawnError>;
pub type ConfigResult<T> = Result<T, ConfigError>;
