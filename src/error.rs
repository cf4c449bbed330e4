//! Error types for the scrape orchestrator.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Row vanished: {0}")]
    Vanished(String),

    #[error("Write conflict: {0}")]
    Conflict(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors raised by the worker transport. Each one is scoped to a single call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    #[error("Not connected to worker")]
    NotConnected,

    #[error("Request {method} timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    #[error("{code}: {message}")]
    Remote {
        code: String,
        message: String,
        details: Option<serde_json::Value>,
    },

    #[error("Connection to worker lost")]
    ConnectionLost,

    #[error("Failed to connect to worker: {0}")]
    ConnectFailed(String),

    #[error("Failed to send request: {0}")]
    SendFailed(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport shut down")]
    Shutdown,
}

impl RpcError {
    /// Error code reported by the worker, if this is a remote error.
    pub fn remote_code(&self) -> Option<&str> {
        match self {
            Self::Remote { code, .. } => Some(code),
            _ => None,
        }
    }
}

/// Job-related errors returned to operators.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("No job for device {device_id}")]
    NotFound { device_id: String },

    #[error("Job for device {device_id} belongs to another user")]
    NotOwner { device_id: String },

    #[error("Job for device {device_id} is in step {step}, cannot {action}")]
    InvalidState {
        device_id: String,
        step: String,
        action: String,
    },

    #[error("Job for device {device_id} cannot {action}: missing {missing}")]
    MissingPrecondition {
        device_id: String,
        action: String,
        missing: String,
    },

    #[error("Storage error: {0}")]
    Database(#[from] DatabaseError),
}

/// Pipeline-related errors. A missing stage handler is not one of them.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Stage {stage} failed for {source_name}/{data_kind}: {reason}")]
    StageFailed {
        source_name: String,
        data_kind: String,
        stage: String,
        reason: String,
    },

    #[error("Worker call failed: {0}")]
    Rpc(#[from] RpcError),
}

/// Result type alias for the orchestrator.
pub type Result<T> = std::result::Result<T, Error>;
