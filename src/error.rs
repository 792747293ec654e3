//! Error types for the orchestrator.

use std::path::PathBuf;

use crate::jobs::JobStatus;
use crate::jobs::protocol::UsageMetrics;
use crate::sandbox::SandboxError;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors reading or writing a JSON snapshot file.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Malformed snapshot {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Failed to serialize snapshot: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("State directory {path} is locked by another orchestrator")]
    Locked { path: PathBuf },
}

/// Session lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session {session_id} not found")]
    NotFound { session_id: String },

    #[error("Session {session_id} is not active")]
    Inactive { session_id: String },

    #[error("Container error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Filesystem error at {path}: {source}")]
    Filesystem {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

/// Job registry and submission errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {job_id} not found")]
    NotFound { job_id: String },

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Invalid status transition for {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Filesystem error at {path}: {source}")]
    Filesystem {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("Dispatch queue is full, job {job_id} was not started")]
    QueueFull { job_id: String },

    #[error("Dispatcher is shut down, job {job_id} was not started")]
    DispatcherStopped { job_id: String },

    #[error("Caller does not own job {job_id}")]
    Forbidden { job_id: String },
}

/// Failures of a single `/analyze_job` call against a session container.
///
/// The `Display` text is what ends up in the job's `error` field.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Session {session_id} not found or inactive")]
    SessionUnavailable { session_id: String },

    #[error("Cannot determine container port for session {session_id}")]
    NoPort { session_id: String },

    #[error("Error communicating with container API: {reason}")]
    Network { reason: String },

    #[error("TOKEN_LIMIT_EXCEEDED: {message}")]
    TokenLimitExceeded {
        message: String,
        metrics: UsageMetrics,
    },

    #[error("{message}")]
    UpstreamNon2xx {
        status: u16,
        message: String,
        metrics: UsageMetrics,
    },
}

/// Errors from the external stores a finished job is reconciled into.
#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    #[error("{service} unavailable: {reason}")]
    Unavailable {
        service: &'static str,
        reason: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

/// Errors while assembling the orchestrator at startup.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

/// Result type alias for the orchestrator.
pub type Result<T> = std::result::Result<T, OrchestratorError>;
