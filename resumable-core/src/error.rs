//! Error types for checkpointing and recovery.
//!
//! Uses `thiserror` for a single public error enum. Fatal restore failures
//! (missing fields, corrupt files) are surfaced to the caller; requeue failures
//! are only ever logged.

use std::path::PathBuf;

/// Top-level error type for the resumable core library.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("Failed to serialize {field}: {message}")]
    Serialization { field: String, message: String },

    #[error("Checkpoint {path} is missing required field '{field}'")]
    MissingField { field: String, path: PathBuf },

    #[error("Checkpoint {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Checkpoint holds {stored} {kind} states but {live} are live")]
    StateCountMismatch {
        kind: StateKind,
        stored: usize,
        live: usize,
    },

    #[error("Requeue of job {job_id} failed: {message}")]
    Requeue { job_id: String, message: String },

    #[error("{component} rejected state: {message}")]
    Collaborator { component: String, message: String },

    #[error("Distributed synchronization failed: {0}")]
    Distributed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Which positional state list a count mismatch refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    Optimizer,
    Scheduler,
}

impl std::fmt::Display for StateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateKind::Optimizer => write!(f, "optimizer"),
            StateKind::Scheduler => write!(f, "scheduler"),
        }
    }
}

impl CheckpointError {
    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn missing_field(field: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::MissingField {
            field: field.into(),
            path: path.into(),
        }
    }

    pub fn collaborator(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Collaborator {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Whether a save may be retried with the optional hyperparameters stripped.
    pub fn is_transient_serialization(&self) -> bool {
        matches!(self, Self::Serialization { .. })
    }
}

/// A type alias for results using `CheckpointError`.
pub type Result<T> = std::result::Result<T, CheckpointError>;
