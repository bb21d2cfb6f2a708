use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("project not found: {0}")]
    NotFound(String),

    #[error("a project named '{0}' already exists")]
    DuplicateName(String),

    #[error("invalid project: {0}")]
    Invalid(String),

    #[error("storage error during {operation}: {detail}")]
    Storage { operation: String, detail: String },

    #[error("corrupted {0} in storage")]
    Corruption(String),
}

impl StoreError {
    pub fn storage(operation: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Storage {
            operation: operation.into(),
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("payload is missing required field '{0}'")]
    MissingField(&'static str),
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("deploy script not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("deploy script timed out after {}s", .after.as_secs())]
    Timeout {
        after: Duration,
        stdout: String,
        stderr: String,
    },

    #[error("failed to spawn deploy script: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("i/o error while running deploy script: {0}")]
    Io(#[source] std::io::Error),
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification transport failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("notification endpoint answered {status}: {body}")]
    Status { status: u16, body: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Reasons a delivery is turned away before an event row is written.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("missing project name (X-GitHub-Project header or ?project= query)")]
    MissingProject,

    #[error("unknown project: {0}")]
    UnknownProject(String),

    #[error("missing signature header")]
    MissingSignature,

    #[error("invalid signature")]
    InvalidSignature,

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
