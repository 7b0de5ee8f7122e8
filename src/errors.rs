//! Error types for the deployment manager

use std::time::Duration;

use thiserror::Error;

/// Main error type for the deployment manager
#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Conflict: {0}")]
    ConflictError(String),

    #[error("Build failed: {message}")]
    BuildError {
        message: String,
        /// Exit code of the underlying build tool, if it ran at all
        exit_code: Option<i32>,
        /// Captured stdout/stderr of the build tool
        output: String,
    },

    #[error("Start failed: {0}")]
    StartError(String),

    #[error("Stop failed: {0}")]
    StopError(String),

    #[error("Probe timed out after {0:?}")]
    ProbeTimeout(Duration),

    #[error("Invalid transition: {0}")]
    TransitionError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ManagerError {
    /// Build a `BuildError` from a finished tool invocation.
    pub fn build_failed(message: impl Into<String>, exit_code: Option<i32>, output: impl Into<String>) -> Self {
        ManagerError::BuildError {
            message: message.into(),
            exit_code,
            output: output.into(),
        }
    }

    /// Human-readable cause string recorded in history snapshots.
    pub fn cause(&self) -> String {
        self.to_string()
    }
}

impl From<anyhow::Error> for ManagerError {
    fn from(err: anyhow::Error) -> Self {
        ManagerError::Internal(err.to_string())
    }
}
