//! Error types for Pulse
//!
//! TigerStyle: Explicit error types with context, using thiserror.

use thiserror::Error;

/// Result type alias for Pulse operations
pub type Result<T> = std::result::Result<T, Error>;

/// Pulse error types
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Task Scheduling Errors
    // =========================================================================
    #[error("Cannot start task {task}: stopper is quiescing")]
    Quiescing { task: String },

    #[error("Task {task} failed: {reason}")]
    TaskFailed { task: String, reason: String },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Invalid configuration: {field}, reason: {reason}")]
    InvalidConfiguration { field: String, reason: String },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {reason}")]
    Internal { reason: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create a quiescing error for the named task
    pub fn quiescing(task: impl Into<String>) -> Self {
        Self::Quiescing { task: task.into() }
    }

    /// Create an invalid configuration error
    pub fn invalid_configuration(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create an internal error
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Check if this error was caused by shutdown
    pub fn is_quiescing(&self) -> bool {
        matches!(self, Self::Quiescing { .. })
    }
}
