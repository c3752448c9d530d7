//! Custom error types for Autoforge.
//!
//! This module provides structured error types that separate recoverable
//! collaborator failures (which the orchestration loop funnels into the
//! recovery cascade) from programmer errors (which escape the loop).

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for Autoforge operations
#[derive(Error, Debug)]
pub enum AutoforgeError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Failed to load configuration
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        path: Option<PathBuf>,
    },

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfig { field: String, reason: String },

    /// Missing required file
    #[error("Missing required file: {path}")]
    MissingFile { path: PathBuf },

    // =========================================================================
    // Specification Errors
    // =========================================================================
    /// Specification could not be loaded or failed validation
    #[error("Specification error: {message}")]
    Specification { message: String },

    // =========================================================================
    // Generation Errors
    // =========================================================================
    /// Oracle call failed or timed out
    #[error("Oracle error: {message}")]
    Oracle { message: String },

    /// Generated output did not follow the fenced-block convention
    #[error("Malformed artifact: {message}")]
    MalformedArtifact { message: String },

    /// Artifact path escapes the output root or is otherwise unusable
    #[error("Unsafe artifact path: {path}")]
    UnsafePath { path: String },

    // =========================================================================
    // Service Errors
    // =========================================================================
    /// Generated service failed to install, start or stop
    #[error("Service error: {message}")]
    Service { message: String },

    /// Required external tool is missing
    #[error("Missing required tool: {tool}")]
    MissingTool { tool: String },

    // =========================================================================
    // Task Queue Errors (programmer errors)
    // =========================================================================
    /// Task id is not known to the queue
    #[error("Unknown task id: {id}")]
    UnknownTask { id: String },

    /// Task id was added twice
    #[error("Duplicate task id: {id}")]
    DuplicateTask { id: String },

    /// Requested status change is not allowed by the task state machine
    #[error("Illegal transition for task {id}: {from} -> {to}")]
    InvalidTransition { id: String, from: String, to: String },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AutoforgeError {
    // =========================================================================
    // Constructor helpers
    // =========================================================================

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            path: None,
        }
    }

    /// Create a configuration error with path
    pub fn config_with_path(message: impl Into<String>, path: PathBuf) -> Self {
        Self::Config {
            message: message.into(),
            path: Some(path),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a specification error
    pub fn specification(message: impl Into<String>) -> Self {
        Self::Specification {
            message: message.into(),
        }
    }

    /// Create an oracle error
    pub fn oracle(message: impl Into<String>) -> Self {
        Self::Oracle {
            message: message.into(),
        }
    }

    /// Create a malformed artifact error
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedArtifact {
            message: message.into(),
        }
    }

    /// Create a service error
    pub fn service(message: impl Into<String>) -> Self {
        Self::Service {
            message: message.into(),
        }
    }

    /// Create an unknown task error
    pub fn unknown_task(id: impl Into<String>) -> Self {
        Self::UnknownTask { id: id.into() }
    }

    // =========================================================================
    // Classification helpers
    // =========================================================================

    /// Check if this error is a programmer error that must not be retried.
    pub fn is_programmer_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownTask { .. } | Self::DuplicateTask { .. } | Self::InvalidTransition { .. }
        )
    }

    /// Check if this error means generated output must be regenerated.
    pub fn is_malformed_artifact(&self) -> bool {
        matches!(self, Self::MalformedArtifact { .. } | Self::UnsafePath { .. })
    }

    /// Get error code for exit status
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::UnknownTask { .. }
            | Self::DuplicateTask { .. }
            | Self::InvalidTransition { .. } => {
                2
            }
            Self::Specification { .. } => 5,
            Self::MissingFile { .. } | Self::MissingTool { .. } => 6,
            Self::Config { .. } | Self::InvalidConfig { .. } => 7,
            _ => 1,
        }
    }
}

/// Type alias for Autoforge results
pub type Result<T> = std::result::Result<T, AutoforgeError>;
