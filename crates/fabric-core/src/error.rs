//! Error types for the fabric

use std::time::Duration;
use thiserror::Error;

/// Result type for fabric operations
pub type Result<T> = std::result::Result<T, FabricError>;

/// Core error type for fabric operations
#[derive(Error, Debug)]
pub enum FabricError {
    /// Launcher/provider backend failure
    #[error("Provider error: {0}")]
    Provider(String),

    /// Container runtime failure
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// No launcher registered for the configured identifier
    #[error("No launcher registered for '{0}'")]
    UnknownLauncher(String),

    /// Remote command finished with a non-zero status
    #[error("Command on {host} exited with {status:?}: {stderr}")]
    RemoteCommand {
        host: String,
        status: Option<i32>,
        stderr: String,
    },

    /// Transient failures persisted past the retry budget
    #[error("Gave up on {host} after {attempts} attempts: {reason}")]
    RetriesExhausted {
        host: String,
        attempts: u32,
        reason: String,
    },

    /// Retry loop was cancelled
    #[error("Remote operation on {0} was cancelled")]
    Cancelled(String),

    /// Instance not found
    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    /// Timeout
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FabricError {
    /// Create a provider error
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    /// Create a runtime error
    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::Runtime(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Convert from a cloud SDK error
    pub fn from_aws<E>(err: E) -> Self
    where
        E: std::fmt::Display,
    {
        Self::Provider(err.to_string())
    }

    /// Whether the error came from the retry loop giving up or being cancelled
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::RetriesExhausted { .. } | Self::Cancelled(_))
    }
}
