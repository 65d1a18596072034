//! Container runtime error types.

use thiserror::Error;

/// Result type for container operations.
pub type ContainerResult<T> = Result<T, ContainerError>;

/// Errors that can occur during container operations.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The container command failed.
    #[error("container {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// Container was not found.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Image was not found.
    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// Failed to parse container output.
    #[error("failed to parse container output: {0}")]
    ParseError(String),

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ContainerError {
    /// Whether this error means the target container no longer exists.
    pub fn is_not_found(&self) -> bool {
        match self {
            ContainerError::ContainerNotFound(_) => true,
            ContainerError::CommandFailed { message, .. } => {
                let lower = message.to_lowercase();
                // docker says "No such object" for inspect, "No such
                // container" elsewhere; podman says "no such container"
                lower.contains("no such container")
                    || lower.contains("no such object")
                    || lower.contains("not found")
            }
            _ => false,
        }
    }
}
