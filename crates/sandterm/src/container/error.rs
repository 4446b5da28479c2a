//! Container runtime error types.

use thiserror::Error;

/// Result type for container operations.
pub type ContainerResult<T> = Result<T, ContainerError>;

/// Errors that can occur during container runtime calls.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The runtime rejected or failed the request.
    #[error("container {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// Container, exec instance or volume was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The object being created already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Failed to parse runtime output.
    #[error("failed to parse runtime output: {0}")]
    ParseError(String),

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A runtime stream ended or could not be opened in the expected mode.
    #[error("stream closed: {0}")]
    StreamClosed(String),

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ContainerError {
    /// Build a `CommandFailed` error for the given runtime call.
    pub fn command(command: impl Into<String>, message: impl ToString) -> Self {
        Self::CommandFailed {
            command: command.into(),
            message: message.to_string(),
        }
    }

    /// Whether this error means the object already exists.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }

    /// Whether this error means the object is gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_error_display() {
        let err = ContainerError::command("start", "no such image");
        assert_eq!(err.to_string(), "container start failed: no such image");

        let err = ContainerError::AlreadyExists("sandterm-u1-default".to_string());
        assert!(err.is_already_exists());
        assert!(!err.is_not_found());
    }
}
