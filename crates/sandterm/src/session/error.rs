//! Session orchestration errors.

use thiserror::Error;

use crate::container::ContainerError;

pub type SessionResult<T> = Result<T, SessionError>;

/// Errors surfaced by the orchestration core.
///
/// None of these are retried inside the core; retry policy belongs to the
/// caller.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Creating or starting the sandbox failed. Nothing was registered.
    #[error("sandbox creation failed: {message}")]
    SandboxCreation {
        message: String,
        #[source]
        source: Option<ContainerError>,
    },

    /// Resolving the persistent volume failed.
    #[error("volume {volume} unavailable: {source}")]
    Volume {
        volume: String,
        #[source]
        source: ContainerError,
    },

    /// Exec or attach failed on a running container. No session was registered.
    #[error("failed to attach to sandbox {container_id}: {source}")]
    Attach {
        container_id: String,
        #[source]
        source: ContainerError,
    },

    /// A runtime stream dropped mid-session.
    #[error("stream for session {session_id} failed: {message}")]
    Stream { session_id: String, message: String },

    /// Request failed validation.
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("session not found: {0}")]
    NotFound(String),

    /// The user already has the maximum number of sessions.
    #[error("session limit reached for user {user_id} (max {limit})")]
    LimitReached { user_id: String, limit: usize },

    /// Runtime listing or other infrastructure call failed.
    #[error(transparent)]
    Runtime(#[from] ContainerError),
}

impl SessionError {
    pub fn creation(message: impl Into<String>, source: ContainerError) -> Self {
        Self::SandboxCreation {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Short machine-readable code for wire replies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SandboxCreation { .. } => "SANDBOX_CREATION_FAILED",
            Self::Volume { .. } => "VOLUME_ERROR",
            Self::Attach { .. } => "ATTACH_FAILED",
            Self::Stream { .. } => "STREAM_ERROR",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::LimitReached { .. } => "LIMIT_REACHED",
            Self::Runtime(_) => "RUNTIME_ERROR",
        }
    }
}
