//! Session data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Minimum and maximum terminal columns accepted from clients.
pub const COLS_RANGE: (u16, u16) = (10, 500);
/// Minimum and maximum terminal rows accepted from clients.
pub const ROWS_RANGE: (u16, u16) = (5, 200);

/// Session lifecycle state.
///
/// `Requested -> Creating -> Running -> Terminating -> Terminated`, with
/// `Requested -> Terminated` or `Creating -> Terminated` when creation fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Requested,
    Creating,
    Running,
    Terminating,
    Terminated,
}

impl SessionState {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Requested, Creating)
                | (Requested, Terminated)
                | (Creating, Running)
                | (Creating, Terminated)
                | (Running, Terminating)
                | (Terminating, Terminated)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == SessionState::Terminated
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Requested => write!(f, "requested"),
            SessionState::Creating => write!(f, "creating"),
            SessionState::Running => write!(f, "running"),
            SessionState::Terminating => write!(f, "terminating"),
            SessionState::Terminated => write!(f, "terminated"),
        }
    }
}

/// Terminal dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl TerminalSize {
    /// Build a size, clamping into the supported range.
    ///
    /// Primary validation happens at the transport boundary; this keeps the
    /// core safe when it receives out-of-range values anyway.
    pub fn clamped(cols: u16, rows: u16) -> Self {
        Self {
            cols: cols.clamp(COLS_RANGE.0, COLS_RANGE.1),
            rows: rows.clamp(ROWS_RANGE.0, ROWS_RANGE.1),
        }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// An active terminal session backed by one sandbox container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub container_id: String,
    pub container_name: String,
    pub volume_name: String,
    pub environment: String,
    pub shell: String,
    pub cols: u16,
    pub rows: u16,
    /// Exec instance running the shell, recorded at attach time.
    pub exec_id: Option<String>,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    /// Seconds since the last activity-bearing operation.
    pub fn idle_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_activity
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn size(&self) -> TerminalSize {
        TerminalSize {
            cols: self.cols,
            rows: self.rows,
        }
    }
}

/// Parameters of a session creation request, already validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSessionRequest {
    pub environment: String,
    pub shell: String,
    pub cols: u16,
    pub rows: u16,
}

impl Default for CreateSessionRequest {
    fn default() -> Self {
        Self {
            environment: "default".to_string(),
            shell: "bash".to_string(),
            cols: 80,
            rows: 24,
        }
    }
}
