//! Concurrency-safe store of active sessions.

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::models::{Session, SessionState, TerminalSize};

/// In-memory registry of sessions keyed by session ID.
///
/// Every mutation goes through a single shard write guard, so readers never
/// observe a half-updated entry. Readers get owned clones.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a session.
    pub fn put(&self, session: Session) {
        self.sessions.insert(session.session_id.clone(), session);
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn remove(&self, session_id: &str) -> Option<Session> {
        self.sessions.remove(session_id).map(|(_, s)| s)
    }

    /// Snapshot of every session.
    pub fn list(&self) -> Vec<Session> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    pub fn list_by_user(&self, user_id: &str) -> Vec<Session> {
        self.sessions
            .iter()
            .filter(|e| e.user_id == user_id)
            .map(|e| e.value().clone())
            .collect()
    }

    /// Number of live (non-terminating) sessions owned by a user.
    pub fn count_for_user(&self, user_id: &str) -> usize {
        self.sessions
            .iter()
            .filter(|e| e.user_id == user_id && e.state == SessionState::Running)
            .count()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Record activity on a session. Returns false if it is not registered.
    pub fn touch(&self, session_id: &str, now: DateTime<Utc>) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(mut session) => {
                if now > session.last_activity {
                    session.last_activity = now;
                }
                true
            }
            None => false,
        }
    }

    /// Store new terminal dimensions and count it as activity.
    pub fn update_dimensions(
        &self,
        session_id: &str,
        size: TerminalSize,
        now: DateTime<Utc>,
    ) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(mut session) => {
                session.cols = size.cols;
                session.rows = size.rows;
                if now > session.last_activity {
                    session.last_activity = now;
                }
                true
            }
            None => false,
        }
    }

    /// Move a running session to `Terminating` and return it.
    ///
    /// Returns `None` if the session is unknown or another caller already
    /// started terminating it, so teardown runs once per session.
    pub fn begin_termination(&self, session_id: &str) -> Option<Session> {
        let mut session = self.sessions.get_mut(session_id)?;
        if !session.state.can_transition_to(SessionState::Terminating) {
            return None;
        }
        session.state = SessionState::Terminating;
        Some(session.clone())
    }
}
