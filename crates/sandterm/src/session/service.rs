//! Session orchestration.
//!
//! Ties volume resolution, sandbox lifecycle, the PTY bridge and telemetry
//! together into the operations the transport calls.

use std::sync::Arc;

use dashmap::DashMap;
use log::{info, warn};
use uuid::Uuid;

use crate::pty::{EventSender, PtyBridge};
use crate::telemetry::TelemetryCollector;

use super::error::{SessionError, SessionResult};
use super::manager::SandboxManager;
use super::models::{CreateSessionRequest, Session, SessionState, TerminalSize};
use super::volume::VolumeResolver;

/// Holds one of a user's session slots while a session is being created.
struct SlotGuard {
    user_id: String,
    pending: Arc<DashMap<String, usize>>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let empty = match self.pending.get_mut(&self.user_id) {
            Some(mut count) => {
                *count = count.saturating_sub(1);
                *count == 0
            }
            None => false,
        };
        if empty {
            self.pending.remove_if(&self.user_id, |_, count| *count == 0);
        }
    }
}

/// Service for creating, driving and closing sessions.
pub struct SessionService {
    manager: Arc<SandboxManager>,
    bridge: Arc<PtyBridge>,
    telemetry: Arc<TelemetryCollector>,
    /// Creations in flight per user, counted against the session cap.
    pending: Arc<DashMap<String, usize>>,
}

impl SessionService {
    pub fn new(
        manager: Arc<SandboxManager>,
        bridge: Arc<PtyBridge>,
        telemetry: Arc<TelemetryCollector>,
    ) -> Self {
        Self {
            manager,
            bridge,
            telemetry,
            pending: Arc::new(DashMap::new()),
        }
    }

    pub fn manager(&self) -> &Arc<SandboxManager> {
        &self.manager
    }

    pub fn bridge(&self) -> &Arc<PtyBridge> {
        &self.bridge
    }

    fn reserve_slot(&self, user_id: &str) -> SessionResult<SlotGuard> {
        let limit = self.manager.config().max_sessions_per_user;
        {
            let mut pending = self.pending.entry(user_id.to_string()).or_insert(0);
            let active = self.manager.registry().count_for_user(user_id);
            if active + *pending < limit {
                *pending += 1;
                return Ok(SlotGuard {
                    user_id: user_id.to_string(),
                    pending: self.pending.clone(),
                });
            }
        }
        self.pending.remove_if(user_id, |_, count| *count == 0);
        Err(SessionError::LimitReached {
            user_id: user_id.to_string(),
            limit,
        })
    }

    /// Create a session: sandbox, shell, registration, observation.
    ///
    /// Output and close events for the session are sent on `events`. On
    /// error nothing is registered; an attach failure stops the container
    /// that was started for it.
    pub async fn create_session(
        &self,
        user_id: &str,
        request: CreateSessionRequest,
        events: EventSender,
    ) -> SessionResult<Session> {
        if user_id.trim().is_empty() {
            return Err(SessionError::validation("user id is required"));
        }
        if request.shell.trim().is_empty() {
            return Err(SessionError::validation("shell is required"));
        }
        let size = TerminalSize::clamped(request.cols, request.rows);

        let _slot = self.reserve_slot(user_id)?;
        let session_id = Uuid::new_v4().to_string();
        let provisioning = self.manager.begin_provisioning(&session_id);
        provisioning.advance(SessionState::Creating);

        let container = self
            .manager
            .create_sandbox(user_id, &session_id, &request.environment)
            .await?;

        let stream = match self.bridge.attach(&container, &request.shell, size).await {
            Ok(stream) => stream,
            Err(source) => {
                warn!(
                    "Attach to {} failed, stopping container: {}",
                    container.name, source
                );
                self.manager.stop_container(&container.id).await;
                return Err(SessionError::Attach {
                    container_id: container.id,
                    source,
                });
            }
        };

        let now = self.manager.clock().now();
        let max_lifetime = chrono::Duration::from_std(self.manager.config().max_lifetime)
            .unwrap_or(chrono::Duration::MAX);
        let session = Session {
            session_id: session_id.clone(),
            user_id: user_id.to_string(),
            container_id: container.id.clone(),
            container_name: container.name.clone(),
            volume_name: VolumeResolver::volume_name(user_id, &request.environment),
            environment: request.environment.clone(),
            shell: request.shell.clone(),
            cols: size.cols,
            rows: size.rows,
            exec_id: Some(stream.exec_id.clone()),
            state: SessionState::Running,
            created_at: now,
            last_activity: now,
            expires_at: now.checked_add_signed(max_lifetime).unwrap_or(now),
        };

        self.manager.registry().put(session.clone());
        self.bridge.bind(&session_id, stream, events);
        self.telemetry.observe(&container);

        info!(
            "Created session {} for user {} in {} ({}x{})",
            session_id, user_id, container.name, size.cols, size.rows
        );
        Ok(session)
    }

    /// Forward input bytes to the session's shell and record activity.
    pub async fn send_input(&self, session_id: &str, data: &[u8]) -> bool {
        if !self.bridge.write(session_id, data).await {
            return false;
        }
        self.manager
            .registry()
            .touch(session_id, self.manager.clock().now())
    }

    /// Resize the session's terminal. Out-of-range sizes are clamped.
    pub async fn resize(&self, session_id: &str, cols: u16, rows: u16) -> bool {
        self.bridge
            .resize(session_id, TerminalSize::clamped(cols, rows))
            .await
    }

    /// Record activity without I/O.
    pub fn keepalive(&self, session_id: &str) -> bool {
        self.manager
            .registry()
            .touch(session_id, self.manager.clock().now())
    }

    /// Close a session.
    ///
    /// Stops relaying output and closes the stream, then terminates the
    /// sandbox, which removes the registry entry. Each step runs even if an
    /// earlier one failed. Returns false if the session was unknown.
    pub async fn close_session(&self, session_id: &str) -> bool {
        let session = self.manager.registry().get(session_id);

        self.bridge.end(session_id).await;

        let Some(session) = session else {
            return false;
        };
        self.manager.terminate_sandbox(session_id).await;
        self.telemetry.forget(&session.container_id);

        info!("Closed session {} for user {}", session_id, session.user_id);
        true
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.manager.registry().get(session_id)
    }

    pub fn list(&self) -> Vec<Session> {
        self.manager.registry().list()
    }

    pub fn list_for_user(&self, user_id: &str) -> Vec<Session> {
        self.manager.registry().list_by_user(user_id)
    }
}
