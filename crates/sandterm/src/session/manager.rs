//! Sandbox lifecycle management.
//!
//! Creates, starts and stops sandbox containers, discovers the sandboxes the
//! runtime knows about and partitions them into tracked and orphaned, and
//! reclaims idle or expired sessions.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::clock::Clock;
use crate::container::{
    ContainerFilter, ContainerRecord, ContainerRuntimeApi, ContainerSpec, ContainerState,
    LABEL_ENVIRONMENT, LABEL_MANAGED, LABEL_SESSION, LABEL_USER, ResourceLimits,
};

use super::error::{SessionError, SessionResult};
use super::models::SessionState;
use super::registry::SessionRegistry;
use super::volume::VolumeResolver;

/// Prefix of every sandbox container name.
pub const CONTAINER_NAME_PREFIX: &str = "sandterm-";

/// Extra time allowed on top of the stop grace period before a stop call is
/// abandoned.
const STOP_TIMEOUT_SLACK: Duration = Duration::from_secs(10);

/// Lifecycle settings for sandboxes.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Image per environment name.
    pub images: HashMap<String, String>,
    /// Mount point of the persistent volume, also the working directory.
    pub workdir: String,
    /// Hostname shown inside the sandbox.
    pub hostname: String,
    /// Container command. Empty means the image default.
    pub command: Vec<String>,
    pub limits: ResourceLimits,
    pub network_mode: Option<String>,
    /// Grace period handed to the runtime on stop.
    pub stop_grace_seconds: u32,
    /// Inactivity after which a session is reaped.
    pub idle_timeout: Duration,
    /// Hard cap on a session's lifetime.
    pub max_lifetime: Duration,
    /// Maximum concurrent sessions per user.
    pub max_sessions_per_user: usize,
    /// How long a discovery listing is reused.
    pub discovery_ttl: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            images: HashMap::from([(
                "default".to_string(),
                "sandterm-default:latest".to_string(),
            )]),
            workdir: "/home/sandbox".to_string(),
            hostname: "sandbox".to_string(),
            command: Vec::new(),
            limits: ResourceLimits {
                memory_bytes: Some(512 * 1024 * 1024),
                nano_cpus: Some(1_000_000_000),
                pids_limit: Some(256),
            },
            network_mode: Some("none".to_string()),
            stop_grace_seconds: 5,
            idle_timeout: Duration::from_secs(30 * 60),
            max_lifetime: Duration::from_secs(8 * 60 * 60),
            max_sessions_per_user: 5,
            discovery_ttl: Duration::from_secs(3),
        }
    }
}

impl SandboxConfig {
    pub fn image_for(&self, environment: &str) -> Option<&str> {
        self.images.get(environment).map(String::as_str)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.stop_grace_seconds)) + STOP_TIMEOUT_SLACK
    }
}

/// Sandboxes observed on the runtime, split by Registry membership.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Discovery {
    pub tracked: Vec<ContainerRecord>,
    pub orphaned: Vec<ContainerRecord>,
}

impl Discovery {
    /// Every sandbox container, tracked first.
    pub fn all(&self) -> impl Iterator<Item = &ContainerRecord> {
        self.tracked.iter().chain(self.orphaned.iter())
    }
}

struct CachedListing {
    fetched_at: Instant,
    epoch: u64,
    records: Vec<ContainerRecord>,
}

/// Short-lived cache over the runtime's sandbox listing.
///
/// Concurrent callers share one in-flight refresh. Invalidation bumps an
/// epoch and never waits on a refresh.
struct DiscoveryCache {
    ttl: Duration,
    epoch: AtomicU64,
    listing: Mutex<Option<CachedListing>>,
}

impl DiscoveryCache {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            epoch: AtomicU64::new(0),
            listing: Mutex::new(None),
        }
    }

    fn invalidate(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    async fn records(
        &self,
        runtime: &dyn ContainerRuntimeApi,
    ) -> SessionResult<Vec<ContainerRecord>> {
        let mut listing = self.listing.lock().await;
        let epoch = self.epoch.load(Ordering::SeqCst);

        if let Some(cached) = listing.as_ref()
            && cached.epoch == epoch
            && cached.fetched_at.elapsed() < self.ttl
        {
            return Ok(cached.records.clone());
        }

        let records = runtime
            .list_containers(&ContainerFilter::sandboxes())
            .await?;
        debug!("Discovered {} sandbox container(s)", records.len());
        *listing = Some(CachedListing {
            fetched_at: Instant::now(),
            epoch,
            records: records.clone(),
        });
        Ok(records)
    }
}

/// Marks a session as being provisioned until dropped.
///
/// While held, the session's container is reported as tracked even though
/// the session is not registered yet. The entry starts as
/// [`SessionState::Requested`] and moves to [`SessionState::Creating`] once
/// the sandbox is being built.
pub struct ProvisioningGuard {
    session_id: String,
    provisioning: Arc<DashMap<String, SessionState>>,
}

impl ProvisioningGuard {
    /// Move the entry to `next` if the state machine allows it.
    pub fn advance(&self, next: SessionState) -> bool {
        match self.provisioning.get_mut(&self.session_id) {
            Some(mut state) if state.can_transition_to(next) => {
                debug!("Session {}: {} -> {}", self.session_id, *state, next);
                *state = next;
                true
            }
            _ => false,
        }
    }
}

impl Drop for ProvisioningGuard {
    fn drop(&mut self) {
        self.provisioning.remove(&self.session_id);
    }
}

/// Owns sandbox containers for the lifetime of their sessions.
pub struct SandboxManager {
    runtime: Arc<dyn ContainerRuntimeApi>,
    registry: Arc<SessionRegistry>,
    volumes: VolumeResolver,
    clock: Arc<dyn Clock>,
    config: SandboxConfig,
    discovery: DiscoveryCache,
    provisioning: Arc<DashMap<String, SessionState>>,
}

impl SandboxManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntimeApi>,
        registry: Arc<SessionRegistry>,
        clock: Arc<dyn Clock>,
        config: SandboxConfig,
    ) -> Self {
        Self {
            volumes: VolumeResolver::new(runtime.clone()),
            discovery: DiscoveryCache::new(config.discovery_ttl),
            runtime,
            registry,
            clock,
            config,
            provisioning: Arc::new(DashMap::new()),
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntimeApi> {
        &self.runtime
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn volumes(&self) -> &VolumeResolver {
        &self.volumes
    }

    /// Container name used for a session.
    pub fn container_name(session_id: &str) -> String {
        format!("{CONTAINER_NAME_PREFIX}{session_id}")
    }

    /// Mark a session as in flight so discovery does not report its
    /// container as orphaned before it is registered.
    pub fn begin_provisioning(&self, session_id: &str) -> ProvisioningGuard {
        self.provisioning
            .insert(session_id.to_string(), SessionState::Requested);
        ProvisioningGuard {
            session_id: session_id.to_string(),
            provisioning: self.provisioning.clone(),
        }
    }

    /// State of a session that is still being provisioned.
    pub fn provisioning_state(&self, session_id: &str) -> Option<SessionState> {
        self.provisioning.get(session_id).map(|state| *state)
    }

    /// Whether a session is registered or being provisioned.
    pub fn is_tracked(&self, session_id: &str) -> bool {
        self.registry.contains(session_id) || self.provisioning.contains_key(session_id)
    }

    /// Create and start a sandbox for a session.
    ///
    /// On any failure nothing is left behind: a created but unstartable
    /// container is force-removed and no session is registered.
    pub async fn create_sandbox(
        &self,
        user_id: &str,
        session_id: &str,
        environment: &str,
    ) -> SessionResult<ContainerRecord> {
        let image = self.config.image_for(environment).ok_or_else(|| {
            SessionError::validation(format!("unknown environment '{environment}'"))
        })?;

        let volume = self.volumes.ensure_volume(user_id, environment).await?;
        let name = Self::container_name(session_id);

        let spec = ContainerSpec::new(image)
            .name(&name)
            .hostname(&self.config.hostname)
            .command(self.config.command.clone())
            .env("SANDTERM_USER", user_id)
            .env("SANDTERM_SESSION", session_id)
            .env("SANDTERM_ENVIRONMENT", environment)
            .env("HOME", &self.config.workdir)
            .env("TERM", "xterm-256color")
            .label(LABEL_MANAGED, "true")
            .label(LABEL_USER, user_id)
            .label(LABEL_SESSION, session_id)
            .label(LABEL_ENVIRONMENT, environment)
            .volume(&volume, &self.config.workdir)
            .workdir(&self.config.workdir)
            .interactive()
            .limits(self.config.limits)
            .auto_remove(true);
        let spec = match self.config.network_mode {
            Some(ref mode) => spec.network_mode(mode),
            None => spec,
        };

        spec.validate()
            .map_err(|e| SessionError::creation("invalid sandbox spec", e))?;

        info!(
            "Creating sandbox {} for user {} (environment {}, image {})",
            name, user_id, environment, image
        );
        let container_id = self
            .runtime
            .create_container(&spec)
            .await
            .map_err(|e| SessionError::creation(format!("create {name}"), e))?;

        if let Err(e) = self.runtime.start_container(&container_id).await {
            warn!("Failed to start sandbox {}: {}", name, e);
            if let Err(rm) = self.runtime.remove_container(&container_id, true).await
                && !rm.is_not_found()
            {
                warn!("Failed to remove unstartable sandbox {}: {}", name, rm);
            }
            return Err(SessionError::creation(format!("start {name}"), e));
        }

        self.discovery.invalidate();
        info!("Sandbox {} running as {}", name, container_id);

        Ok(ContainerRecord {
            id: container_id,
            name,
            labels: spec.labels,
            state: ContainerState::Running,
        })
    }

    /// Stop a container, bounded by the grace period plus slack.
    ///
    /// Returns true if the container is gone or stopping.
    pub async fn stop_container(&self, container_id: &str) -> bool {
        let stop = self
            .runtime
            .stop_container(container_id, Some(self.config.stop_grace_seconds));
        match tokio::time::timeout(self.config.stop_timeout(), stop).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) if e.is_not_found() => {
                debug!("Container {} already gone", container_id);
                true
            }
            Ok(Err(e)) => {
                warn!("Failed to stop container {}: {}", container_id, e);
                false
            }
            Err(_) => {
                warn!(
                    "Stopping container {} timed out after {:?}",
                    container_id,
                    self.config.stop_timeout()
                );
                false
            }
        }
    }

    /// Tear down a session's sandbox and drop it from the registry.
    ///
    /// The registry entry is removed even when the stop fails. Returns true
    /// only if the session existed and its container was stopped; false if
    /// the session is unknown, already being terminated, or the stop failed.
    pub async fn terminate_sandbox(&self, session_id: &str) -> bool {
        let Some(session) = self.registry.begin_termination(session_id) else {
            debug!("Session {} not registered or already terminating", session_id);
            return false;
        };

        info!(
            "Terminating session {} (container {})",
            session_id, session.container_name
        );
        let stopped = self.stop_container(&session.container_id).await;

        self.registry.remove(session_id);
        self.discovery.invalidate();
        stopped
    }

    /// List sandbox containers and split them into tracked and orphaned.
    ///
    /// Each container appears in exactly one of the two lists.
    pub async fn discover_sandboxes(&self) -> SessionResult<Discovery> {
        let records = self.discovery.records(self.runtime.as_ref()).await?;

        let mut seen = HashSet::new();
        let mut discovery = Discovery::default();
        for record in records {
            if !record.is_sandbox() || !seen.insert(record.id.clone()) {
                continue;
            }
            let tracked = record.session_id().is_some_and(|id| self.is_tracked(id));
            if tracked {
                discovery.tracked.push(record);
            } else {
                discovery.orphaned.push(record);
            }
        }

        if !discovery.orphaned.is_empty() {
            debug!("Found {} orphaned sandbox(es)", discovery.orphaned.len());
        }
        Ok(discovery)
    }

    /// Terminate every session that is idle past the threshold or expired.
    ///
    /// Candidates are snapshotted first and then terminated concurrently, so
    /// a slow stop for one session does not delay the others. Returns the
    /// number of sessions removed.
    pub async fn cleanup_idle(&self) -> usize {
        let now = self.clock.now();
        let idle_limit =
            chrono::Duration::from_std(self.config.idle_timeout).unwrap_or(chrono::Duration::MAX);

        let candidates: Vec<_> = self
            .registry
            .list()
            .into_iter()
            .filter(|s| s.state == SessionState::Running)
            .filter(|s| s.idle_for(now) > idle_limit || s.is_expired(now))
            .collect();

        if candidates.is_empty() {
            return 0;
        }

        for session in &candidates {
            if session.is_expired(now) {
                info!(
                    "Reaping session {} (expired at {})",
                    session.session_id, session.expires_at
                );
            } else {
                info!(
                    "Reaping idle session {} (last activity {}, idle > {:?})",
                    session.session_id, session.last_activity, self.config.idle_timeout
                );
            }
        }

        let results = join_all(
            candidates
                .iter()
                .map(|s| self.terminate_sandbox(&s.session_id)),
        )
        .await;

        let removed = candidates
            .iter()
            .filter(|s| !self.registry.contains(&s.session_id))
            .count();
        let failed = results.iter().filter(|ok| !**ok).count();
        if failed > 0 {
            warn!("{} idle session stop(s) failed during sweep", failed);
        }
        info!("Reaped {} idle or expired session(s)", removed);
        removed
    }

    /// Stop a container reported as orphaned.
    ///
    /// Refuses containers that belong to a registered session.
    pub async fn terminate_orphan(&self, container_id: &str) -> SessionResult<ContainerRecord> {
        let discovery = self.discover_sandboxes().await?;

        if discovery
            .tracked
            .iter()
            .any(|r| r.id == container_id || r.name.trim_start_matches('/') == container_id)
        {
            return Err(SessionError::validation(format!(
                "container {container_id} belongs to an active session"
            )));
        }

        let record = discovery
            .orphaned
            .into_iter()
            .find(|r| r.id == container_id || r.name.trim_start_matches('/') == container_id)
            .ok_or_else(|| SessionError::NotFound(container_id.to_string()))?;

        info!(
            "Terminating orphaned sandbox {} (session {:?}, user {:?})",
            record.name,
            record.session_id(),
            record.user()
        );
        let stop = self
            .runtime
            .stop_container(&record.id, Some(self.config.stop_grace_seconds));
        let result = match tokio::time::timeout(self.config.stop_timeout(), stop).await {
            Ok(Ok(())) => Ok(record),
            Ok(Err(e)) if e.is_not_found() => Ok(record),
            Ok(Err(e)) => Err(SessionError::Runtime(e)),
            Err(_) => Err(SessionError::Runtime(crate::container::ContainerError::command(
                "stop",
                format!("timed out stopping {}", record.id),
            ))),
        };
        self.discovery.invalidate();
        result
    }

    /// Terminate every registered session. Used on shutdown.
    pub async fn shutdown_all(&self) -> usize {
        let sessions = self.registry.list();
        if sessions.is_empty() {
            return 0;
        }
        info!("Terminating {} session(s) for shutdown", sessions.len());
        let results = join_all(
            sessions
                .iter()
                .map(|s| self.terminate_sandbox(&s.session_id)),
        )
        .await;
        results.into_iter().filter(|ok| *ok).count()
    }
}
