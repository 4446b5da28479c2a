//! Component wiring.
//!
//! Every component is constructed once here and shared through `Arc`
//! handles, so there is no process-wide state and tests can build as many
//! independent engines as they like.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::info;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::container::ContainerRuntimeApi;
use crate::pty::PtyBridge;
use crate::session::{IdleReaper, SandboxConfig, SandboxManager, SessionRegistry, SessionService};
use crate::telemetry::{TelemetryCollector, TelemetryConfig};

/// Settings for every engine component.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub sandbox: SandboxConfig,
    pub telemetry: TelemetryConfig,
    /// Interval between idle sweeps.
    pub reaper_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sandbox: SandboxConfig::default(),
            telemetry: TelemetryConfig::default(),
            reaper_interval: Duration::from_secs(300),
        }
    }
}

/// The session orchestration engine.
pub struct Engine {
    registry: Arc<SessionRegistry>,
    manager: Arc<SandboxManager>,
    bridge: Arc<PtyBridge>,
    telemetry: Arc<TelemetryCollector>,
    sessions: Arc<SessionService>,
    reaper_interval: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(
        runtime: Arc<dyn ContainerRuntimeApi>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let manager = Arc::new(SandboxManager::new(
            runtime,
            registry.clone(),
            clock,
            config.sandbox,
        ));
        let bridge = Arc::new(PtyBridge::new(manager.clone()));
        let telemetry = Arc::new(TelemetryCollector::new(manager.clone(), config.telemetry));
        let sessions = Arc::new(SessionService::new(
            manager.clone(),
            bridge.clone(),
            telemetry.clone(),
        ));

        Self {
            registry,
            manager,
            bridge,
            telemetry,
            sessions,
            reaper_interval: config.reaper_interval,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn manager(&self) -> &Arc<SandboxManager> {
        &self.manager
    }

    pub fn bridge(&self) -> &Arc<PtyBridge> {
        &self.bridge
    }

    pub fn telemetry(&self) -> &Arc<TelemetryCollector> {
        &self.telemetry
    }

    pub fn sessions(&self) -> &Arc<SessionService> {
        &self.sessions
    }

    /// Start the idle reaper and the telemetry loops.
    pub fn start_background_tasks(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if !tasks.is_empty() {
            return;
        }
        tasks.push(IdleReaper::new(self.manager.clone(), self.reaper_interval).spawn());
        tasks.extend(self.telemetry.spawn_tasks());
    }

    /// Stop background tasks and terminate every session.
    ///
    /// Returns the number of sessions whose sandboxes were stopped cleanly.
    pub async fn shutdown(&self) -> usize {
        let tasks: Vec<_> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        for task in tasks {
            task.abort();
        }
        self.telemetry.shutdown();

        let total = self.registry.len();
        let stopped = self.manager.shutdown_all().await;
        info!("Shutdown stopped {} of {} session(s)", stopped, total);
        stopped
    }
}
