//! Periodic idle-session sweep.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::manager::SandboxManager;

/// Terminates idle and expired sessions on a fixed interval.
pub struct IdleReaper {
    manager: Arc<SandboxManager>,
    interval: Duration,
}

impl IdleReaper {
    pub fn new(manager: Arc<SandboxManager>, interval: Duration) -> Self {
        Self { manager, interval }
    }

    /// Run a single sweep. Returns the number of sessions removed.
    pub async fn run_once(&self) -> usize {
        self.manager.cleanup_idle().await
    }

    /// Start the background sweep. Abort the handle to stop it.
    pub fn spawn(self) -> JoinHandle<()> {
        info!(
            "Starting idle reaper (every {:?}, idle timeout {:?})",
            self.interval,
            self.manager.config().idle_timeout
        );

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately.
            interval.tick().await;

            loop {
                interval.tick().await;
                let reaped = self.run_once().await;
                if reaped == 0 {
                    debug!("Idle sweep found nothing to reap");
                }
            }
        })
    }
}
