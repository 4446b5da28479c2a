//! Streaming resource collector.
//!
//! Keeps one stats subscription per observed container, caches the latest
//! derived sample for each, and publishes aggregated snapshots.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::container::{ContainerFilter, ContainerRecord, CpuStats};
use crate::session::{SandboxManager, SessionResult, SessionState};

use super::metrics::{TelemetrySample, derive_sample};

/// Collector settings.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// How often subscriptions are reconciled against the runtime.
    pub reconcile_interval: Duration,
    /// How often snapshots are pushed to subscribers.
    pub publish_interval: Duration,
    /// Sessions with activity inside this window count as active.
    pub activity_window: Duration,
    /// Names of the service's own containers to observe.
    pub service_containers: Vec<String>,
    /// Snapshots buffered per subscriber before it starts lagging.
    pub channel_capacity: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(5),
            publish_interval: Duration::from_secs(1),
            activity_window: Duration::from_secs(60),
            service_containers: Vec::new(),
            channel_capacity: 16,
        }
    }
}

/// Usage of one sandbox container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxUsage {
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub environment: Option<String>,
    /// No registered session owns this container.
    pub orphaned: bool,
    #[serde(flatten)]
    pub sample: TelemetrySample,
}

/// Aggregate counters over all sessions and sandboxes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSummary {
    pub total_sessions: usize,
    pub active_sessions: usize,
    pub idle_sessions: usize,
    pub orphaned_containers: usize,
    /// Memory used by all sandboxes, in bytes.
    pub memory_usage: u64,
    /// Sum of sandbox memory limits, in bytes.
    pub memory_limit: u64,
    /// CPU used by all sandboxes, in percent of one CPU.
    pub cpu_percent: f64,
}

/// Point-in-time view of every observed container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemSnapshot {
    pub timestamp: DateTime<Utc>,
    /// The service's own containers.
    pub service: Vec<TelemetrySample>,
    pub sandboxes: Vec<SandboxUsage>,
    pub summary: SnapshotSummary,
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub added: usize,
    pub removed: usize,
}

/// A live feed of snapshots. Drop it or call [`unsubscribe`] to detach.
///
/// [`unsubscribe`]: SnapshotSubscription::unsubscribe
pub struct SnapshotSubscription {
    rx: broadcast::Receiver<Arc<SystemSnapshot>>,
}

impl SnapshotSubscription {
    /// Wait for the next snapshot. Returns `None` once the collector is gone.
    ///
    /// A slow subscriber skips the snapshots it missed.
    pub async fn recv(&mut self) -> Option<Arc<SystemSnapshot>> {
        loop {
            match self.rx.recv().await {
                Ok(snapshot) => return Some(snapshot),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Snapshot subscriber lagged by {}", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn unsubscribe(self) {}
}

#[derive(Debug, Clone)]
struct Target {
    record: ContainerRecord,
    service: bool,
}

struct Subscription {
    generation: u64,
    target: Target,
    handle: JoinHandle<()>,
}

/// Observes resource usage of sandboxes and service containers.
pub struct TelemetryCollector {
    manager: Arc<SandboxManager>,
    config: TelemetryConfig,
    subscriptions: Arc<DashMap<String, Subscription>>,
    samples: Arc<DashMap<String, TelemetrySample>>,
    generation: AtomicU64,
    publisher: broadcast::Sender<Arc<SystemSnapshot>>,
}

impl TelemetryCollector {
    pub fn new(manager: Arc<SandboxManager>, config: TelemetryConfig) -> Self {
        let (publisher, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            manager,
            config,
            subscriptions: Arc::new(DashMap::new()),
            samples: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
            publisher,
        }
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    /// Start observing a sandbox container. A second call for the same
    /// container is a no-op. Returns true if a subscription was started.
    pub fn observe(&self, record: &ContainerRecord) -> bool {
        self.observe_target(Target {
            record: record.clone(),
            service: false,
        })
    }

    fn observe_target(&self, target: Target) -> bool {
        let id = target.record.id.clone();
        let entry = match self.subscriptions.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => return false,
            dashmap::mapref::entry::Entry::Vacant(entry) => entry,
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let (ready_tx, ready_rx) = oneshot::channel();
        let handle = tokio::spawn(run_subscription(SubscriptionTask {
            container_id: id.clone(),
            container_name: target.record.name.clone(),
            generation,
            ready: ready_rx,
            manager: self.manager.clone(),
            subscriptions: self.subscriptions.clone(),
            samples: self.samples.clone(),
        }));

        entry.insert(Subscription {
            generation,
            target,
            handle,
        });
        let _ = ready_tx.send(());

        debug!("Observing container {}", id);
        true
    }

    /// Stop observing a container and drop its cached sample.
    ///
    /// Samples are only stored while the task's own subscription is present,
    /// so once the subscription is gone no sample can reappear.
    pub fn forget(&self, container_id: &str) -> bool {
        let removed = self.subscriptions.remove(container_id);
        if let Some((_, subscription)) = &removed {
            subscription.handle.abort();
        }
        self.samples.remove(container_id);
        match removed {
            Some(_) => {
                debug!("Stopped observing container {}", container_id);
                true
            }
            None => false,
        }
    }

    pub fn is_observing(&self, container_id: &str) -> bool {
        self.subscriptions.contains_key(container_id)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Align subscriptions with the containers that exist right now.
    ///
    /// Tracked and orphaned sandboxes are both observed. Service containers
    /// are kept when their listing fails, since the failure says nothing
    /// about whether they still exist. Subscriptions started while the
    /// listing was in flight are newer than it and are left alone.
    pub async fn reconcile(&self) -> SessionResult<ReconcileReport> {
        let pass_start = self.generation.load(Ordering::SeqCst);
        let discovery = self.manager.discover_sandboxes().await?;

        let mut targets: Vec<Target> = discovery
            .all()
            .map(|record| Target {
                record: record.clone(),
                service: false,
            })
            .collect();
        let mut live: HashSet<String> = targets.iter().map(|t| t.record.id.clone()).collect();

        if !self.config.service_containers.is_empty() {
            let filter = ContainerFilter::by_names(&self.config.service_containers);
            match self.manager.runtime().list_containers(&filter).await {
                Ok(records) => {
                    for record in records {
                        live.insert(record.id.clone());
                        targets.push(Target {
                            record,
                            service: true,
                        });
                    }
                }
                Err(e) => {
                    warn!("Listing service containers failed: {}", e);
                    for entry in self.subscriptions.iter() {
                        if entry.target.service {
                            live.insert(entry.key().clone());
                        }
                    }
                }
            }
        }

        let stale: Vec<String> = self
            .subscriptions
            .iter()
            .filter(|entry| entry.generation < pass_start && !live.contains(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();

        let mut report = ReconcileReport::default();
        for id in stale {
            if self.forget(&id) {
                report.removed += 1;
            }
        }
        for target in targets {
            if self.observe_target(target) {
                report.added += 1;
            }
        }

        if report.added > 0 || report.removed > 0 {
            info!(
                "Telemetry reconciled: {} added, {} removed, {} observed",
                report.added,
                report.removed,
                self.subscriptions.len()
            );
        }
        Ok(report)
    }

    /// Assemble the latest cached samples into a snapshot.
    ///
    /// Never touches the network. Containers without a sample are omitted.
    pub fn snapshot(&self) -> SystemSnapshot {
        let registry = self.manager.registry();
        let now = self.manager.clock().now();

        let mut service = Vec::new();
        let mut sandboxes = Vec::new();
        for entry in self.subscriptions.iter() {
            let Some(sample) = self.samples.get(entry.key()).map(|s| s.clone()) else {
                continue;
            };
            let record = &entry.target.record;
            if entry.target.service {
                service.push(sample);
                continue;
            }
            let session_id = record.session_id().map(str::to_string);
            let orphaned = !session_id
                .as_deref()
                .is_some_and(|id| self.manager.is_tracked(id));
            sandboxes.push(SandboxUsage {
                session_id,
                user_id: record.user().map(str::to_string),
                environment: record.environment().map(str::to_string),
                orphaned,
                sample,
            });
        }
        service.sort_by(|a, b| a.container_name.cmp(&b.container_name));
        sandboxes.sort_by(|a, b| a.sample.container_name.cmp(&b.sample.container_name));

        let window = chrono::Duration::from_std(self.config.activity_window)
            .unwrap_or(chrono::Duration::MAX);
        let sessions: Vec<_> = registry
            .list()
            .into_iter()
            .filter(|s| s.state == SessionState::Running)
            .collect();
        let active_sessions = sessions
            .iter()
            .filter(|s| s.idle_for(now) <= window)
            .count();

        let summary = SnapshotSummary {
            total_sessions: sessions.len(),
            active_sessions,
            idle_sessions: sessions.len() - active_sessions,
            orphaned_containers: sandboxes.iter().filter(|s| s.orphaned).count(),
            memory_usage: sandboxes.iter().map(|s| s.sample.memory_usage).sum(),
            memory_limit: sandboxes.iter().map(|s| s.sample.memory_limit).sum(),
            cpu_percent: sandboxes.iter().map(|s| s.sample.cpu_percent).sum(),
        };

        SystemSnapshot {
            timestamp: now,
            service,
            sandboxes,
            summary,
        }
    }

    /// Receive a snapshot every publish tick.
    pub fn subscribe(&self) -> SnapshotSubscription {
        SnapshotSubscription {
            rx: self.publisher.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.publisher.receiver_count()
    }

    /// Push one snapshot to every current subscriber. Returns how many
    /// received it.
    pub fn publish(&self) -> usize {
        if self.publisher.receiver_count() == 0 {
            return 0;
        }
        self.publisher
            .send(Arc::new(self.snapshot()))
            .unwrap_or_default()
    }

    /// Start the reconcile and publish loops. Abort the handles to stop them.
    pub fn spawn_tasks(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        info!(
            "Starting telemetry (reconcile every {:?}, publish every {:?})",
            self.config.reconcile_interval, self.config.publish_interval
        );

        let collector = self.clone();
        let reconcile = tokio::spawn(async move {
            let mut interval = tokio::time::interval(collector.config.reconcile_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(e) = collector.reconcile().await {
                    warn!("Telemetry reconciliation failed: {}", e);
                }
            }
        });

        let collector = self.clone();
        let publish = tokio::spawn(async move {
            let mut interval = tokio::time::interval(collector.config.publish_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                collector.publish();
            }
        });

        vec![reconcile, publish]
    }

    /// Stop every subscription.
    pub fn shutdown(&self) {
        let ids: Vec<String> = self.subscriptions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.forget(&id);
        }
    }
}

struct SubscriptionTask {
    container_id: String,
    container_name: String,
    generation: u64,
    ready: oneshot::Receiver<()>,
    manager: Arc<SandboxManager>,
    subscriptions: Arc<DashMap<String, Subscription>>,
    samples: Arc<DashMap<String, TelemetrySample>>,
}

async fn run_subscription(task: SubscriptionTask) {
    if task.ready.await.is_err() {
        return;
    }
    let id = task.container_id;

    match task.manager.runtime().stream_stats(&id).await {
        Ok(mut stream) => {
            let mut previous: Option<CpuStats> = None;
            while let Some(item) = stream.next().await {
                match item {
                    Ok(raw) => {
                        let timestamp = raw
                            .read
                            .as_deref()
                            .and_then(|r| DateTime::parse_from_rfc3339(r).ok())
                            .map(|t| t.with_timezone(&Utc))
                            .unwrap_or_else(|| task.manager.clock().now());
                        let sample = derive_sample(
                            &id,
                            &task.container_name,
                            &raw,
                            previous.as_ref(),
                            timestamp,
                        );
                        // Holding the entry orders this insert before any
                        // concurrent forget of the subscription.
                        if let Some(current) = task.subscriptions.get(&id)
                            && current.generation == task.generation
                        {
                            task.samples.insert(id.clone(), sample);
                        }
                        previous = Some(raw.cpu_stats);
                    }
                    Err(e) => {
                        debug!("Stats stream for {} failed: {}", id, e);
                        break;
                    }
                }
            }
            debug!("Stats stream for {} ended", id);
        }
        Err(e) => {
            debug!("Cannot subscribe to stats of {}: {}", id, e);
        }
    }

    if task
        .subscriptions
        .remove_if(&id, |_, s| s.generation == task.generation)
        .is_some()
    {
        task.samples.remove(&id);
    }
}
