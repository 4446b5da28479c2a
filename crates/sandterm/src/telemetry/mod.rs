//! Resource telemetry for sandboxes and the service's own containers.

mod collector;
pub mod metrics;

pub use collector::{
    ReconcileReport, SandboxUsage, SnapshotSubscription, SnapshotSummary, SystemSnapshot,
    TelemetryCollector, TelemetryConfig,
};
pub use metrics::TelemetrySample;
