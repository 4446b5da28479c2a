//! Metric derivation from raw stats samples.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::container::{BlkioStats, CpuStats, NetworkStats, RawStats};

/// Derived resource usage of one container at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySample {
    pub container_id: String,
    pub container_name: String,
    pub cpu_percent: f64,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub memory_percent: f64,
    pub network_rx: u64,
    pub network_tx: u64,
    pub block_read: u64,
    pub block_write: u64,
    pub pids: u64,
    pub timestamp: DateTime<Utc>,
}

/// CPU usage in percent of one CPU, summed over all online CPUs.
///
/// Both deltas are differences of cumulative counters between two samples.
/// Zero or negative deltas yield exactly 0.
pub fn cpu_percent(current: &CpuStats, previous: &CpuStats) -> f64 {
    let cpu_delta =
        current.cpu_usage.total_usage as f64 - previous.cpu_usage.total_usage as f64;
    let system_delta = current.system_cpu_usage.unwrap_or(0) as f64
        - previous.system_cpu_usage.unwrap_or(0) as f64;

    if cpu_delta <= 0.0 || system_delta <= 0.0 {
        return 0.0;
    }

    let percent = cpu_delta / system_delta * current.cpu_count() as f64 * 100.0;
    if percent.is_finite() { percent } else { 0.0 }
}

/// Memory usage as a percentage of the limit. A missing limit yields 0.
pub fn memory_percent(usage: u64, limit: u64) -> f64 {
    if limit == 0 {
        return 0.0;
    }
    usage as f64 / limit as f64 * 100.0
}

/// Received and transmitted bytes summed across interfaces.
pub fn network_totals(networks: Option<&HashMap<String, NetworkStats>>) -> (u64, u64) {
    networks
        .map(|n| {
            n.values().fold((0u64, 0u64), |(rx, tx), iface| {
                (rx.saturating_add(iface.rx_bytes), tx.saturating_add(iface.tx_bytes))
            })
        })
        .unwrap_or_default()
}

/// Bytes read and written summed across block devices.
pub fn block_io_totals(blkio: &BlkioStats) -> (u64, u64) {
    let Some(entries) = blkio.io_service_bytes_recursive.as_ref() else {
        return (0, 0);
    };

    entries.iter().fold((0u64, 0u64), |(read, write), entry| {
        if entry.op.eq_ignore_ascii_case("read") {
            (read.saturating_add(entry.value), write)
        } else if entry.op.eq_ignore_ascii_case("write") {
            (read, write.saturating_add(entry.value))
        } else {
            (read, write)
        }
    })
}

/// Derive a sample from a raw record.
///
/// `previous` is the CPU counters of the last sample seen on the same
/// subscription. Without it the record's own `precpu_stats` are used.
pub fn derive_sample(
    container_id: &str,
    container_name: &str,
    raw: &RawStats,
    previous: Option<&CpuStats>,
    timestamp: DateTime<Utc>,
) -> TelemetrySample {
    let baseline = previous.unwrap_or(&raw.precpu_stats);
    let memory_usage = raw.memory_stats.usage.unwrap_or(0);
    let memory_limit = raw.memory_stats.limit.unwrap_or(0);
    let (network_rx, network_tx) = network_totals(raw.networks.as_ref());
    let (block_read, block_write) = block_io_totals(&raw.blkio_stats);

    TelemetrySample {
        container_id: container_id.to_string(),
        container_name: container_name.trim_start_matches('/').to_string(),
        cpu_percent: cpu_percent(&raw.cpu_stats, baseline),
        memory_usage,
        memory_limit,
        memory_percent: memory_percent(memory_usage, memory_limit),
        network_rx,
        network_tx,
        block_read,
        block_write,
        pids: raw.pids_stats.current.unwrap_or(0),
        timestamp,
    }
}
