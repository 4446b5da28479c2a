//! Raw stats records as produced by the container runtime's streaming stats API.
//!
//! Field names follow the Docker Engine JSON so that records can be decoded
//! straight from the wire or converted from client library types.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One raw sample from a streaming stats subscription.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawStats {
    /// Sample timestamp (RFC 3339) as reported by the runtime.
    #[serde(default)]
    pub read: Option<String>,
    #[serde(default)]
    pub cpu_stats: CpuStats,
    #[serde(default)]
    pub precpu_stats: CpuStats,
    #[serde(default)]
    pub memory_stats: MemoryStats,
    #[serde(default)]
    pub networks: Option<HashMap<String, NetworkStats>>,
    #[serde(default)]
    pub blkio_stats: BlkioStats,
    #[serde(default)]
    pub pids_stats: PidsStats,
}

/// Cumulative CPU counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuStats {
    #[serde(default)]
    pub cpu_usage: CpuUsage,
    /// Cumulative host CPU time in nanoseconds.
    #[serde(default)]
    pub system_cpu_usage: Option<u64>,
    #[serde(default)]
    pub online_cpus: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuUsage {
    /// Cumulative container CPU time in nanoseconds.
    #[serde(default)]
    pub total_usage: u64,
    #[serde(default)]
    pub percpu_usage: Option<Vec<u64>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    #[serde(default)]
    pub usage: Option<u64>,
    #[serde(default)]
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkStats {
    #[serde(default)]
    pub rx_bytes: u64,
    #[serde(default)]
    pub tx_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlkioStats {
    #[serde(default)]
    pub io_service_bytes_recursive: Option<Vec<BlkioEntry>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlkioEntry {
    #[serde(default)]
    pub op: String,
    #[serde(default)]
    pub value: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PidsStats {
    #[serde(default)]
    pub current: Option<u64>,
}

impl CpuStats {
    /// Number of CPUs usable by the container.
    ///
    /// Older runtimes omit `online_cpus`; the per-CPU vector length is the
    /// documented fallback.
    pub fn cpu_count(&self) -> u64 {
        match self.online_cpus {
            Some(n) if n > 0 => n,
            _ => self
                .cpu_usage
                .percpu_usage
                .as_ref()
                .map(|v| v.len() as u64)
                .filter(|n| *n > 0)
                .unwrap_or(1),
        }
    }
}
