//! Container runtime management module.
//!
//! Defines the runtime contract the orchestration core depends on and the
//! Docker Engine implementation used in production.

mod docker;
mod error;
mod stats;
mod types;

pub use docker::DockerRuntime;
pub use error::{ContainerError, ContainerResult};
pub use stats::{
    BlkioEntry, BlkioStats, CpuStats, CpuUsage, MemoryStats, NetworkStats, PidsStats, RawStats,
};
pub use types::{
    ContainerFilter, ContainerRecord, ContainerSpec, ContainerState, LABEL_ENVIRONMENT,
    LABEL_MANAGED, LABEL_SESSION, LABEL_USER, ResourceLimits, VolumeMount,
    validate_container_id_or_name, validate_container_name, validate_image_name,
};

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use tokio::io::AsyncWrite;

/// Output half of an attached exec: raw bytes in production order.
pub type ExecOutput = BoxStream<'static, ContainerResult<Bytes>>;

/// Input half of an attached exec.
pub type ExecInput = Pin<Box<dyn AsyncWrite + Send>>;

/// Stream of raw stats samples for one container.
pub type StatsStream = BoxStream<'static, ContainerResult<RawStats>>;

/// A duplex stream attached to an exec instance.
///
/// In TTY mode stdout and stderr arrive interleaved on `output`.
pub struct ExecStream {
    pub output: ExecOutput,
    pub input: ExecInput,
}

impl fmt::Debug for ExecStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecStream").finish_non_exhaustive()
    }
}

/// Container runtime abstraction.
///
/// Every method is a potentially slow network call; callers must not hold
/// registry locks across them.
#[async_trait]
pub trait ContainerRuntimeApi: Send + Sync {
    /// Create a named volume. Returns `AlreadyExists` if it is already there.
    async fn create_volume(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> ContainerResult<()>;

    /// Create a container and return its ID. Does not start it.
    async fn create_container(&self, spec: &ContainerSpec) -> ContainerResult<String>;

    async fn start_container(&self, container_id: &str) -> ContainerResult<()>;

    /// Stop a container, giving it `timeout_seconds` before it is killed.
    async fn stop_container(
        &self,
        container_id: &str,
        timeout_seconds: Option<u32>,
    ) -> ContainerResult<()>;

    async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()>;

    async fn list_containers(&self, filter: &ContainerFilter)
    -> ContainerResult<Vec<ContainerRecord>>;

    /// Create an exec instance inside a running container and return its ID.
    async fn create_exec(
        &self,
        container_id: &str,
        command: &[String],
        tty: bool,
    ) -> ContainerResult<String>;

    /// Start an exec instance and attach to its stdio.
    async fn attach_exec(&self, exec_id: &str) -> ContainerResult<ExecStream>;

    async fn resize_exec(&self, exec_id: &str, rows: u16, cols: u16) -> ContainerResult<()>;

    /// Open a long-lived stats subscription.
    async fn stream_stats(&self, container_id: &str) -> ContainerResult<StatsStream>;
}
