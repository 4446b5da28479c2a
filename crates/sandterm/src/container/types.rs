//! Container specs, runtime records and input validation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::error::{ContainerError, ContainerResult};

/// Label marking a container as managed by this service.
pub const LABEL_MANAGED: &str = "sandterm.managed";
/// Label carrying the owning user ID.
pub const LABEL_USER: &str = "sandterm.user";
/// Label carrying the owning session ID.
pub const LABEL_SESSION: &str = "sandterm.session";
/// Label carrying the environment name.
pub const LABEL_ENVIRONMENT: &str = "sandterm.environment";

/// A named volume mounted into a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Runtime volume name.
    pub volume: String,
    /// Absolute path inside the container.
    pub target: String,
}

/// Resource limits applied to a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory limit in bytes.
    pub memory_bytes: Option<i64>,
    /// CPU quota in units of 1e-9 CPUs.
    pub nano_cpus: Option<i64>,
    /// Maximum number of processes.
    pub pids_limit: Option<i64>,
}

/// Everything the runtime needs to create a container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    /// Container name.
    pub name: Option<String>,
    /// Hostname inside the container.
    pub hostname: Option<String>,
    /// Docker/OCI image to use.
    pub image: String,
    /// Command to run (image default when empty).
    pub command: Vec<String>,
    /// Environment variables.
    pub env: HashMap<String, String>,
    /// Labels for discovery.
    pub labels: HashMap<String, String>,
    /// Named volume mounts.
    pub volumes: Vec<VolumeMount>,
    /// Working directory inside the container.
    pub workdir: Option<String>,
    /// Allocate a pseudo-terminal.
    pub tty: bool,
    /// Keep stdin open.
    pub open_stdin: bool,
    /// Resource limits.
    pub limits: ResourceLimits,
    /// Network to attach to (e.g. "none" or an isolated bridge network).
    pub network_mode: Option<String>,
    /// Remove the container once it stops.
    pub auto_remove: bool,
}

impl ContainerSpec {
    /// Create a new spec with the given image.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    /// Validate all fields before handing the spec to the runtime.
    pub fn validate(&self) -> ContainerResult<()> {
        validate_image_name(&self.image)?;

        if let Some(ref name) = self.name {
            validate_container_name(name)?;
        }

        if let Some(ref hostname) = self.hostname {
            validate_hostname(hostname)?;
        }

        for key in self.env.keys() {
            validate_env_var_key(key)?;
        }

        for mount in &self.volumes {
            validate_container_name(&mount.volume)?;
            validate_container_path(&mount.target)?;
        }

        if let Some(ref workdir) = self.workdir {
            validate_container_path(workdir)?;
        }

        if let Some(memory) = self.limits.memory_bytes
            && memory <= 0
        {
            return Err(ContainerError::InvalidInput(
                "memory limit must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Set the container name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the container hostname.
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Set the command to run.
    pub fn command(mut self, cmd: Vec<String>) -> Self {
        self.command = cmd;
        self
    }

    /// Add an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Add a label.
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Mount a named volume.
    pub fn volume(mut self, volume: impl Into<String>, target: impl Into<String>) -> Self {
        self.volumes.push(VolumeMount {
            volume: volume.into(),
            target: target.into(),
        });
        self
    }

    /// Set the working directory.
    pub fn workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    /// Allocate a TTY and keep stdin open.
    pub fn interactive(mut self) -> Self {
        self.tty = true;
        self.open_stdin = true;
        self
    }

    /// Set resource limits.
    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Set the network mode.
    pub fn network_mode(mut self, mode: impl Into<String>) -> Self {
        self.network_mode = Some(mode.into());
        self
    }

    /// Remove the container when it stops.
    pub fn auto_remove(mut self, enabled: bool) -> Self {
        self.auto_remove = enabled;
        self
    }
}

/// Container state as reported by the runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    #[default]
    #[serde(other)]
    Unknown,
}

impl ContainerState {
    /// Parse the runtime's state string, mapping anything unexpected to `Unknown`.
    pub fn parse(state: &str) -> Self {
        match state.to_ascii_lowercase().as_str() {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "removing" => Self::Removing,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerState::Created => write!(f, "created"),
            ContainerState::Running => write!(f, "running"),
            ContainerState::Paused => write!(f, "paused"),
            ContainerState::Restarting => write!(f, "restarting"),
            ContainerState::Removing => write!(f, "removing"),
            ContainerState::Exited => write!(f, "exited"),
            ContainerState::Dead => write!(f, "dead"),
            ContainerState::Unknown => write!(f, "unknown"),
        }
    }
}

/// A container as observed through the runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub state: ContainerState,
}

impl ContainerRecord {
    /// Whether the runtime reports the container as running.
    pub fn is_running(&self) -> bool {
        self.state == ContainerState::Running
    }

    /// Owning user from the labels.
    pub fn user(&self) -> Option<&str> {
        self.labels.get(LABEL_USER).map(String::as_str)
    }

    /// Owning session from the labels.
    pub fn session_id(&self) -> Option<&str> {
        self.labels.get(LABEL_SESSION).map(String::as_str)
    }

    /// Environment name from the labels.
    pub fn environment(&self) -> Option<&str> {
        self.labels.get(LABEL_ENVIRONMENT).map(String::as_str)
    }

    /// Whether the container follows the sandbox labelling convention.
    pub fn is_sandbox(&self) -> bool {
        self.labels.get(LABEL_MANAGED).map(String::as_str) == Some("true")
            && self.session_id().is_some()
    }
}

/// Filter for `list_containers`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerFilter {
    /// `key=value` label pairs that must all match.
    pub labels: Vec<(String, String)>,
    /// Exact container names (any may match).
    pub names: Vec<String>,
    /// Include stopped containers.
    pub all: bool,
}

impl ContainerFilter {
    /// Every sandbox managed by this service.
    pub fn sandboxes() -> Self {
        Self {
            labels: vec![(LABEL_MANAGED.to_string(), "true".to_string())],
            names: Vec::new(),
            all: false,
        }
    }

    /// Containers with one of the given names.
    pub fn by_names(names: &[String]) -> Self {
        Self {
            labels: Vec::new(),
            names: names.to_vec(),
            all: false,
        }
    }

    /// Whether a record satisfies this filter.
    pub fn matches(&self, record: &ContainerRecord) -> bool {
        if !self.all && !record.is_running() {
            return false;
        }
        let labels_ok = self
            .labels
            .iter()
            .all(|(k, v)| record.labels.get(k) == Some(v));
        let names_ok = self.names.is_empty()
            || self
                .names
                .iter()
                .any(|n| n == record.name.trim_start_matches('/'));
        labels_ok && names_ok
    }
}

// ============================================================================
// Input Validation Functions
// ============================================================================

/// Validate a Docker/OCI image name.
///
/// Image names follow the pattern: `[registry/][namespace/]name[:tag][@digest]`
pub fn validate_image_name(image: &str) -> ContainerResult<()> {
    if image.is_empty() {
        return Err(ContainerError::InvalidInput(
            "image name cannot be empty".to_string(),
        ));
    }

    if image.len() > 256 {
        return Err(ContainerError::InvalidInput(
            "image name exceeds maximum length of 256 characters".to_string(),
        ));
    }

    let valid_chars = |c: char| {
        c.is_ascii_alphanumeric()
            || c == '.'
            || c == '-'
            || c == '_'
            || c == '/'
            || c == ':'
            || c == '@'
    };

    if !image.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "image name '{}' contains invalid characters",
            image
        )));
    }

    if image.contains("..") {
        return Err(ContainerError::InvalidInput(
            "image name cannot contain '..'".to_string(),
        ));
    }

    Ok(())
}

/// Validate a container or volume name.
///
/// Names must be alphanumeric with hyphens and underscores and must start
/// with an alphanumeric character or underscore.
pub fn validate_container_name(name: &str) -> ContainerResult<()> {
    let Some(first_char) = name.chars().next() else {
        return Err(ContainerError::InvalidInput(
            "container name cannot be empty".to_string(),
        ));
    };

    if name.len() > 128 {
        return Err(ContainerError::InvalidInput(
            "container name exceeds maximum length of 128 characters".to_string(),
        ));
    }

    if !first_char.is_ascii_alphanumeric() && first_char != '_' {
        return Err(ContainerError::InvalidInput(
            "container name must start with an alphanumeric character or underscore".to_string(),
        ));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if !name.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "container name '{}' contains invalid characters",
            name
        )));
    }

    Ok(())
}

/// Validate a container ID or name passed to a runtime call.
pub fn validate_container_id_or_name(id: &str) -> ContainerResult<()> {
    if id.is_empty() {
        return Err(ContainerError::InvalidInput(
            "container ID or name cannot be empty".to_string(),
        ));
    }

    if id.len() > 128 {
        return Err(ContainerError::InvalidInput(
            "container ID or name exceeds maximum length".to_string(),
        ));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if !id.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "container ID or name '{}' contains invalid characters",
            id
        )));
    }

    Ok(())
}

/// Validate a hostname (RFC 1123 labels).
fn validate_hostname(hostname: &str) -> ContainerResult<()> {
    if hostname.is_empty() || hostname.len() > 253 {
        return Err(ContainerError::InvalidInput(
            "hostname must be 1-253 characters".to_string(),
        ));
    }

    for label in hostname.split('.') {
        let (Some(first), Some(last)) = (label.chars().next(), label.chars().last()) else {
            return Err(ContainerError::InvalidInput(
                "hostname cannot have empty labels".to_string(),
            ));
        };

        if label.len() > 63 {
            return Err(ContainerError::InvalidInput(
                "hostname label exceeds maximum length of 63 characters".to_string(),
            ));
        }

        if !first.is_ascii_alphanumeric() || !last.is_ascii_alphanumeric() {
            return Err(ContainerError::InvalidInput(
                "hostname labels must start and end with alphanumeric characters".to_string(),
            ));
        }

        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(ContainerError::InvalidInput(format!(
                "hostname '{}' contains invalid characters",
                hostname
            )));
        }
    }

    Ok(())
}

/// Validate an environment variable key (POSIX style).
fn validate_env_var_key(key: &str) -> ContainerResult<()> {
    let Some(first_char) = key.chars().next() else {
        return Err(ContainerError::InvalidInput(
            "environment variable key cannot be empty".to_string(),
        ));
    };

    if !first_char.is_ascii_alphabetic() && first_char != '_' {
        return Err(ContainerError::InvalidInput(format!(
            "environment variable key '{}' must start with a letter or underscore",
            key
        )));
    }

    if !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ContainerError::InvalidInput(format!(
            "environment variable key '{}' contains invalid characters",
            key
        )));
    }

    Ok(())
}

/// Validate a container-internal path.
fn validate_container_path(path: &str) -> ContainerResult<()> {
    if !path.starts_with('/') {
        return Err(ContainerError::InvalidInput(format!(
            "container path '{}' must be absolute",
            path
        )));
    }

    if path.contains('\0') || path.contains(':') {
        return Err(ContainerError::InvalidInput(
            "container path cannot contain null bytes or ':'".to_string(),
        ));
    }

    Ok(())
}
