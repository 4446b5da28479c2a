//! Application configuration.
//!
//! Layered as built-in defaults, then the TOML config file, then
//! `SANDTERM__*` environment variables.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use config::{Config, Environment, File, FileFormat};
use log::info;
use serde::{Deserialize, Serialize};

use crate::container::ResourceLimits;
use crate::engine::EngineConfig;
use crate::session::SandboxConfig;
use crate::telemetry::TelemetryConfig;
use crate::ws::RequestLimits;

pub const APP_NAME: &str = "sandterm";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub runtime: RuntimeConfig,
    pub sandbox: SandboxSection,
    pub sessions: SessionsConfig,
    pub telemetry: TelemetrySection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Allowed CORS origins. Empty allows any origin.
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8090,
            cors_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Docker socket path. Local defaults (DOCKER_HOST or the standard
    /// socket) when unset.
    pub socket: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    /// Image per environment name. The keys are the allowed environments.
    pub images: HashMap<String, String>,
    /// Shells a client may request.
    pub shells: Vec<String>,
    pub workdir: String,
    pub hostname: String,
    pub command: Vec<String>,
    pub memory_mb: u64,
    pub cpus: f64,
    pub pids_limit: i64,
    /// Network to attach sandboxes to. "none" disables networking.
    pub network_mode: Option<String>,
    pub stop_grace_seconds: u32,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            images: HashMap::from([(
                "default".to_string(),
                "sandterm-default:latest".to_string(),
            )]),
            shells: vec![
                "bash".to_string(),
                "zsh".to_string(),
                "sh".to_string(),
                "fish".to_string(),
            ],
            workdir: "/home/sandbox".to_string(),
            hostname: "sandbox".to_string(),
            command: Vec::new(),
            memory_mb: 512,
            cpus: 1.0,
            pids_limit: 256,
            network_mode: Some("none".to_string()),
            stop_grace_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    pub idle_timeout_seconds: u64,
    pub max_lifetime_hours: u64,
    pub max_per_user: usize,
    pub reaper_interval_seconds: u64,
    pub discovery_ttl_seconds: u64,
    /// Largest accepted input message payload.
    pub max_input_bytes: usize,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            idle_timeout_seconds: 30 * 60,
            max_lifetime_hours: 8,
            max_per_user: 5,
            reaper_interval_seconds: 300,
            discovery_ttl_seconds: 3,
            max_input_bytes: 10 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySection {
    pub reconcile_interval_seconds: u64,
    pub publish_interval_ms: u64,
    pub activity_window_seconds: u64,
    /// Names of the service's own containers to observe.
    pub service_containers: Vec<String>,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            reconcile_interval_seconds: 5,
            publish_interval_ms: 1000,
            activity_window_seconds: 60,
            service_containers: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Check values that would otherwise fail at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.sandbox.images.is_empty() {
            return Err(anyhow!("sandbox.images must name at least one environment"));
        }
        for (environment, image) in &self.sandbox.images {
            crate::container::validate_image_name(image)
                .with_context(|| format!("sandbox.images.{environment}"))?;
        }
        if self.sandbox.shells.is_empty() {
            return Err(anyhow!("sandbox.shells must not be empty"));
        }
        if self.sandbox.memory_mb == 0 {
            return Err(anyhow!("sandbox.memory_mb must be positive"));
        }
        if self.sandbox.cpus.is_nan() || self.sandbox.cpus <= 0.0 {
            return Err(anyhow!("sandbox.cpus must be positive"));
        }
        if self.sessions.max_per_user == 0 {
            return Err(anyhow!("sessions.max_per_user must be at least 1"));
        }
        if self.telemetry.publish_interval_ms == 0 || self.sessions.reaper_interval_seconds == 0 {
            return Err(anyhow!("intervals must be positive"));
        }
        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        let sandbox = &self.sandbox;
        let sessions = &self.sessions;
        let telemetry = &self.telemetry;

        EngineConfig {
            sandbox: SandboxConfig {
                images: sandbox.images.clone(),
                workdir: sandbox.workdir.clone(),
                hostname: sandbox.hostname.clone(),
                command: sandbox.command.clone(),
                limits: ResourceLimits {
                    memory_bytes: i64::try_from(sandbox.memory_mb.saturating_mul(1024 * 1024))
                        .ok(),
                    nano_cpus: Some((sandbox.cpus * 1e9) as i64),
                    pids_limit: Some(sandbox.pids_limit),
                },
                network_mode: sandbox.network_mode.clone().filter(|m| !m.is_empty()),
                stop_grace_seconds: sandbox.stop_grace_seconds,
                idle_timeout: Duration::from_secs(sessions.idle_timeout_seconds),
                max_lifetime: Duration::from_secs(sessions.max_lifetime_hours * 3600),
                max_sessions_per_user: sessions.max_per_user,
                discovery_ttl: Duration::from_secs(sessions.discovery_ttl_seconds),
            },
            telemetry: TelemetryConfig {
                reconcile_interval: Duration::from_secs(telemetry.reconcile_interval_seconds.max(1)),
                publish_interval: Duration::from_millis(telemetry.publish_interval_ms.max(1)),
                activity_window: Duration::from_secs(telemetry.activity_window_seconds),
                service_containers: telemetry.service_containers.clone(),
                ..TelemetryConfig::default()
            },
            reaper_interval: Duration::from_secs(sessions.reaper_interval_seconds.max(1)),
        }
    }

    /// Bounds applied to inbound transport messages.
    pub fn request_limits(&self) -> RequestLimits {
        let mut environments: Vec<String> = self.sandbox.images.keys().cloned().collect();
        environments.sort();
        RequestLimits {
            shells: self.sandbox.shells.clone(),
            environments,
            max_input_bytes: self.sessions.max_input_bytes,
        }
    }
}

/// Filesystem locations used by the binary.
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub config_file: PathBuf,
}

impl AppPaths {
    pub fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => {
                let expanded = expand_path(path)?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };

        if config_file.parent().is_none() {
            return Err(anyhow!("invalid config file path: {config_file:?}"));
        }

        Ok(Self { config_file })
    }
}

impl fmt::Display for AppPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "config: {}", self.config_file.display())
    }
}

/// Load the configuration, writing a default file first if none exists.
pub fn load_or_init_config(paths: &AppPaths, dry_run: bool) -> Result<AppConfig> {
    if !paths.config_file.exists() {
        if dry_run {
            info!(
                "dry-run: would create default config at {}",
                paths.config_file.display()
            );
        } else {
            write_default_config(&paths.config_file)?;
        }
    }

    let built = Config::builder()
        .set_default("logging.level", "info")?
        .set_default("server.host", "127.0.0.1")?
        .set_default("server.port", 8090_i64)?
        .add_source(
            File::from(paths.config_file.as_path())
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(
            Environment::with_prefix(env_prefix().as_str())
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("building configuration")?;

    let mut config: AppConfig = built
        .try_deserialize()
        .context("deserializing configuration")?;

    if let Some(ref file) = config.logging.file {
        let expanded = expand_str_path(file)?;
        config.logging.file = Some(expanded.display().to_string());
    }

    config.validate()?;
    Ok(config)
}

pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> String {
    format!(
        "# Configuration for {APP_NAME}\n# File: {}\n\n",
        path.display()
    )
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

pub fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn env_prefix() -> String {
    APP_NAME.to_ascii_uppercase()
}
