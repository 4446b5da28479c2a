//! Docker Engine implementation of the runtime contract, via bollard.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions, StatsOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults};
use bollard::models::HostConfig;
use bollard::volume::CreateVolumeOptions;
use bollard::{API_DEFAULT_VERSION, Docker};
use futures::StreamExt;
use log::debug;

use super::error::{ContainerError, ContainerResult};
use super::stats::RawStats;
use super::types::{
    ContainerFilter, ContainerRecord, ContainerSpec, ContainerState,
    validate_container_id_or_name,
};
use super::{ContainerRuntimeApi, ExecStream, StatsStream};

/// Seconds before an Engine API request times out.
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Runtime client talking to the Docker Engine API.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the engine.
    ///
    /// With no explicit socket the client honours `DOCKER_HOST` and falls back
    /// to the platform default socket.
    pub fn connect(socket: Option<&str>) -> ContainerResult<Self> {
        let docker = match socket {
            Some(path) => {
                Docker::connect_with_socket(path, REQUEST_TIMEOUT_SECS, &API_DEFAULT_VERSION)
            }
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(|e| ContainerError::command("connect", e))?;
        Ok(Self { docker })
    }

    /// Check that the engine answers and return its version string.
    pub async fn health_check(&self) -> ContainerResult<String> {
        let version = self
            .docker
            .version()
            .await
            .map_err(|e| map_bollard_error("version", e))?;
        Ok(version.version.unwrap_or_default())
    }
}

/// Map an engine error onto the runtime error taxonomy.
fn map_bollard_error(command: &str, err: BollardError) -> ContainerError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => ContainerError::NotFound(message),
        BollardError::DockerResponseServerError {
            status_code: 409,
            message,
        } => ContainerError::AlreadyExists(message),
        other => ContainerError::command(command, other),
    }
}

fn host_config(spec: &ContainerSpec) -> HostConfig {
    let binds: Vec<String> = spec
        .volumes
        .iter()
        .map(|m| format!("{}:{}:rw", m.volume, m.target))
        .collect();

    HostConfig {
        binds: (!binds.is_empty()).then_some(binds),
        memory: spec.limits.memory_bytes,
        // Disallow swap beyond the memory limit.
        memory_swap: spec.limits.memory_bytes,
        nano_cpus: spec.limits.nano_cpus,
        pids_limit: spec.limits.pids_limit,
        network_mode: spec.network_mode.clone(),
        auto_remove: Some(spec.auto_remove),
        cap_drop: Some(vec!["NET_RAW".to_string(), "SYS_ADMIN".to_string()]),
        security_opt: Some(vec!["no-new-privileges".to_string()]),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerRuntimeApi for DockerRuntime {
    async fn create_volume(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> ContainerResult<()> {
        let options = CreateVolumeOptions {
            name: name.to_string(),
            labels: labels.clone(),
            ..Default::default()
        };
        self.docker
            .create_volume(options)
            .await
            .map_err(|e| map_bollard_error("volume create", e))?;
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> ContainerResult<String> {
        spec.validate()?;

        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let config = Config {
            image: Some(spec.image.clone()),
            hostname: spec.hostname.clone(),
            cmd: (!spec.command.is_empty()).then(|| spec.command.clone()),
            env: Some(env),
            labels: Some(spec.labels.clone()),
            working_dir: spec.workdir.clone(),
            tty: Some(spec.tty),
            open_stdin: Some(spec.open_stdin),
            attach_stdin: Some(spec.open_stdin),
            host_config: Some(host_config(spec)),
            ..Default::default()
        };
        let options = spec.name.clone().map(|name| CreateContainerOptions {
            name,
            platform: None,
        });

        let response = self
            .docker
            .create_container(options, config)
            .await
            .map_err(|e| map_bollard_error("create", e))?;
        for warning in &response.warnings {
            debug!("create {}: {}", response.id, warning);
        }
        Ok(response.id)
    }

    async fn start_container(&self, container_id: &str) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| map_bollard_error("start", e))
    }

    async fn stop_container(
        &self,
        container_id: &str,
        timeout_seconds: Option<u32>,
    ) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;
        let options = timeout_seconds.map(|t| StopContainerOptions { t: i64::from(t) });
        self.docker
            .stop_container(container_id, options)
            .await
            .map_err(|e| map_bollard_error("stop", e))
    }

    async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        self.docker
            .remove_container(container_id, Some(options))
            .await
            .map_err(|e| map_bollard_error("rm", e))
    }

    async fn list_containers(
        &self,
        filter: &ContainerFilter,
    ) -> ContainerResult<Vec<ContainerRecord>> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        if !filter.labels.is_empty() {
            filters.insert(
                "label".to_string(),
                filter
                    .labels
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect(),
            );
        }
        if !filter.names.is_empty() {
            filters.insert("name".to_string(), filter.names.clone());
        }

        let options = ListContainersOptions::<String> {
            all: filter.all,
            filters,
            ..Default::default()
        };
        let summaries = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| map_bollard_error("ps", e))?;

        // The engine's name filter is a substring match; apply exact matching here.
        let records = summaries
            .into_iter()
            .filter_map(|summary| {
                let id = summary.id?;
                let name = summary
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_else(|| id.clone());
                let state = summary
                    .state
                    .map(|s| ContainerState::parse(&s.to_string()))
                    .unwrap_or_default();
                Some(ContainerRecord {
                    id,
                    name,
                    labels: summary.labels.unwrap_or_default(),
                    state,
                })
            })
            .filter(|record| filter.matches(record))
            .collect();

        Ok(records)
    }

    async fn create_exec(
        &self,
        container_id: &str,
        command: &[String],
        tty: bool,
    ) -> ContainerResult<String> {
        validate_container_id_or_name(container_id)?;
        let options = CreateExecOptions::<String> {
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(tty),
            cmd: Some(command.to_vec()),
            ..Default::default()
        };
        let exec = self
            .docker
            .create_exec(container_id, options)
            .await
            .map_err(|e| map_bollard_error("exec create", e))?;
        Ok(exec.id)
    }

    async fn attach_exec(&self, exec_id: &str) -> ContainerResult<ExecStream> {
        let options = StartExecOptions {
            detach: false,
            tty: true,
            ..Default::default()
        };
        let started = self
            .docker
            .start_exec(exec_id, Some(options))
            .await
            .map_err(|e| map_bollard_error("exec start", e))?;

        match started {
            StartExecResults::Attached { output, input } => {
                let output = output
                    .map(|chunk| {
                        chunk
                            .map(|log| log.into_bytes())
                            .map_err(|e| ContainerError::StreamClosed(e.to_string()))
                    })
                    .boxed();
                Ok(ExecStream { output, input })
            }
            StartExecResults::Detached => Err(ContainerError::StreamClosed(format!(
                "exec {exec_id} started detached"
            ))),
        }
    }

    async fn resize_exec(&self, exec_id: &str, rows: u16, cols: u16) -> ContainerResult<()> {
        self.docker
            .resize_exec(
                exec_id,
                ResizeExecOptions {
                    height: rows,
                    width: cols,
                },
            )
            .await
            .map_err(|e| map_bollard_error("exec resize", e))
    }

    async fn stream_stats(&self, container_id: &str) -> ContainerResult<StatsStream> {
        validate_container_id_or_name(container_id)?;
        let options = StatsOptions {
            stream: true,
            one_shot: false,
        };
        let stream = self
            .docker
            .stats(container_id, Some(options))
            .map(|item| {
                let stats = item.map_err(|e| ContainerError::StreamClosed(e.to_string()))?;
                // Round-trip through the engine JSON shape so decoding does not
                // depend on the client library's struct layout.
                let value = serde_json::to_value(&stats)
                    .map_err(|e| ContainerError::ParseError(e.to_string()))?;
                serde_json::from_value::<RawStats>(value)
                    .map_err(|e| ContainerError::ParseError(e.to_string()))
            })
            .boxed();
        Ok(stream)
    }
}
