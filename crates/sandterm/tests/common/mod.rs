//! Test utilities and common setup.
#![allow(dead_code, clippy::field_reassign_with_default)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::StreamExt;
use sandterm::clock::ManualClock;
use sandterm::container::{
    ContainerError, ContainerFilter, ContainerRecord, ContainerResult, ContainerRuntimeApi,
    ContainerSpec, ContainerState, ExecInput, ExecStream, LABEL_ENVIRONMENT, LABEL_MANAGED,
    LABEL_SESSION, LABEL_USER, RawStats, StatsStream,
};
use sandterm::engine::{Engine, EngineConfig};
use sandterm::pty::{BridgeEvent, EventSender};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Notify, mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::io::ReaderStream;

/// Failures the fake runtime injects on demand.
#[derive(Debug, Default, Clone)]
pub struct Failures {
    pub create_volume: bool,
    pub create_container: bool,
    pub start_container: bool,
    pub stop_container: bool,
    pub create_exec: bool,
    pub resize_exec: bool,
    pub list_containers: bool,
    /// Fail listings that select by name (service containers) only.
    pub list_by_name: bool,
    /// Per-container delay before a stop call takes effect.
    pub stop_delays: HashMap<String, Duration>,
    /// Listings snapshot the containers, then wait for this before returning.
    pub list_gate: Option<Arc<Notify>>,
}

#[derive(Debug)]
pub struct FakeContainer {
    pub record: ContainerRecord,
    pub spec: Option<ContainerSpec>,
}

struct FakeExec {
    container_id: String,
    command: Vec<String>,
    close: Option<oneshot::Sender<()>>,
}

/// Everything the fake runtime has seen, for assertions.
#[derive(Default)]
pub struct FakeState {
    pub volumes: HashMap<String, HashMap<String, String>>,
    pub containers: HashMap<String, FakeContainer>,
    pub removed: Vec<String>,
    pub stopped: Vec<String>,
    pub resizes: Vec<(String, u16, u16)>,
    pub list_calls: usize,
    pub volume_create_calls: usize,
    pub failures: Failures,
    execs: HashMap<String, FakeExec>,
    stats: HashMap<String, Vec<mpsc::UnboundedSender<ContainerResult<RawStats>>>>,
}

/// In-memory container runtime.
///
/// Exec instances run an echo "shell": bytes written to the input come back
/// on the output. Stopping a container closes its exec and stats streams.
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
    next_id: AtomicU64,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn set_failures(&self, failures: Failures) {
        self.state().failures = failures;
    }

    fn next_id(&self, prefix: &str) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{prefix}{n:060x}")
    }

    /// Add a container as if another process had created it.
    pub fn insert_container(&self, name: &str, labels: &[(&str, &str)]) -> String {
        let id = self.next_id("c0de");
        let record = ContainerRecord {
            id: id.clone(),
            name: format!("/{name}"),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            state: ContainerState::Running,
        };
        self.state()
            .containers
            .insert(id.clone(), FakeContainer { record, spec: None });
        id
    }

    /// Add a leftover sandbox for a session nobody tracks.
    pub fn insert_orphan(&self, session_id: &str, user_id: &str) -> String {
        self.insert_container(
            &format!("sandterm-{session_id}"),
            &[
                (LABEL_MANAGED, "true"),
                (LABEL_USER, user_id),
                (LABEL_SESSION, session_id),
                (LABEL_ENVIRONMENT, "default"),
            ],
        )
    }

    /// Remove a container without going through stop.
    pub fn vanish(&self, container_id: &str) {
        let mut state = self.state();
        state.containers.remove(container_id);
        close_streams(&mut state, container_id);
    }

    pub fn is_running(&self, container_id: &str) -> bool {
        self.state()
            .containers
            .get(container_id)
            .is_some_and(|c| c.record.is_running())
    }

    pub fn container_count(&self) -> usize {
        self.state().containers.len()
    }

    pub fn spec(&self, container_id: &str) -> Option<ContainerSpec> {
        self.state()
            .containers
            .get(container_id)
            .and_then(|c| c.spec.clone())
    }

    pub fn exec_commands(&self, container_id: &str) -> Vec<Vec<String>> {
        self.state()
            .execs
            .values()
            .filter(|e| e.container_id == container_id)
            .map(|e| e.command.clone())
            .collect()
    }

    /// End the shell of one exec, as if it had exited.
    pub fn exit_exec(&self, exec_id: &str) -> bool {
        let close = self
            .state()
            .execs
            .get_mut(exec_id)
            .and_then(|e| e.close.take());
        close.is_some_and(|tx| tx.send(()).is_ok())
    }

    /// Send a raw sample to every stats stream of a container.
    pub fn push_stats(&self, container_id: &str, raw: RawStats) -> usize {
        let state = self.state();
        state
            .stats
            .get(container_id)
            .map(|senders| senders.iter().filter(|tx| tx.send(Ok(raw.clone())).is_ok()).count())
            .unwrap_or(0)
    }

    /// Break every stats stream of a container with an error.
    pub fn break_stats(&self, container_id: &str) {
        let mut state = self.state();
        if let Some(senders) = state.stats.remove(container_id) {
            for tx in senders {
                let _ = tx.send(Err(ContainerError::StreamClosed("stats".to_string())));
            }
        }
    }

    pub fn stats_subscribers(&self, container_id: &str) -> usize {
        self.state()
            .stats
            .get(container_id)
            .map(|senders| senders.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

fn close_streams(state: &mut FakeState, container_id: &str) {
    for exec in state.execs.values_mut() {
        if exec.container_id == container_id
            && let Some(close) = exec.close.take()
        {
            let _ = close.send(());
        }
    }
    state.stats.remove(container_id);
}

fn command_failed(command: &str) -> ContainerError {
    ContainerError::command(command, "injected failure")
}

#[async_trait]
impl ContainerRuntimeApi for FakeRuntime {
    async fn create_volume(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> ContainerResult<()> {
        // Yield so concurrent creators interleave.
        tokio::task::yield_now().await;
        let mut state = self.state();
        state.volume_create_calls += 1;
        if state.failures.create_volume {
            return Err(command_failed("volume create"));
        }
        if state.volumes.contains_key(name) {
            return Err(ContainerError::AlreadyExists(name.to_string()));
        }
        state.volumes.insert(name.to_string(), labels.clone());
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> ContainerResult<String> {
        tokio::task::yield_now().await;
        if self.state().failures.create_container {
            return Err(command_failed("create"));
        }
        let id = self.next_id("5a4d");
        let name = spec.name.clone().unwrap_or_else(|| id.clone());
        let record = ContainerRecord {
            id: id.clone(),
            name: format!("/{name}"),
            labels: spec.labels.clone(),
            state: ContainerState::Created,
        };
        self.state().containers.insert(
            id.clone(),
            FakeContainer {
                record,
                spec: Some(spec.clone()),
            },
        );
        Ok(id)
    }

    async fn start_container(&self, container_id: &str) -> ContainerResult<()> {
        let mut state = self.state();
        if state.failures.start_container {
            return Err(command_failed("start"));
        }
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| ContainerError::NotFound(container_id.to_string()))?;
        container.record.state = ContainerState::Running;
        Ok(())
    }

    async fn stop_container(
        &self,
        container_id: &str,
        _timeout_seconds: Option<u32>,
    ) -> ContainerResult<()> {
        let delay = self.state().failures.stop_delays.get(container_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if state.failures.stop_container {
            return Err(command_failed("stop"));
        }
        let auto_remove = match state.containers.get_mut(container_id) {
            Some(container) => {
                container.record.state = ContainerState::Exited;
                container.spec.as_ref().is_some_and(|s| s.auto_remove)
            }
            None => return Err(ContainerError::NotFound(container_id.to_string())),
        };
        if auto_remove {
            state.containers.remove(container_id);
        }
        state.stopped.push(container_id.to_string());
        close_streams(&mut state, container_id);
        Ok(())
    }

    async fn remove_container(&self, container_id: &str, _force: bool) -> ContainerResult<()> {
        let mut state = self.state();
        if state.containers.remove(container_id).is_none() {
            return Err(ContainerError::NotFound(container_id.to_string()));
        }
        state.removed.push(container_id.to_string());
        close_streams(&mut state, container_id);
        Ok(())
    }

    async fn list_containers(
        &self,
        filter: &ContainerFilter,
    ) -> ContainerResult<Vec<ContainerRecord>> {
        let (records, gate) = {
            let mut state = self.state();
            state.list_calls += 1;
            if state.failures.list_containers
                || (state.failures.list_by_name && !filter.names.is_empty())
            {
                return Err(command_failed("ps"));
            }
            let records: Vec<ContainerRecord> = state
                .containers
                .values()
                .map(|c| c.record.clone())
                .filter(|r| filter.matches(r))
                .collect();
            (records, state.failures.list_gate.clone())
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(records)
    }

    async fn create_exec(
        &self,
        container_id: &str,
        command: &[String],
        tty: bool,
    ) -> ContainerResult<String> {
        assert!(tty, "shells are always attached with a tty");
        let mut state = self.state();
        if state.failures.create_exec {
            return Err(command_failed("exec create"));
        }
        if !state
            .containers
            .get(container_id)
            .is_some_and(|c| c.record.is_running())
        {
            return Err(ContainerError::NotFound(container_id.to_string()));
        }
        let exec_id = self.next_id("e8ec");
        state.execs.insert(
            exec_id.clone(),
            FakeExec {
                container_id: container_id.to_string(),
                command: command.to_vec(),
                close: None,
            },
        );
        Ok(exec_id)
    }

    async fn attach_exec(&self, exec_id: &str) -> ContainerResult<ExecStream> {
        let (close_tx, mut close_rx) = oneshot::channel::<()>();
        {
            let mut state = self.state();
            let exec = state
                .execs
                .get_mut(exec_id)
                .ok_or_else(|| ContainerError::NotFound(exec_id.to_string()))?;
            exec.close = Some(close_tx);
        }

        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let (mut rd, mut wr) = tokio::io::split(server);
            let mut buf = [0u8; 1024];
            loop {
                tokio::select! {
                    _ = &mut close_rx => break,
                    n = rd.read(&mut buf) => match n {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if wr.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    },
                }
            }
        });

        let (client_rd, client_wr) = tokio::io::split(client);
        let output = ReaderStream::new(client_rd)
            .map(|chunk| chunk.map_err(ContainerError::from))
            .boxed();
        let input: ExecInput = Box::pin(client_wr);
        Ok(ExecStream { output, input })
    }

    async fn resize_exec(&self, exec_id: &str, rows: u16, cols: u16) -> ContainerResult<()> {
        let mut state = self.state();
        if state.failures.resize_exec {
            return Err(command_failed("exec resize"));
        }
        if !state.execs.contains_key(exec_id) {
            return Err(ContainerError::NotFound(exec_id.to_string()));
        }
        state.resizes.push((exec_id.to_string(), rows, cols));
        Ok(())
    }

    async fn stream_stats(&self, container_id: &str) -> ContainerResult<StatsStream> {
        let mut state = self.state();
        if !state.containers.contains_key(container_id) {
            return Err(ContainerError::NotFound(container_id.to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state
            .stats
            .entry(container_id.to_string())
            .or_default()
            .push(tx);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}

/// Engine configuration used by the tests: two environments, no discovery
/// caching and short grace periods.
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.sandbox.images = HashMap::from([
        ("default".to_string(), "sandterm/base:latest".to_string()),
        ("python".to_string(), "sandterm/python:3.12".to_string()),
    ]);
    config.sandbox.stop_grace_seconds = 1;
    config.sandbox.discovery_ttl = Duration::ZERO;
    config.reaper_interval = Duration::from_secs(3600);
    config
}

pub struct Harness {
    pub runtime: Arc<FakeRuntime>,
    pub clock: Arc<ManualClock>,
    pub engine: Arc<Engine>,
}

pub fn harness() -> Harness {
    harness_with(|_| {})
}

pub fn harness_with(configure: impl FnOnce(&mut EngineConfig)) -> Harness {
    let mut config = test_config();
    configure(&mut config);

    let runtime = Arc::new(FakeRuntime::new());
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap(),
    ));
    let engine = Arc::new(Engine::new(runtime.clone(), config, clock.clone()));
    Harness {
        runtime,
        clock,
        engine,
    }
}

pub fn events() -> (EventSender, mpsc::Receiver<BridgeEvent>) {
    mpsc::channel(64)
}

/// Collect output events until `expected` has been seen.
pub async fn read_until(rx: &mut mpsc::Receiver<BridgeEvent>, expected: &str) -> String {
    let mut seen = String::new();
    tokio::time::timeout(Duration::from_secs(2), async {
        while !seen.contains(expected) {
            match rx.recv().await {
                Some(BridgeEvent::Output(bytes)) => seen.push_str(&String::from_utf8_lossy(&bytes)),
                Some(BridgeEvent::Closed { reason }) => panic!("closed early: {reason}"),
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {expected:?}, saw {seen:?}"));
    seen
}

/// Wait for the next close event, skipping output.
pub async fn wait_closed(rx: &mut mpsc::Receiver<BridgeEvent>) -> String {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match rx.recv().await {
                Some(BridgeEvent::Closed { reason }) => return reason,
                Some(BridgeEvent::Output(_)) => continue,
                None => panic!("event channel closed without a close event"),
            }
        }
    })
    .await
    .expect("timed out waiting for close event")
}

/// Poll until `condition` holds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}
