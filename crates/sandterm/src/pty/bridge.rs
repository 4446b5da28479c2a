//! Interactive shell attachment and byte relay.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::container::{
    ContainerRecord, ContainerResult, ContainerRuntimeApi, ExecInput, ExecOutput,
};
use crate::session::{SandboxManager, TerminalSize};

/// Events delivered to the transport for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// Raw bytes produced by the shell, in production order.
    Output(Bytes),
    /// The shell stream ended. The sandbox is being torn down.
    Closed { reason: String },
}

/// Sender half handed to the bridge by the transport.
pub type EventSender = mpsc::Sender<BridgeEvent>;

/// A freshly attached shell that is not yet bound to a session.
pub struct InteractiveStream {
    pub exec_id: String,
    pub output: ExecOutput,
    pub input: ExecInput,
}

impl std::fmt::Debug for InteractiveStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InteractiveStream")
            .field("exec_id", &self.exec_id)
            .finish_non_exhaustive()
    }
}

struct Attachment {
    exec_id: String,
    input: Arc<Mutex<ExecInput>>,
    relay: JoinHandle<()>,
    generation: u64,
}

/// Relays bytes between sessions and the shells running in their sandboxes.
pub struct PtyBridge {
    manager: Arc<SandboxManager>,
    attachments: Arc<DashMap<String, Attachment>>,
    generation: AtomicU64,
}

impl PtyBridge {
    pub fn new(manager: Arc<SandboxManager>) -> Self {
        Self {
            manager,
            attachments: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    fn runtime(&self) -> &Arc<dyn ContainerRuntimeApi> {
        self.manager.runtime()
    }

    /// Start a shell inside a running container and attach to it.
    ///
    /// A failed initial resize is logged; the terminal renders at the wrong
    /// size until the next resize.
    pub async fn attach(
        &self,
        container: &ContainerRecord,
        shell: &str,
        size: TerminalSize,
    ) -> ContainerResult<InteractiveStream> {
        let command = vec![shell.to_string(), "-l".to_string()];
        let exec_id = self
            .runtime()
            .create_exec(&container.id, &command, true)
            .await?;
        let stream = self.runtime().attach_exec(&exec_id).await?;

        if let Err(e) = self
            .runtime()
            .resize_exec(&exec_id, size.rows, size.cols)
            .await
        {
            warn!(
                "Initial resize of exec {} in {} failed: {}",
                exec_id, container.name, e
            );
        }

        debug!("Attached {} in {} as exec {}", shell, container.name, exec_id);
        Ok(InteractiveStream {
            exec_id,
            output: stream.output,
            input: stream.input,
        })
    }

    /// Bind an attached shell to a session and start relaying its output.
    ///
    /// When the output stream ends or fails the relay emits
    /// [`BridgeEvent::Closed`] and terminates the session's sandbox.
    pub fn bind(&self, session_id: &str, stream: InteractiveStream, events: EventSender) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (ready_tx, ready_rx) = oneshot::channel();

        let relay = tokio::spawn(relay_output(RelayTask {
            session_id: session_id.to_string(),
            output: stream.output,
            events,
            ready: ready_rx,
            attachments: self.attachments.clone(),
            manager: self.manager.clone(),
            generation,
        }));

        let attachment = Attachment {
            exec_id: stream.exec_id,
            input: Arc::new(Mutex::new(stream.input)),
            relay,
            generation,
        };
        if let Some(previous) = self.attachments.insert(session_id.to_string(), attachment) {
            warn!(
                "Session {} rebound, dropping exec {}",
                session_id, previous.exec_id
            );
            previous.relay.abort();
        }

        // The relay only starts once its handle is registered.
        let _ = ready_tx.send(());
    }

    /// Forward raw bytes to the session's shell.
    ///
    /// Returns false if the session has no open stream or the write fails.
    pub async fn write(&self, session_id: &str, data: &[u8]) -> bool {
        let Some(input) = self
            .attachments
            .get(session_id)
            .map(|a| a.input.clone())
        else {
            return false;
        };

        let mut input = input.lock().await;
        let result = async {
            input.write_all(data).await?;
            input.flush().await
        }
        .await;

        match result {
            Ok(()) => true,
            Err(e) => {
                debug!("Write to session {} failed: {}", session_id, e);
                false
            }
        }
    }

    /// Resize the session's terminal.
    ///
    /// Uses the exec recorded on the session at attach time. Returns false if
    /// the session has no exec yet or the runtime rejects the resize.
    pub async fn resize(&self, session_id: &str, size: TerminalSize) -> bool {
        let registry = self.manager.registry();
        let Some(exec_id) = registry.get(session_id).and_then(|s| s.exec_id) else {
            debug!("Resize for session {} without an exec", session_id);
            return false;
        };

        let size = TerminalSize::clamped(size.cols, size.rows);
        match self.runtime().resize_exec(&exec_id, size.rows, size.cols).await {
            Ok(()) => registry.update_dimensions(session_id, size, self.manager.clock().now()),
            Err(e) => {
                warn!("Resize of session {} failed: {}", session_id, e);
                false
            }
        }
    }

    /// Close the session's stream. The container is left running.
    ///
    /// Returns false if nothing was attached.
    pub async fn end(&self, session_id: &str) -> bool {
        let Some((_, attachment)) = self.attachments.remove(session_id) else {
            return false;
        };

        attachment.relay.abort();
        let mut input = attachment.input.lock().await;
        if let Err(e) = input.shutdown().await {
            debug!("Closing input of session {}: {}", session_id, e);
        }
        debug!("Detached session {} (exec {})", session_id, attachment.exec_id);
        true
    }

    pub fn is_attached(&self, session_id: &str) -> bool {
        self.attachments.contains_key(session_id)
    }

    /// Number of live attachments.
    pub fn attached_count(&self) -> usize {
        self.attachments.len()
    }
}

struct RelayTask {
    session_id: String,
    output: ExecOutput,
    events: EventSender,
    ready: oneshot::Receiver<()>,
    attachments: Arc<DashMap<String, Attachment>>,
    manager: Arc<SandboxManager>,
    generation: u64,
}

async fn relay_output(task: RelayTask) {
    let RelayTask {
        session_id,
        mut output,
        events,
        ready,
        attachments,
        manager,
        generation,
    } = task;

    if ready.await.is_err() {
        return;
    }

    let reason = loop {
        match output.next().await {
            Some(Ok(chunk)) => {
                if chunk.is_empty() {
                    continue;
                }
                if events.send(BridgeEvent::Output(chunk)).await.is_err() {
                    break "client disconnected".to_string();
                }
            }
            Some(Err(e)) => break format!("stream error: {e}"),
            None => break "shell exited".to_string(),
        }
    };

    attachments.remove_if(&session_id, |_, a| a.generation == generation);
    info!("Session {} stream closed: {}", session_id, reason);

    let _ = events.send(BridgeEvent::Closed { reason }).await;

    manager.terminate_sandbox(&session_id).await;
}
