//! WebSocket handlers for terminal sessions and resource updates.

use std::sync::Arc;

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{AppState, UserIdentity};
use crate::pty::BridgeEvent;
use crate::session::SessionService;

use super::types::{ServerMessage, SessionRequest, Utf8Carry, decode};

/// Outbound messages buffered per connection.
const OUTBOUND_BUFFER: usize = 256;

/// Bridge events buffered per session.
const EVENT_BUFFER: usize = 256;

/// Terminal socket upgrade handler.
///
/// GET /api/ws/terminal
pub async fn terminal_ws_handler(
    State(state): State<AppState>,
    user: UserIdentity,
    ws: WebSocketUpgrade,
) -> Response {
    info!(user_id = %user.id(), "terminal socket upgrade");
    ws.on_upgrade(move |socket| handle_terminal_socket(socket, state, user.into_id()))
}

/// Resource socket upgrade handler.
///
/// GET /api/ws/resources
pub async fn resources_ws_handler(
    State(state): State<AppState>,
    user: UserIdentity,
    ws: WebSocketUpgrade,
) -> Response {
    info!(user_id = %user.id(), "resource socket upgrade");
    ws.on_upgrade(move |socket| handle_resources_socket(socket, state))
}

enum Inbound {
    Frame(Option<Result<Message, axum::Error>>),
    SessionEnded,
}

async fn wait_closed(rx: &mut Option<oneshot::Receiver<()>>) {
    match rx.as_mut() {
        Some(rx) => {
            let _ = rx.await;
        }
        None => std::future::pending().await,
    }
}

/// One terminal connection. At most one session per connection; closing
/// the socket closes the session.
async fn handle_terminal_socket(socket: WebSocket, state: AppState, user_id: String) {
    let sessions = state.engine.sessions().clone();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_BUFFER);

    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if ws_tx
                .send(Message::Text(message.to_json().into()))
                .await
                .is_err()
            {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let mut session_id: Option<String> = None;
    let mut pump: Option<JoinHandle<()>> = None;
    let mut ended: Option<oneshot::Receiver<()>> = None;

    loop {
        let inbound = tokio::select! {
            frame = ws_rx.next() => Inbound::Frame(frame),
            _ = wait_closed(&mut ended) => Inbound::SessionEnded,
        };

        let text = match inbound {
            Inbound::SessionEnded => break,
            Inbound::Frame(Some(Ok(Message::Text(text)))) => text,
            Inbound::Frame(Some(Ok(Message::Binary(_)))) => {
                let _ = out_tx
                    .send(ServerMessage::error("binary frames are not supported"))
                    .await;
                continue;
            }
            Inbound::Frame(Some(Ok(Message::Close(_)))) | Inbound::Frame(None) => break,
            Inbound::Frame(Some(Err(e))) => {
                debug!(user_id = %user_id, "terminal socket error: {}", e);
                break;
            }
            Inbound::Frame(Some(Ok(_))) => continue,
        };

        let request = match decode(text.as_str(), &state.limits) {
            Ok(request) => request,
            Err(e) => {
                let _ = out_tx.send(ServerMessage::from_session_error(&e)).await;
                continue;
            }
        };

        match request {
            SessionRequest::Create(request) => {
                if session_id.is_some() {
                    let _ = out_tx
                        .send(ServerMessage::error(
                            "a session already exists on this connection",
                        ))
                        .await;
                    continue;
                }

                let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
                match sessions.create_session(&user_id, request, events_tx).await {
                    Ok(session) => {
                        let _ = out_tx
                            .send(ServerMessage::SessionCreated {
                                session_id: session.session_id.clone(),
                            })
                            .await;
                        let (ended_tx, ended_rx) = oneshot::channel();
                        pump = Some(tokio::spawn(pump_output(
                            events_rx,
                            out_tx.clone(),
                            ended_tx,
                        )));
                        ended = Some(ended_rx);
                        session_id = Some(session.session_id);
                    }
                    Err(e) => {
                        warn!(user_id = %user_id, "session creation failed: {}", e);
                        let _ = out_tx.send(ServerMessage::from_session_error(&e)).await;
                    }
                }
            }
            SessionRequest::Input(data) => {
                let Some(id) = session_id.as_deref() else {
                    let _ = out_tx.send(ServerMessage::error("no active session")).await;
                    continue;
                };
                if !sessions.send_input(id, data.as_bytes()).await {
                    let _ = out_tx
                        .send(ServerMessage::error("session is not attached"))
                        .await;
                }
            }
            SessionRequest::Resize(size) => {
                let Some(id) = session_id.as_deref() else {
                    let _ = out_tx.send(ServerMessage::error("no active session")).await;
                    continue;
                };
                if !sessions.resize(id, size.cols, size.rows).await {
                    let _ = out_tx.send(ServerMessage::error("resize failed")).await;
                }
            }
            SessionRequest::Ping => {
                if let Some(id) = session_id.as_deref() {
                    sessions.keepalive(id);
                }
                let _ = out_tx.send(ServerMessage::Pong).await;
            }
        }
    }

    close_connection(&sessions, session_id, pump).await;
    drop(out_tx);
    let _ = writer.await;
}

async fn close_connection(
    sessions: &Arc<SessionService>,
    session_id: Option<String>,
    pump: Option<JoinHandle<()>>,
) {
    if let Some(id) = session_id {
        sessions.close_session(&id).await;
        info!(session_id = %id, "terminal connection closed");
    }
    if let Some(pump) = pump {
        // The pump exits on its own once the bridge drops the event sender.
        let _ = pump.await;
    }
}

/// Forward bridge events to the socket writer.
async fn pump_output(
    mut events: mpsc::Receiver<BridgeEvent>,
    out_tx: mpsc::Sender<ServerMessage>,
    ended: oneshot::Sender<()>,
) {
    let mut carry = Utf8Carry::new();

    while let Some(event) = events.recv().await {
        match event {
            BridgeEvent::Output(bytes) => {
                let data = carry.push(&bytes);
                if data.is_empty() {
                    continue;
                }
                if out_tx.send(ServerMessage::Output { data }).await.is_err() {
                    break;
                }
            }
            BridgeEvent::Closed { reason } => {
                let data = carry.finish();
                if !data.is_empty() {
                    let _ = out_tx.send(ServerMessage::Output { data }).await;
                }
                let _ = out_tx
                    .send(ServerMessage::error(format!("session ended: {reason}")))
                    .await;
                let _ = ended.send(());
                return;
            }
        }
    }
}

async fn handle_resources_socket(socket: WebSocket, state: AppState) {
    let telemetry = state.engine.telemetry().clone();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut subscription = telemetry.subscribe();

    let initial = Arc::new(telemetry.snapshot());
    let first = ServerMessage::ResourceUpdate {
        timestamp: initial.timestamp,
        data: initial,
    };
    if ws_tx
        .send(Message::Text(first.to_json().into()))
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            snapshot = subscription.recv() => {
                let Some(snapshot) = snapshot else { break };
                let message = ServerMessage::ResourceUpdate {
                    timestamp: snapshot.timestamp,
                    data: snapshot,
                };
                if ws_tx.send(Message::Text(message.to_json().into())).await.is_err() {
                    break;
                }
            }
            frame = ws_rx.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if matches!(decode(text.as_str(), &state.limits), Ok(SessionRequest::Ping))
                            && ws_tx
                                .send(Message::Text(ServerMessage::Pong.to_json().into()))
                                .await
                                .is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    subscription.unsubscribe();
    debug!("resource socket closed");
}
