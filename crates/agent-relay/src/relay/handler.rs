//! WebSocket handler for chat connections.
//!
//! Each socket gets one task that owns the connection's supervisor and
//! forwarder. It multiplexes inbound client frames, turn events and server
//! shutdown; a second task writes outbound messages and keepalive pings.

use std::path::PathBuf;
use std::time::Duration;

use agent_relay_protocol::{
    ClientMessage, Envelope, ImageAttachment, ServerMessage, StatusData,
};
use axum::{
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::Deserialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::api::{ApiError, ApiResult, AppState};
use crate::attachments;
use crate::auth::WorkspaceContext;
use crate::error::TurnError;
use crate::supervisor::{CancelOutcome, SessionSupervisor, TurnEvent, TurnRequest};

use super::forward::TurnForwarder;

/// Ping interval for keepalive.
const PING_INTERVAL_SECS: u64 = 30;

/// Size of the per-connection send buffer.
const OUTBOUND_BUFFER_SIZE: usize = 256;

/// Size of the per-connection turn event buffer.
const TURN_EVENT_BUFFER_SIZE: usize = 256;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// WebSocket upgrade handler.
///
/// GET /ws
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    if state.shutdown.is_cancelled() {
        return Err(ApiError::ShuttingDown);
    }

    let workspace = state.resolver.resolve(query.token.as_deref()).await?;
    info!("WebSocket upgrade request from user {}", workspace.user_id);

    Ok(ws.on_upgrade(move |socket| handle_connection(socket, state, workspace)))
}

/// Handle a WebSocket connection until the client leaves or the server stops.
async fn handle_connection(socket: WebSocket, state: AppState, workspace: WorkspaceContext) {
    let client_id = nanoid::nanoid!();
    let (mut sender, mut receiver) = socket.split();

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_BUFFER_SIZE);
    let (turn_tx, mut turn_rx) = mpsc::channel::<TurnEvent>(TURN_EVENT_BUFFER_SIZE);

    let supervisor = SessionSupervisor::new(
        client_id.clone(),
        state.runtime.clone(),
        state.config.tool.clone(),
        turn_tx,
    );
    let registration = state.registry.register(supervisor.clone());
    info!(
        "Client {} connected (user {})",
        client_id, workspace.user_id
    );

    // Spawn task to send events to client
    let client_id_send = client_id.clone();
    let send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(Duration::from_secs(PING_INTERVAL_SECS));
        // The first tick completes immediately.
        ping_interval.tick().await;

        loop {
            tokio::select! {
                message = outbound_rx.recv() => {
                    let Some(message) = message else { break };
                    let json = match Envelope::now(message).to_json() {
                        Ok(json) => json,
                        Err(e) => {
                            warn!("Failed to serialize message for {}: {}", client_id_send, e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }

                _ = ping_interval.tick() => {
                    if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut connection = Connection {
        attachments_dir: state.attachments_root.join(&client_id),
        forwarder: TurnForwarder::new(state.config.tool.stderr_debug_marker.clone()),
        client_id,
        state,
        workspace,
        supervisor,
        outbound: outbound_tx,
    };

    connection
        .send(ServerMessage::Connection {
            status: "connected".to_string(),
            client_id: connection.client_id.clone(),
            message: Some("Connected to agent relay".to_string()),
        })
        .await;

    let shutdown = connection.state.shutdown.clone();
    loop {
        tokio::select! {
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => connection.handle_text(text.as_str()).await,
                Some(Ok(Message::Binary(_))) => {
                    debug!("Received binary message from {}, ignoring", connection.client_id);
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => {
                    info!("Client {} closed the connection", connection.client_id);
                    break;
                }
                Some(Err(e)) => {
                    warn!("WebSocket error for {}: {}", connection.client_id, e);
                    break;
                }
            },

            Some(event) = turn_rx.recv() => {
                if let Some(message) = connection.forwarder.forward(event) {
                    connection.send(message).await;
                }
            }

            _ = shutdown.cancelled() => {
                info!("Server shutting down, closing {}", connection.client_id);
                break;
            }
        }
    }

    // Clean up
    send_task.abort();
    drop(turn_rx);
    connection.supervisor.shutdown();

    let tool = &connection.state.config.tool;
    let bound = tool.teardown_bound(Duration::from_secs(1));
    if tokio::time::timeout(bound, connection.supervisor.wait_idle())
        .await
        .is_err()
    {
        error!(
            "Turn for {} still running {:?} after disconnect",
            connection.client_id, bound
        );
    }

    attachments::remove_dir(&connection.attachments_dir).await;
    drop(registration);
    info!("Connection {} closed", connection.client_id);
}

/// State owned by one connection task.
struct Connection {
    client_id: String,
    state: AppState,
    workspace: WorkspaceContext,
    supervisor: SessionSupervisor,
    forwarder: TurnForwarder,
    outbound: mpsc::Sender<ServerMessage>,
    attachments_dir: PathBuf,
}

impl Connection {
    async fn send(&self, message: ServerMessage) {
        if self.outbound.send(message).await.is_err() {
            debug!("Send task for {} has stopped", self.client_id);
        }
    }

    async fn handle_text(&mut self, text: &str) {
        match ClientMessage::parse(text) {
            Ok(ClientMessage::Chat {
                message_id,
                content,
                images,
                session_id,
            }) => {
                self.handle_chat(message_id, content, images.unwrap_or_default(), session_id)
                    .await
            }
            Ok(ClientMessage::Interrupt) => self.handle_interrupt().await,
            Ok(ClientMessage::Command { command, .. }) => self.handle_command(&command).await,
            Err(e) => {
                warn!("Failed to parse message from {}: {}", self.client_id, e);
                self.send(ServerMessage::error(e.to_string())).await;
            }
        }
    }

    async fn handle_chat(
        &mut self,
        message_id: Option<String>,
        content: String,
        images: Vec<ImageAttachment>,
        session_id: Option<String>,
    ) {
        if self.supervisor.is_active() {
            self.send(ServerMessage::error(
                "A response is already in progress. Stop it before sending another message.",
            ))
            .await;
            return;
        }

        self.send(ServerMessage::ChatReceived { message_id }).await;

        let (input, extra_dirs) = if images.is_empty() {
            (content, Vec::new())
        } else {
            match attachments::save_images(&self.attachments_dir, &images).await {
                Ok(paths) => (
                    attachments::prompt_with_images(&content, &paths),
                    vec![self.attachments_dir.clone()],
                ),
                Err(e) => {
                    warn!("Failed to save images for {}: {}", self.client_id, e);
                    self.send(ServerMessage::error(format!("Error: {e}"))).await;
                    return;
                }
            }
        };

        // An explicit session id from the client wins over the remembered one.
        let continuation = session_id
            .filter(|id| !id.is_empty())
            .or_else(|| self.forwarder.continuation().map(str::to_string));

        let request = TurnRequest {
            correlation_id: format!("msg_{}", Uuid::new_v4().simple()),
            input,
            continuation,
            extra_dirs,
            work_dir: self.workspace.project_path.clone(),
        };

        match self.supervisor.start(request).await {
            Ok(handle) => {
                debug!(
                    "Client {} turn {} running as pid {:?}",
                    self.client_id, handle.correlation_id, handle.pid
                );
                self.forwarder.begin_turn(&handle.correlation_id);
            }
            Err(TurnError::SessionBusy { active }) => {
                debug!("Client {} busy with {}", self.client_id, active);
                self.send(ServerMessage::error(
                    "A response is already in progress. Stop it before sending another message.",
                ))
                .await;
            }
            Err(e) => {
                warn!("Failed to start turn for {}: {}", self.client_id, e);
                self.send(ServerMessage::error(e.user_message())).await;
            }
        }
    }

    async fn handle_interrupt(&self) {
        match self.supervisor.cancel().await {
            CancelOutcome::Cancelled { correlation_id } => {
                info!("Client {} interrupted {}", self.client_id, correlation_id);
                self.send(ServerMessage::InterruptConfirmed {
                    message: "Process interrupted".to_string(),
                })
                .await;
            }
            CancelOutcome::Idle => {
                self.send(ServerMessage::error("No active process to interrupt"))
                    .await;
            }
        }
    }

    async fn handle_command(&mut self, command: &str) {
        let response = match command {
            "status" => ServerMessage::CommandResponse {
                command: command.to_string(),
                status: None,
                data: Some(StatusData {
                    connected: true,
                    claude_active: self.supervisor.is_active(),
                    client_id: self.client_id.clone(),
                    session_id: self.forwarder.continuation().map(str::to_string),
                }),
            },
            "clear" => {
                self.forwarder.clear_continuation();
                success(command)
            }
            "reset" => {
                self.supervisor.cancel().await;
                self.forwarder.clear_continuation();
                success(command)
            }
            other => ServerMessage::error(format!("Unknown command: {other}")),
        };
        self.send(response).await;
    }
}

fn success(command: &str) -> ServerMessage {
    ServerMessage::CommandResponse {
        command: command.to_string(),
        status: Some("success".to_string()),
        data: None,
    }
}
