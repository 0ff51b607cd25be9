//! Test utilities and common setup.
//!
//! Fake tools are shell scripts run as `sh <script> <generated flags...>`, so
//! every test exercises the real process, framing and relay code.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use agent_relay::AppConfig;
use agent_relay::api::{AppState, create_router};
use agent_relay::auth::StaticWorkspaceResolver;
use agent_relay::config::ToolConfig;
use agent_relay::supervisor::{SessionSupervisor, TurnEvent, TurnEventKind, TurnRequest};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// Upper bound for any single wait in a test.
pub const WAIT: Duration = Duration::from_secs(10);

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A shell script standing in for the tool, plus a scratch project directory.
pub struct FakeTool {
    pub dir: TempDir,
    pub script: PathBuf,
}

impl FakeTool {
    pub fn new(body: &str) -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let script = dir.path().join("tool.sh");
        std::fs::write(&script, body).expect("write fake tool");
        Self { dir, script }
    }

    pub fn project(&self) -> &Path {
        self.dir.path()
    }

    /// Tool settings that run this script with short limits.
    pub fn config(&self) -> ToolConfig {
        ToolConfig {
            binary: "sh".to_string(),
            base_args: vec![self.script.display().to_string()],
            turn_timeout_secs: 10,
            kill_grace_secs: 1,
            drain_timeout_ms: 500,
            ..ToolConfig::default()
        }
    }
}

pub fn turn_request(id: &str, input: &str, work_dir: &Path) -> TurnRequest {
    TurnRequest {
        correlation_id: id.to_string(),
        input: input.to_string(),
        continuation: None,
        extra_dirs: Vec::new(),
        work_dir: work_dir.to_path_buf(),
    }
}

pub fn supervisor(tool: ToolConfig) -> (SessionSupervisor, mpsc::Receiver<TurnEvent>) {
    let (tx, rx) = mpsc::channel(256);
    let supervisor = SessionSupervisor::new(
        "test-conn",
        Arc::new(agent_relay::process::LocalToolRuntime),
        tool,
        tx,
    );
    (supervisor, rx)
}

/// Receive events up to and including the turn's `Finished` event.
pub async fn collect_turn(events: &mut mpsc::Receiver<TurnEvent>) -> Vec<TurnEvent> {
    let mut collected = Vec::new();
    loop {
        let event = tokio::time::timeout(WAIT, events.recv())
            .await
            .expect("turn did not finish in time")
            .expect("event channel closed");
        let finished = matches!(event.kind, TurnEventKind::Finished(_));
        collected.push(event);
        if finished {
            return collected;
        }
    }
}

pub async fn next_event(events: &mut mpsc::Receiver<TurnEvent>) -> TurnEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("no event in time")
        .expect("event channel closed")
}

pub fn test_state(tool: &FakeTool) -> AppState {
    let config = AppConfig {
        tool: tool.config(),
        ..AppConfig::default()
    };
    AppState::new(
        config,
        Arc::new(StaticWorkspaceResolver::new(tool.project().to_path_buf())),
        tool.project().join("attachments"),
    )
}

/// Serve the router on an ephemeral local port.
pub async fn spawn_server(state: AppState) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    let app = create_router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    addr
}

pub async fn connect(addr: SocketAddr) -> WsClient {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("connect websocket");
    ws
}

/// Connect and consume the `connection` greeting.
pub async fn connect_ready(addr: SocketAddr) -> (WsClient, String) {
    let mut ws = connect(addr).await;
    let greeting = next_message(&mut ws).await;
    assert_eq!(greeting["type"], "connection");
    let client_id = greeting["clientId"]
        .as_str()
        .expect("clientId")
        .to_string();
    (ws, client_id)
}

pub async fn send_json(ws: &mut WsClient, value: Value) {
    ws.send(Message::text(value.to_string()))
        .await
        .expect("send frame");
}

/// Next text frame as JSON, skipping control frames.
pub async fn next_message(ws: &mut WsClient) -> Value {
    loop {
        let frame = tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("no message in time")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).expect("server sent invalid JSON");
        }
    }
}

/// Read messages up to and including the next one of type `kind`.
pub async fn read_until(ws: &mut WsClient, kind: &str) -> Vec<Value> {
    let mut messages = Vec::new();
    loop {
        let message = next_message(ws).await;
        let done = message["type"] == kind;
        messages.push(message);
        if done {
            return messages;
        }
    }
}

/// Poll until `path` exists.
pub async fn wait_for_file(path: &Path) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if path.exists() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
