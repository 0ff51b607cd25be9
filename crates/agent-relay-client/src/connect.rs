//! One chat turn over a relay WebSocket.

use std::io::Write;
use std::path::{Path, PathBuf};

use agent_relay_protocol::{ClientMessage, Envelope, ImageAttachment, ServerMessage};
use anyhow::{Context, Result, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::Serialize;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::render::TerminalRenderer;
use crate::transcript::{Applied, Transcript};

/// Options for a single chat turn.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    /// WebSocket endpoint, e.g. `ws://localhost:3001/ws`.
    pub url: String,
    pub token: Option<String>,
    pub message: String,
    pub images: Vec<PathBuf>,
    /// Conversation to continue.
    pub session_id: Option<String>,
    pub show_thinking: bool,
    pub color: bool,
}

/// What happened during a turn.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
    pub client_id: Option<String>,
    /// Conversation id to pass as `--session` next time.
    pub session_id: Option<String>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub interrupted: bool,
    pub entries: usize,
}

/// Connect, send one message, render the reply until the turn ends.
///
/// The first Ctrl-C asks the relay to interrupt the turn; a second one
/// abandons the connection.
pub async fn run_chat<W: Write>(options: ChatOptions, out: &mut W) -> Result<ChatSummary> {
    let url = request_url(&options.url, options.token.as_deref());
    let (socket, _) = connect_async(url.as_str())
        .await
        .with_context(|| format!("connecting to {}", options.url))?;
    info!("Connected to {}", options.url);
    let (mut sink, mut stream) = socket.split();

    let images = load_images(&options.images).await?;
    let chat = ClientMessage::Chat {
        message_id: Some(chrono::Utc::now().timestamp_millis().to_string()),
        content: options.message.clone(),
        images: (!images.is_empty()).then_some(images),
        session_id: options.session_id.clone(),
    };
    sink.send(Message::text(chat.to_json()?))
        .await
        .context("sending chat message")?;

    let mut transcript = Transcript::new();
    let mut renderer = TerminalRenderer::new(options.show_thinking, options.color);
    let mut summary = ChatSummary::default();
    transcript.push_user(options.message.as_str());
    renderer.render(&transcript, out)?;

    let mut turn_started = false;
    let mut ctrl_c = Box::pin(tokio::signal::ctrl_c());

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let envelope = match Envelope::parse(text.as_str()) {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            warn!("Ignoring unreadable frame: {}", e);
                            continue;
                        }
                    };
                    if let Applied::Dropped(reason) = transcript.apply(&envelope.message) {
                        debug!("Dropped message: {}", reason);
                    }
                    renderer.render(&transcript, out)?;

                    match envelope.message {
                        ServerMessage::ClaudeComplete { exit_code, error, .. } => {
                            summary.exit_code = exit_code;
                            summary.error = error;
                            break;
                        }
                        ServerMessage::Error { message } if !turn_started => {
                            // Rejected before the tool ran; no completion will follow.
                            summary.error = Some(message);
                            break;
                        }
                        ServerMessage::InterruptConfirmed { .. } => summary.interrupted = true,
                        ServerMessage::ClaudeResponse { .. }
                        | ServerMessage::ClaudeOutput { .. }
                        | ServerMessage::ClaudeError { .. } => turn_started = true,
                        _ => {}
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    bail!("connection closed before the turn finished")
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e).context("reading from relay"),
            },

            _ = &mut ctrl_c => {
                if summary.interrupted {
                    bail!("aborted");
                }
                info!("Interrupting turn");
                summary.interrupted = true;
                sink.send(Message::text(ClientMessage::Interrupt.to_json()?))
                    .await
                    .context("sending interrupt")?;
                ctrl_c = Box::pin(tokio::signal::ctrl_c());
            }
        }
    }

    writeln!(out)?;
    if let Err(e) = sink.close().await {
        debug!("Error closing connection: {}", e);
    }

    summary.client_id = transcript.client_id().map(str::to_string);
    summary.session_id = transcript.session_id().map(str::to_string);
    summary.entries = transcript.entries().len();
    Ok(summary)
}

fn request_url(base: &str, token: Option<&str>) -> String {
    match token {
        Some(token) => {
            let separator = if base.contains('?') { '&' } else { '?' };
            format!("{base}{separator}token={}", urlencoding::encode(token))
        }
        None => base.to_string(),
    }
}

async fn load_images(paths: &[PathBuf]) -> Result<Vec<ImageAttachment>> {
    let mut images = Vec::with_capacity(paths.len());
    for path in paths {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading image {}", path.display()))?;
        images.push(ImageAttachment {
            name: path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "image".to_string()),
            data: STANDARD.encode(bytes),
            media_type: media_type(path).to_string(),
        });
    }
    Ok(images)
}

fn media_type(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        _ => "application/octet-stream",
    }
}
