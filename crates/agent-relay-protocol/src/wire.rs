//! WebSocket protocol between clients and the relay.
//!
//! Inbound frames are [`ClientMessage`]s, outbound frames are
//! [`ServerMessage`]s wrapped in an [`Envelope`] carrying the send timestamp.
//! Type tags and field names follow the browser client's existing contract
//! (`claude-response`, `messageId`, `exitCode`, ...).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

// ============================================================================
// Commands (Client -> Server)
// ============================================================================

/// Messages sent from a client to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start a turn.
    #[serde(rename_all = "camelCase")]
    Chat {
        /// Client-side id of the user message, echoed in `chat_received`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        #[serde(default)]
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        images: Option<Vec<ImageAttachment>>,
        /// Prior conversation to continue.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },

    /// Cancel the active turn.
    Interrupt,

    /// Auxiliary control operation (`status`, `reset`, `clear`).
    Command {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        args: Option<Value>,
    },
}

/// An inline image sent with a chat turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageAttachment {
    pub name: String,
    /// Base64 payload without the `data:` prefix.
    pub data: String,
    pub media_type: String,
}

/// Errors produced while reading an inbound frame.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("message has no type")]
    MissingType,

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("invalid {kind} message: {source}")]
    Invalid {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ClientMessage {
    /// Parse a text frame.
    ///
    /// Unknown `type` tags are reported separately from malformed payloads so
    /// the relay can answer with the name it did not recognise.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text).map_err(ProtocolError::InvalidJson)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?
            .to_string();

        match kind.as_str() {
            "chat" | "interrupt" | "command" => {
                serde_json::from_value(value).map_err(|source| ProtocolError::Invalid { kind, source })
            }
            _ => Err(ProtocolError::UnknownType(kind)),
        }
    }

    /// Serialize for sending over the socket.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

// ============================================================================
// Events (Server -> Client)
// ============================================================================

/// Messages sent from the relay to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Sent once when the socket opens.
    #[serde(rename = "connection", rename_all = "camelCase")]
    Connection {
        status: String,
        client_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// A turn was accepted.
    #[serde(rename = "chat_received", rename_all = "camelCase")]
    ChatReceived {
        #[serde(default)]
        message_id: Option<String>,
    },

    /// One structured record, exactly as the tool emitted it.
    #[serde(rename = "claude-response", rename_all = "camelCase")]
    ClaudeResponse { message_id: String, data: Value },

    /// One output line that was not structured JSON.
    #[serde(rename = "claude-output", rename_all = "camelCase")]
    ClaudeOutput { message_id: String, content: String },

    /// One stderr line that is not debug noise.
    #[serde(rename = "claude-error", rename_all = "camelCase")]
    ClaudeError { message_id: String, error: String },

    /// Terminal event for a turn.
    #[serde(rename = "claude-complete", rename_all = "camelCase")]
    ClaudeComplete {
        message_id: String,
        exit_code: Option<i32>,
        /// Human-readable failure when the turn did not succeed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    #[serde(rename = "interrupt-confirmed")]
    InterruptConfirmed { message: String },

    #[serde(rename = "error")]
    Error { message: String },

    /// Reply to a `command` request.
    #[serde(rename = "command_response")]
    CommandResponse {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<StatusData>,
    },
}

/// Payload of the `status` command response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusData {
    pub connected: bool,
    pub claude_active: bool,
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl ServerMessage {
    /// Correlation id of the turn this message belongs to, if any.
    pub fn message_id(&self) -> Option<&str> {
        match self {
            Self::ClaudeResponse { message_id, .. }
            | Self::ClaudeOutput { message_id, .. }
            | Self::ClaudeError { message_id, .. }
            | Self::ClaudeComplete { message_id, .. } => Some(message_id),
            Self::ChatReceived { message_id } => message_id.as_deref(),
            _ => None,
        }
    }

    /// Whether this message ends a turn.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ClaudeComplete { .. })
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// An outbound message stamped with its send time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub message: ServerMessage,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    /// Wrap a message with the current time.
    pub fn now(message: ServerMessage) -> Self {
        Self {
            message,
            timestamp: Utc::now(),
        }
    }

    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl From<ServerMessage> for Envelope {
    fn from(message: ServerMessage) -> Self {
        Self::now(message)
    }
}
