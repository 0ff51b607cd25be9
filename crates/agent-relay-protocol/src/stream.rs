//! Typed view of the tool's `stream-json` output.
//!
//! The tool writes one JSON object per line. The relay never rewrites these
//! records; it forwards the raw value and leaves interpretation to consumers,
//! which deserialize into [`ToolEvent`]. Every enum here has an `Other` or
//! `Unknown` arm so that newer tool versions do not break older consumers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single record from the tool's stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolEvent {
    /// Session bookkeeping. `init` carries the conversation id.
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
    },

    /// A complete assistant message.
    Assistant {
        message: ToolMessage,
        #[serde(default)]
        session_id: Option<String>,
    },

    /// A user-side message, usually carrying tool results.
    User {
        message: ToolMessage,
        #[serde(default)]
        session_id: Option<String>,
    },

    /// Incremental streaming event (partial messages).
    StreamEvent {
        event: StreamEvent,
        #[serde(default)]
        session_id: Option<String>,
    },

    /// Final summary of the turn.
    Result {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
    },

    #[serde(other)]
    Unknown,
}

impl ToolEvent {
    /// Interpret a forwarded record. Records that are not objects with a
    /// recognisable shape come back as `None`.
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    /// Conversation id reported by this record, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::System { session_id, .. }
            | Self::Assistant { session_id, .. }
            | Self::User { session_id, .. }
            | Self::StreamEvent { session_id, .. }
            | Self::Result { session_id, .. } => session_id.as_deref(),
            Self::Unknown => None,
        }
    }
}

/// Message body of `assistant` and `user` records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolMessage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default = "MessageContent::empty")]
    pub content: MessageContent,
}

/// Message content is either a bare string or a list of blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    fn empty() -> Self {
        Self::Blocks(Vec::new())
    }

    /// View as blocks; a bare string becomes a single text block.
    pub fn blocks(&self) -> Vec<ContentBlock> {
        match self {
            Self::Text(text) => vec![ContentBlock::Text { text: text.clone() }],
            Self::Blocks(blocks) => blocks.clone(),
        }
    }
}

/// One block of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Other,
}

/// Payload of a `stream_event` record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart,
    ContentBlockStart {
        index: usize,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: BlockDelta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta,
    MessageStop,
    #[serde(other)]
    Other,
}

/// Incremental fragment of a content block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockDelta {
    TextDelta { text: String },
    ThinkingDelta { thinking: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

/// Flatten a `tool_result` content value into display text.
///
/// The tool reports results either as a string or as a list of
/// `{"type":"text","text":...}` items.
pub fn tool_result_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.as_str()),
                other => other.get("text").and_then(Value::as_str),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
