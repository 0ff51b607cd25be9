//! Transcript reconstruction.
//!
//! [`Transcript`] folds the relay's message stream into an ordered list of
//! display entries. Streamed fragments carry no unit ids, so a fragment goes
//! to the current open unit of its kind: one pointer for text, one for
//! thinking. Interleaved units of the same kind are therefore not supported;
//! the tool never opens a second unit of a kind before closing the first.
//!
//! Rules, in priority order:
//!
//! 1. Block and message start/stop events open and close units but carry no
//!    content of their own.
//! 2. Text and thinking deltas append to the open unit of their kind, creating
//!    it on the first fragment.
//! 3. Tool invocations always get a new entry with status `running`.
//! 4. Tool results attach to the most recent running tool entry. With no
//!    running tool the result is dropped.
//! 5. Full assistant messages apply rules 2 and 3 per content item, in order.
//! 6. Errors always get a new, closed, system entry.
//! 7. Raw output lines are appended like text deltas.
//!
//! `claude-complete` closes every open entry.

use std::collections::{HashMap, HashSet};
use std::fmt;

use agent_relay_protocol::stream::tool_result_text;
use agent_relay_protocol::{
    BlockDelta, ContentBlock, MessageContent, ServerMessage, StreamEvent, ToolEvent,
};
use log::{debug, warn};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Text,
    Thinking,
    ToolUse,
    Error,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Running,
    Success,
    Error,
}

/// Tool invocation details of a `tool_use` entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
    pub output: Option<String>,
    pub status: ToolStatus,
}

/// One displayable transcript entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Entry {
    pub id: String,
    pub role: Role,
    pub kind: EntryKind,
    pub content: String,
    /// Still receiving fragments.
    pub streaming: bool,
    pub tool: Option<ToolCall>,
}

/// Effect of applying one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Changed,
    Unchanged,
    /// The message had content but nothing to attach it to.
    Dropped(DropReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// A tool result arrived while no tool entry was running.
    OrphanToolResult { tool_use_id: String },
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::OrphanToolResult { tool_use_id } => {
                write!(f, "tool result {tool_use_id} has no running tool entry")
            }
        }
    }
}

/// Streamed unit kinds that have an open-entry pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unit {
    Text,
    Thinking,
    Other,
}

/// Content the tool streamed for the current unit of one kind, used to spot
/// the full-message echo that follows.
#[derive(Debug, Default)]
struct Streamed {
    buffer: String,
    /// Deltas have been seen for this unit.
    active: bool,
}

impl Streamed {
    fn start(&mut self) {
        self.buffer.clear();
        self.active = false;
    }

    fn push(&mut self, fragment: &str) {
        self.buffer.push_str(fragment);
        self.active = true;
    }

    /// True once per streamed unit if `text` is its full content.
    fn take_echo(&mut self, text: &str) -> bool {
        if self.active && self.buffer == text {
            self.start();
            true
        } else {
            false
        }
    }
}

/// Ordered transcript built from relay messages.
#[derive(Debug, Default)]
pub struct Transcript {
    entries: Vec<Entry>,
    next_id: u64,
    open_text: Option<usize>,
    open_thinking: Option<usize>,
    /// Block index to unit kind, for the current message.
    blocks: HashMap<usize, Unit>,
    /// Running tool entries, most recent last.
    running_tools: Vec<usize>,
    seen_tool_ids: HashSet<String>,
    streamed_text: Streamed,
    streamed_thinking: Streamed,
    client_id: Option<String>,
    session_id: Option<String>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    /// Conversation id reported by the tool, to send as `sessionId` next turn.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Whether any entry is still open.
    pub fn is_streaming(&self) -> bool {
        self.open_text.is_some() || self.open_thinking.is_some()
    }

    /// Record the local user's message. Closes anything still open.
    pub fn push_user(&mut self, content: impl Into<String>) {
        self.close_all();
        self.push(Role::User, EntryKind::Text, content.into(), false, None);
    }

    /// Fold one relay message into the transcript.
    pub fn apply(&mut self, message: &ServerMessage) -> Applied {
        match message {
            ServerMessage::Connection { client_id, .. } => {
                self.client_id = Some(client_id.clone());
                Applied::Unchanged
            }
            ServerMessage::ClaudeResponse { data, .. } => self.apply_record(data),
            ServerMessage::ClaudeOutput { content, .. } => {
                let mut line = content.clone();
                line.push('\n');
                self.append(Unit::Text, &line)
            }
            ServerMessage::ClaudeError { error, .. } => self.push_error(error.clone()),
            ServerMessage::Error { message } => self.push_error(message.clone()),
            ServerMessage::ClaudeComplete { error, .. } => {
                let mut changed = self.close_all();
                if let Some(error) = error {
                    self.push_error(error.clone());
                    changed = true;
                }
                changed_if(changed)
            }
            ServerMessage::InterruptConfirmed { .. } => {
                self.push(
                    Role::System,
                    EntryKind::System,
                    "Stopped by user".to_string(),
                    false,
                    None,
                );
                Applied::Changed
            }
            ServerMessage::ChatReceived { .. } | ServerMessage::CommandResponse { .. } => {
                Applied::Unchanged
            }
        }
    }

    fn apply_record(&mut self, data: &Value) -> Applied {
        let Some(event) = ToolEvent::from_value(data) else {
            debug!("Ignoring record that is not a tool event");
            return Applied::Unchanged;
        };

        match event {
            ToolEvent::System { session_id, .. } => {
                if session_id.is_some() {
                    self.session_id = session_id;
                }
                Applied::Unchanged
            }
            ToolEvent::StreamEvent { event, .. } => self.apply_stream(event),
            ToolEvent::Assistant { message, .. } => self.apply_assistant(message.content),
            ToolEvent::User { message, .. } => self.apply_tool_results(message.content),
            ToolEvent::Result {
                is_error: true,
                result,
                ..
            } => self.push_error(result.unwrap_or_else(|| "The tool reported an error".into())),
            ToolEvent::Result { .. } | ToolEvent::Unknown => Applied::Unchanged,
        }
    }

    fn apply_stream(&mut self, event: StreamEvent) -> Applied {
        match event {
            StreamEvent::MessageStart => {
                self.blocks.clear();
                self.streamed_text.start();
                self.streamed_thinking.start();
                Applied::Unchanged
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                let (unit, initial) = match content_block {
                    ContentBlock::Text { text } => (Unit::Text, text),
                    ContentBlock::Thinking { thinking } => (Unit::Thinking, thinking),
                    _ => (Unit::Other, String::new()),
                };
                self.blocks.insert(index, unit);
                // A new unit supersedes the open one of its kind.
                let mut changed = self.close(unit);
                match unit {
                    Unit::Text => self.streamed_text.start(),
                    Unit::Thinking => self.streamed_thinking.start(),
                    Unit::Other => {}
                }
                if !initial.is_empty() {
                    self.stream_fragment(unit, &initial);
                    changed = true;
                }
                changed_if(changed)
            }
            StreamEvent::ContentBlockDelta { delta, .. } => match delta {
                BlockDelta::TextDelta { text } => self.stream_fragment(Unit::Text, &text),
                BlockDelta::ThinkingDelta { thinking } => {
                    self.stream_fragment(Unit::Thinking, &thinking)
                }
                BlockDelta::InputJsonDelta { .. } | BlockDelta::Other => Applied::Unchanged,
            },
            StreamEvent::ContentBlockStop { index } => match self.blocks.remove(&index) {
                Some(unit) => changed_if(self.close(unit)),
                None => Applied::Unchanged,
            },
            StreamEvent::MessageStop => changed_if(self.close_all()),
            StreamEvent::MessageDelta | StreamEvent::Other => Applied::Unchanged,
        }
    }

    fn stream_fragment(&mut self, unit: Unit, fragment: &str) -> Applied {
        match unit {
            Unit::Text => self.streamed_text.push(fragment),
            Unit::Thinking => self.streamed_thinking.push(fragment),
            Unit::Other => return Applied::Unchanged,
        }
        self.append(unit, fragment)
    }

    fn apply_assistant(&mut self, content: MessageContent) -> Applied {
        let mut changed = false;
        match content {
            MessageContent::Text(text) => {
                changed |= self.append(Unit::Text, &text) == Applied::Changed;
            }
            MessageContent::Blocks(blocks) => {
                for block in blocks {
                    changed |= match block {
                        ContentBlock::Text { text } => {
                            !self.streamed_text.take_echo(&text)
                                && self.append(Unit::Text, &text) == Applied::Changed
                        }
                        ContentBlock::Thinking { thinking } => {
                            !self.streamed_thinking.take_echo(&thinking)
                                && self.append(Unit::Thinking, &thinking) == Applied::Changed
                        }
                        ContentBlock::ToolUse { id, name, input } => {
                            self.push_tool(id, name, input)
                        }
                        ContentBlock::ToolResult { .. } | ContentBlock::Other => false,
                    };
                }
            }
        }
        changed_if(changed)
    }

    fn apply_tool_results(&mut self, content: MessageContent) -> Applied {
        let MessageContent::Blocks(blocks) = content else {
            return Applied::Unchanged;
        };

        let mut applied = Applied::Unchanged;
        for block in blocks {
            let ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } = block
            else {
                continue;
            };

            let Some(index) = self.running_tools.pop() else {
                warn!("Dropping tool result {}: no running tool", tool_use_id);
                if applied == Applied::Unchanged {
                    applied = Applied::Dropped(DropReason::OrphanToolResult { tool_use_id });
                }
                continue;
            };

            if let Some(tool) = self.entries[index].tool.as_mut() {
                tool.output = Some(tool_result_text(&content));
                tool.status = if is_error {
                    ToolStatus::Error
                } else {
                    ToolStatus::Success
                };
            }
            applied = Applied::Changed;
        }
        applied
    }

    fn push_tool(&mut self, id: String, name: String, input: Value) -> bool {
        if !self.seen_tool_ids.insert(id.clone()) {
            return false;
        }
        self.close(Unit::Text);
        self.close(Unit::Thinking);
        let index = self.push(
            Role::Assistant,
            EntryKind::ToolUse,
            String::new(),
            false,
            Some(ToolCall {
                id,
                name,
                input,
                output: None,
                status: ToolStatus::Running,
            }),
        );
        self.running_tools.push(index);
        true
    }

    fn push_error(&mut self, message: String) -> Applied {
        self.push(Role::System, EntryKind::Error, message, false, None);
        Applied::Changed
    }

    /// Append to the open unit of `unit`'s kind, opening one if needed.
    fn append(&mut self, unit: Unit, fragment: &str) -> Applied {
        if fragment.is_empty() {
            return Applied::Unchanged;
        }
        let (slot, kind) = match unit {
            Unit::Text => (self.open_text, EntryKind::Text),
            Unit::Thinking => (self.open_thinking, EntryKind::Thinking),
            Unit::Other => return Applied::Unchanged,
        };

        match slot {
            Some(index) => self.entries[index].content.push_str(fragment),
            None => {
                let index = self.push(Role::Assistant, kind, fragment.to_string(), true, None);
                match unit {
                    Unit::Text => self.open_text = Some(index),
                    Unit::Thinking => self.open_thinking = Some(index),
                    Unit::Other => {}
                }
            }
        }
        Applied::Changed
    }

    fn close(&mut self, unit: Unit) -> bool {
        let slot = match unit {
            Unit::Text => self.open_text.take(),
            Unit::Thinking => self.open_thinking.take(),
            Unit::Other => None,
        };
        match slot {
            Some(index) => {
                self.entries[index].streaming = false;
                true
            }
            None => false,
        }
    }

    /// Close every open entry.
    fn close_all(&mut self) -> bool {
        self.open_text = None;
        self.open_thinking = None;
        let mut changed = false;
        for entry in self.entries.iter_mut().filter(|entry| entry.streaming) {
            entry.streaming = false;
            changed = true;
        }
        changed
    }

    fn push(
        &mut self,
        role: Role,
        kind: EntryKind,
        content: String,
        streaming: bool,
        tool: Option<ToolCall>,
    ) -> usize {
        self.next_id += 1;
        self.entries.push(Entry {
            id: format!("entry-{}", self.next_id),
            role,
            kind,
            content,
            streaming,
            tool,
        });
        self.entries.len() - 1
    }
}

fn changed_if(changed: bool) -> Applied {
    if changed {
        Applied::Changed
    } else {
        Applied::Unchanged
    }
}
