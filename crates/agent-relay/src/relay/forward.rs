//! Turn event to wire message mapping.

use std::collections::HashSet;

use agent_relay_protocol::ServerMessage;
use log::debug;

use crate::frame::Record;
use crate::supervisor::{TurnEvent, TurnEventKind, TurnResolution};

/// Per-connection translation of [`TurnEvent`]s into [`ServerMessage`]s.
///
/// Holds the only conversational state the relay keeps: the last
/// conversation id the tool reported, reused as the continuation token for
/// the connection's next turn.
///
/// After [`clear_continuation`](Self::clear_continuation), conversation ids
/// are only taken from turns registered with
/// [`begin_turn`](Self::begin_turn) after the clear, so a turn that is still
/// streaming (or being cancelled) cannot bring the forgotten id back.
#[derive(Debug, Clone)]
pub struct TurnForwarder {
    debug_marker: String,
    continuation: Option<String>,
    cleared: bool,
    /// Turns started since the last clear.
    fresh_turns: HashSet<String>,
}

impl TurnForwarder {
    pub fn new(debug_marker: impl Into<String>) -> Self {
        Self {
            debug_marker: debug_marker.into(),
            continuation: None,
            cleared: false,
            fresh_turns: HashSet::new(),
        }
    }

    pub fn continuation(&self) -> Option<&str> {
        self.continuation.as_deref()
    }

    /// Register a turn that has just been started.
    pub fn begin_turn(&mut self, correlation_id: &str) {
        if self.cleared {
            self.fresh_turns.insert(correlation_id.to_string());
        }
    }

    pub fn clear_continuation(&mut self) {
        self.continuation = None;
        self.cleared = true;
        self.fresh_turns.clear();
    }

    fn adopts_from(&self, correlation_id: &str) -> bool {
        !self.cleared || self.fresh_turns.contains(correlation_id)
    }

    /// Map one event. `None` means the event is not relayed.
    pub fn forward(&mut self, event: TurnEvent) -> Option<ServerMessage> {
        let message_id = event.correlation_id;
        match event.kind {
            TurnEventKind::Record(Record::Event(data)) => {
                if let Some(session_id) = data.get("session_id").and_then(|v| v.as_str())
                    && self.continuation.as_deref() != Some(session_id)
                {
                    if self.adopts_from(&message_id) {
                        debug!("Turn {} reported conversation {}", message_id, session_id);
                        self.continuation = Some(session_id.to_string());
                    } else {
                        debug!(
                            "Ignoring conversation {} from turn {} started before a clear",
                            session_id, message_id
                        );
                    }
                }
                Some(ServerMessage::ClaudeResponse { message_id, data })
            }
            TurnEventKind::Record(Record::Raw(content))
            | TurnEventKind::Record(Record::Malformed { text: content, .. }) => {
                Some(ServerMessage::ClaudeOutput {
                    message_id,
                    content,
                })
            }
            TurnEventKind::Stderr(line) => {
                if !self.debug_marker.is_empty() && line.contains(&self.debug_marker) {
                    None
                } else {
                    Some(ServerMessage::ClaudeError {
                        message_id,
                        error: line,
                    })
                }
            }
            TurnEventKind::Finished(outcome) => {
                // Records of older turns are all queued before a later turn
                // finishes, so nothing stale can follow this.
                if self.cleared && self.fresh_turns.contains(&message_id) {
                    self.cleared = false;
                    self.fresh_turns.clear();
                }
                let error = match &outcome.resolution {
                    TurnResolution::Failed(e) => Some(e.to_string()),
                    TurnResolution::Success | TurnResolution::Interrupted => None,
                };
                Some(ServerMessage::ClaudeComplete {
                    message_id,
                    exit_code: outcome.exit_code,
                    error,
                })
            }
        }
    }
}
