//! Client side of the agent relay.
//!
//! [`Transcript`] rebuilds a display transcript from the relay's message
//! stream, [`TerminalRenderer`] prints it incrementally and [`run_chat`]
//! drives one chat turn over a WebSocket connection.

pub mod connect;
pub mod render;
pub mod transcript;

pub use connect::{ChatOptions, ChatSummary, run_chat};
pub use render::TerminalRenderer;
pub use transcript::{Applied, DropReason, Entry, EntryKind, Role, ToolCall, ToolStatus, Transcript};
