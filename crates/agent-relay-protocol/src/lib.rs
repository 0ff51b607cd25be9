//! Protocol types for the agent relay.
//!
//! Two boundaries are described here:
//!
//! ```text
//! Browser / CLI client <--[WS: ClientMessage / ServerMessage]--> Relay <--[stdout: stream-json]--> Tool
//! ```
//!
//! - [`wire`] is the JSON protocol spoken over the persistent connection.
//!   Every outbound message is wrapped in an [`Envelope`] that adds a
//!   `timestamp`.
//! - [`stream`] is a typed view of the newline-delimited events the external
//!   tool writes on stdout. The relay forwards those events untouched (as
//!   `claude-response.data`); the typed view is what consumers use to
//!   interpret them.

pub mod stream;
pub mod wire;

pub use stream::{BlockDelta, ContentBlock, MessageContent, StreamEvent, ToolEvent, ToolMessage};
pub use wire::{
    ClientMessage, Envelope, ImageAttachment, ProtocolError, ServerMessage, StatusData,
};
