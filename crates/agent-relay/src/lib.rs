//! Agent relay server library.
//!
//! Streams an AI command-line tool's output to chat clients over WebSocket,
//! one tool process per chat turn.
//!
//! - [`frame`] splits tool output into JSON-or-text records.
//! - [`process`] launches the tool and owns its lifetime.
//! - [`supervisor`] enforces one turn per connection, cancellation and the
//!   turn timeout.
//! - [`relay`] maps client requests to supervisor calls and turn events to
//!   wire messages.
//! - [`api`] is the HTTP surface.

pub mod api;
pub mod attachments;
pub mod auth;
pub mod config;
pub mod error;
pub mod frame;
pub mod process;
pub mod relay;
pub mod supervisor;

pub use config::AppConfig;
pub use error::{AttachmentError, TurnError};
