//! Event relay: connection handling and turn event forwarding.

mod forward;
mod handler;
mod registry;

pub use forward::TurnForwarder;
pub use handler::{WsQuery, ws_handler};
pub use registry::ConnectionRegistry;
