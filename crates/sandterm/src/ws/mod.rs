//! WebSocket transport.
//!
//! The terminal socket carries one session per connection; the resource
//! socket streams telemetry snapshots.

mod handler;
mod types;

pub use handler::{resources_ws_handler, terminal_ws_handler};
pub use types::{ClientMessage, RequestLimits, ServerMessage, SessionRequest, Utf8Carry, decode};
