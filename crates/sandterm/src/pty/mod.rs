//! PTY bridge between sessions and the shells inside their sandboxes.

mod bridge;

pub use bridge::{BridgeEvent, EventSender, InteractiveStream, PtyBridge};
