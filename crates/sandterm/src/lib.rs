//! Per-session sandboxed browser terminals.
//!
//! Each terminal session runs a shell inside its own container, backed by a
//! persistent per-user volume. The crate is split into:
//!
//! - [`container`]: the container runtime seam and its Docker implementation
//! - [`session`]: registry, sandbox lifecycle, volumes and the idle reaper
//! - [`pty`]: the bridge between a session and its shell's exec stream
//! - [`telemetry`]: per-container resource sampling and snapshots
//! - [`ws`] and [`api`]: the WebSocket transport and REST endpoints

pub mod api;
pub mod clock;
pub mod config;
pub mod container;
pub mod engine;
pub mod pty;
pub mod session;
pub mod telemetry;
pub mod ws;

pub use engine::{Engine, EngineConfig};
