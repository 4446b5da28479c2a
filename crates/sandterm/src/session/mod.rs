//! Session management module.
//!
//! Sessions map one-to-one onto sandbox containers while they are alive.
//! This module owns the registry, volume resolution, the container lifecycle
//! and the idle reaper, plus the service that ties them to the PTY bridge.

mod error;
mod manager;
mod models;
mod reaper;
mod registry;
mod service;
mod volume;

pub use error::{SessionError, SessionResult};
pub use manager::{
    CONTAINER_NAME_PREFIX, Discovery, ProvisioningGuard, SandboxConfig, SandboxManager,
};
pub use models::{
    COLS_RANGE, CreateSessionRequest, ROWS_RANGE, Session, SessionState, TerminalSize,
};
pub use reaper::IdleReaper;
pub use registry::SessionRegistry;
pub use service::SessionService;
pub use volume::VolumeResolver;
