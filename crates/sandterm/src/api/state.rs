//! Application state shared across handlers.

use std::sync::Arc;
use std::time::Instant;

use crate::engine::Engine;
use crate::ws::RequestLimits;

/// Shared state for all routes.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    /// Bounds applied to inbound socket messages.
    pub limits: Arc<RequestLimits>,
    /// Allowed CORS origins. Empty allows any origin.
    pub cors_origins: Vec<String>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(engine: Arc<Engine>, limits: RequestLimits) -> Self {
        Self {
            engine,
            limits: Arc::new(limits),
            cors_origins: Vec::new(),
            started_at: Instant::now(),
        }
    }

    pub fn with_cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = origins;
        self
    }
}
