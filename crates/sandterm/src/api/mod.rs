//! HTTP API module.
//!
//! REST endpoints for session and sandbox administration plus the
//! WebSocket upgrade routes.

mod error;
mod handlers;
mod identity;
mod routes;
mod state;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use handlers::HealthResponse;
pub use identity::{USER_ID_HEADER, UserIdentity};
pub use routes::create_router;
pub use state::AppState;
