//! HTTP API module.
//!
//! Two routes: the WebSocket endpoint at `/ws` and `GET /api/health`.

mod error;
mod routes;
mod state;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use routes::{HealthResponse, create_router};
pub use state::AppState;
