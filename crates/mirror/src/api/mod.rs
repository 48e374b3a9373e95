//! HTTP surface: WebSocket endpoints for hosts and listeners, plus the pages
//! that hand out their addresses.

mod error;
mod handlers;
mod routes;
mod state;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use routes::create_router;
pub use state::AppState;
