//! HTTP Control API for the dashboard
//!
//! - POST /api/sessions/start - Start a new session
//! - POST /api/sessions/stop - Stop a session
//! - GET /api/sessions - List session snapshots
//! - GET /api/sessions/:id - Single session snapshot
//! - GET /api/metrics - Latest host metrics
//! - GET /api/events - Server-sent state/metrics events
//! - GET /health - Health check
//! - GET <public_path>/... - Published HLS output

mod handlers;
mod routes;
mod state;

pub use handlers::{ApiError, ErrorResponse};
pub use routes::create_router;
pub use state::AppState;
