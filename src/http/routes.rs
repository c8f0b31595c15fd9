use super::handlers;
use super::state::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    let output = ServeDir::new(&state.output_root);
    let public_path = state.public_path.trim_end_matches('/').to_string();

    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Session control
        .route("/api/sessions/start", post(handlers::start_session))
        .route("/api/sessions/stop", post(handlers::stop_session))
        // Queries
        .route("/api/sessions", get(handlers::list_sessions))
        .route("/api/sessions/:session_id", get(handlers::get_session))
        .route("/api/metrics", get(handlers::get_metrics))
        // Push channel
        .route("/api/events", get(handlers::events_stream))
        // Published HLS output
        .nest_service(&public_path, output)
        .layer(CorsLayer::permissive())
        // Add tracing middleware for request logging
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
