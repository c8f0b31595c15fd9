use super::state::AppState;
use crate::error::SessionError;
use crate::events::Event as BusEvent;
use crate::session::{Protocol, SessionId, SessionSnapshot, StreamInput};
use crate::supervisor::StopAck;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::time::Duration;
use tracing::{debug, error, info};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct StartSessionRequest {
    /// Input URL (`srt://`, `rtmp://`, `udp://`, `http(s)://`, `rtsp://`)
    pub url: String,

    /// Protocol name; resolved from the URL scheme when absent or "auto"
    pub protocol: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StartSessionResponse {
    pub session_id: SessionId,
    pub state: crate::session::SessionState,
    pub output_ref: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StopSessionRequest {
    pub session_id: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// `SessionError` rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub SessionError);

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        Self(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            SessionError::InvalidInput(_) | SessionError::UnsupportedProtocol(_) => {
                StatusCode::BAD_REQUEST
            }
            SessionError::NotFound(_) => StatusCode::NOT_FOUND,
            SessionError::CapacityExceeded { .. } | SessionError::AlreadyTerminal { .. } => {
                StatusCode::CONFLICT
            }
            SessionError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
                code: self.0.code().to_string(),
            }),
        )
            .into_response()
    }
}

/// An id that cannot exist is reported like any other unknown id.
fn parse_id(raw: &str) -> Result<SessionId, ApiError> {
    SessionId::parse(raw).ok_or_else(|| ApiError(SessionError::NotFound(raw.to_string())))
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /api/sessions/start
/// Create a session and start supervising it
pub async fn start_session(
    State(state): State<AppState>,
    Json(req): Json<StartSessionRequest>,
) -> Result<Json<StartSessionResponse>, ApiError> {
    let protocol = match req.protocol.as_deref() {
        Some(name) => name.parse::<Protocol>()?,
        None => Protocol::Auto,
    };

    info!("Start requested for {} ({})", req.url, protocol);
    let snapshot = state.manager.start(StreamInput::new(req.url, protocol)).await?;

    Ok(Json(StartSessionResponse {
        session_id: snapshot.id,
        state: snapshot.state,
        output_ref: snapshot.output_ref,
    }))
}

/// POST /api/sessions/stop
/// Stop a session, waiting up to the grace period for it to reach STOPPED
pub async fn stop_session(
    State(state): State<AppState>,
    Json(req): Json<StopSessionRequest>,
) -> Result<Json<StopAck>, ApiError> {
    let id = parse_id(&req.session_id)?;
    let ack = state.manager.stop(&id).await?;
    Ok(Json(ack))
}

/// GET /api/sessions
/// Snapshots of all known sessions
pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionSnapshot>> {
    Json(state.manager.list())
}

/// GET /api/sessions/:session_id
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    let id = parse_id(&session_id)?;
    Ok(Json(state.manager.get(&id)?))
}

/// GET /api/metrics
/// Latest host metrics snapshot
pub async fn get_metrics(State(state): State<AppState>) -> Response {
    match state.manager.latest_metrics() {
        Some(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                error: "No metrics sampled yet".to_string(),
                code: "MetricsUnavailable".to_string(),
            }),
        )
            .into_response(),
    }
}

/// GET /api/events
/// Server-sent event stream of state changes and metrics
pub async fn events_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = state.manager.subscribe();
    let shutdown = state.manager.shutdown_token();
    debug!("Event subscriber connected");

    let stream = stream::unfold(subscription, |mut subscription| async move {
        loop {
            let event: BusEvent = subscription.recv().await?;
            match serde_json::to_string(&event) {
                Ok(json) => {
                    let sse = Event::default().event(event.kind()).data(json);
                    return Some((Ok(sse), subscription));
                }
                Err(e) => error!("Failed to serialize event: {}", e),
            }
        }
    })
    // Long-lived streams would otherwise hold up graceful shutdown.
    .take_until(async move { shutdown.cancelled().await });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

/// GET /health
/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
