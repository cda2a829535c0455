//! WebAPI - REST API Endpoints
//!
//! ## Responsibilities
//!
//! - HTTP API routes
//! - Request validation
//! - Response formatting
//! - SSE event stream and MJPEG live feed

mod routes;
mod stream_routes;

pub use routes::create_router;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;

use crate::models::HealthResponse;
use crate::state::AppState;

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let response = HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_sec: state.started_at.elapsed().as_secs(),
        cameras: state.cameras.list_ids().await.len(),
        detections_running: state.detection.running_count().await,
        active_alerts: state.alerts.active_count().await,
        sse_clients: state.realtime.connection_count() as usize,
    };

    Json(response)
}
