use axum::{extract::State, Json};
use tracing::debug;

use crate::models::HealthResponse;
use crate::AppState;

/// Health check endpoint
pub async fn health_check() -> Json<HealthResponse> {
    debug!("Health check requested");
    Json(HealthResponse::ok("Server is running"))
}

/// Readiness check endpoint
pub async fn ready_check(State(state): State<AppState>) -> Json<HealthResponse> {
    debug!("Readiness check requested");
    let stats = state.registry.stats().await;
    Json(HealthResponse::ok(format!(
        "Service is ready ({} room(s), {} session(s))",
        stats.n_rooms, stats.n_sessions
    )))
}
