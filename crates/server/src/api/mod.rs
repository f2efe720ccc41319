pub mod scan;

use axum::{
    routing::{get, post},
    Json, Router,
};

use crate::state::{AppState, HealthResponse};

pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/scan", post(scan::start_scan))
        .route("/scan/status", get(scan::scan_status))
        .route("/events", get(scan::events))
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}
