//! # Health Check Handlers

use axum::extract::State;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

use crate::kernel::KernelHealth;
use crate::web::state::AppState;

#[derive(Debug, Serialize)]
pub struct LivenessResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Overall status with open breakers and DLQ counts: GET /health
///
/// Always 200; a degraded kernel is still serving and reports why in the body.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<KernelHealth> {
    Json(state.kernel().health())
}

/// Process liveness: GET /health/live
pub async fn liveness_check() -> Json<LivenessResponse> {
    Json(LivenessResponse {
        status: "alive",
        version: env!("CARGO_PKG_VERSION"),
    })
}
