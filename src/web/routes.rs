//! # Web API Routes
//!
//! Route definitions grouped by surface.

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::web::{handlers, state::AppState};

/// Health routes for monitoring and load balancers
pub fn health_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/health/live", get(handlers::health::liveness_check))
}

/// Breaker, DLQ and backpressure monitoring plus operator overrides
pub fn system_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/system/circuit-breakers",
            get(handlers::system::circuit_breakers),
        )
        .route(
            "/system/circuit-breakers/reset",
            post(handlers::system::reset_circuit_breakers),
        )
        .route("/system/dlq", get(handlers::system::dead_letter_queue))
        .route(
            "/system/dlq/:task_id/retry",
            post(handlers::system::retry_dead_task),
        )
        .route("/system/backpressure", get(handlers::system::backpressure))
}

/// Log submission, anomalies and incidents
pub fn log_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/logs/analyze", post(handlers::logs::analyze_logs))
        .route("/logs/anomalies", get(handlers::logs::recent_anomalies))
        .route("/logs/incidents", get(handlers::logs::list_incidents))
        .route(
            "/logs/incidents/:incident_id/resolve",
            post(handlers::logs::resolve_incident),
        )
}
