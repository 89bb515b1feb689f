//! # System Control Handlers
//!
//! Monitoring and operator overrides for the resilience layer: circuit
//! breakers, the dead-letter queue and queue admission state.

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::backpressure::QueueAdmissionState;
use crate::dlq::{DeadLetterTask, DlqStats, TaskStatus};
use crate::logging::log_operator_action;
use crate::resilience::BreakerSnapshot;
use crate::web::errors::{ApiError, ApiResult};
use crate::web::state::AppState;

const DEFAULT_DLQ_LIST_LIMIT: usize = 100;

#[derive(Debug, Serialize)]
pub struct CircuitBreakersResponse {
    pub breakers: Vec<BreakerSnapshot>,
    pub counts_by_state: BTreeMap<String, usize>,
    pub open_breakers: Vec<String>,
    pub health_score: f64,
    pub collected_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub reset: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct DlqQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct DlqResponse {
    pub stats: DlqStats,
    pub tasks: Vec<DeadLetterTask>,
}

/// Snapshot of every breaker: GET /system/circuit-breakers
pub async fn circuit_breakers(State(state): State<Arc<AppState>>) -> Json<CircuitBreakersResponse> {
    let snapshot = state.kernel().breakers().snapshot();
    let counts_by_state = snapshot
        .count_by_state()
        .into_iter()
        .map(|(circuit_state, count)| (circuit_state.to_string(), count))
        .collect();

    Json(CircuitBreakersResponse {
        counts_by_state,
        open_breakers: snapshot.open_breakers(),
        health_score: snapshot.health_score(),
        collected_at: snapshot.collected_at,
        breakers: snapshot.breakers,
    })
}

/// Force every breaker CLOSED: POST /system/circuit-breakers/reset
pub async fn reset_circuit_breakers(State(state): State<Arc<AppState>>) -> Json<ResetResponse> {
    let reset = state.kernel().breakers().reset_all();
    log_operator_action("reset_circuit_breakers", None, &format!("reset={reset}"));
    Json(ResetResponse { reset })
}

/// DLQ statistics and tasks: GET /system/dlq?status=dead&limit=50
pub async fn dead_letter_queue(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DlqQuery>,
) -> ApiResult<Json<DlqResponse>> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<TaskStatus>)
        .transpose()
        .map_err(ApiError::bad_request)?;
    let limit = query.limit.unwrap_or(DEFAULT_DLQ_LIST_LIMIT);

    let dlq = state.kernel().dlq();
    Ok(Json(DlqResponse {
        stats: dlq.stats(),
        tasks: dlq.list(status, limit),
    }))
}

/// Force-requeue a DEAD task: POST /system/dlq/{task_id}/retry
pub async fn retry_dead_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<Uuid>,
) -> ApiResult<Json<DeadLetterTask>> {
    let task = state.kernel().dlq().retry_dead(task_id)?;
    log_operator_action("retry_dead_task", Some(&task_id.to_string()), "requeued");
    Ok(Json(task))
}

/// Per-queue admission state: GET /system/backpressure
pub async fn backpressure(State(state): State<Arc<AppState>>) -> Json<Vec<QueueAdmissionState>> {
    Json(state.kernel().backpressure().snapshot())
}
