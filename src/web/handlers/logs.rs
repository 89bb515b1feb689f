//! # Log Analysis Handlers
//!
//! Batch submission of log lines or structured events, plus read access to
//! detected anomalies and incidents.

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::anomaly::{AnomalyScore, LogEvent, LogLevel};
use crate::incident::{Incident, IncidentStatus};
use crate::kernel::AnalysisReport;
use crate::logging::log_operator_action;
use crate::web::errors::{ApiError, ApiResult};
use crate::web::state::AppState;

const DEFAULT_SOURCE: &str = "unknown";
const DEFAULT_ANOMALY_LIMIT: usize = 50;

/// Either raw lines with a default source, or structured events
#[derive(Debug, Default, Deserialize)]
pub struct AnalyzeRequest {
    pub source: Option<String>,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default)]
    pub events: Vec<EventInput>,
}

#[derive(Debug, Deserialize)]
pub struct EventInput {
    pub raw_text: String,
    pub source_component: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub level: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AnomaliesQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct AnomaliesResponse {
    pub anomalies: Vec<AnomalyScore>,
    pub threshold: f64,
    pub model_version: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct IncidentsQuery {
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    pub notes: String,
}

/// Score a batch of log events: POST /logs/analyze
pub async fn analyze_logs(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AnalyzeRequest>,
) -> ApiResult<Json<AnalysisReport>> {
    if request.logs.is_empty() && request.events.is_empty() {
        return Err(ApiError::bad_request("Provide either `logs` or `events`"));
    }

    let kernel = state.kernel();
    let source = request.source.as_deref().unwrap_or(DEFAULT_SOURCE);
    let mut events: Vec<LogEvent> = kernel.parse_lines(&request.logs, source);

    for input in request.events {
        let level = input
            .level
            .as_deref()
            .map(str::parse::<LogLevel>)
            .transpose()
            .map_err(ApiError::bad_request)?;
        let component = input.source_component.as_deref().unwrap_or(source);
        events.push(kernel.event(&input.raw_text, component, input.timestamp, level));
    }

    debug!(events = events.len(), source = %source, "Analyzing submitted log batch");
    Ok(Json(kernel.analyze_logs(events).await))
}

/// Recent anomalous windows: GET /logs/anomalies?limit=50
pub async fn recent_anomalies(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AnomaliesQuery>,
) -> Json<AnomaliesResponse> {
    let detector = state.kernel().detector();
    Json(AnomaliesResponse {
        anomalies: detector.recent_anomalies(query.limit.unwrap_or(DEFAULT_ANOMALY_LIMIT)),
        threshold: detector.threshold(),
        model_version: detector.model_version().to_string(),
    })
}

/// Incidents, newest first: GET /logs/incidents?status=open
pub async fn list_incidents(
    State(state): State<Arc<AppState>>,
    Query(query): Query<IncidentsQuery>,
) -> ApiResult<Json<Vec<Incident>>> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<IncidentStatus>)
        .transpose()
        .map_err(ApiError::bad_request)?;
    Ok(Json(state.kernel().incidents().list(status)))
}

/// Close an incident: POST /logs/incidents/{id}/resolve
pub async fn resolve_incident(
    State(state): State<Arc<AppState>>,
    Path(incident_id): Path<Uuid>,
    Json(request): Json<ResolveRequest>,
) -> ApiResult<Json<Incident>> {
    let incident = state
        .kernel()
        .incidents()
        .resolve(incident_id, &request.notes)
        .await?;
    log_operator_action("resolve_incident", Some(&incident_id.to_string()), "resolved");
    Ok(Json(incident))
}
