//! # Web API Errors
//!
//! Every handler returns [`ApiResult`]. Error bodies share one shape:
//!
//! ```json
//! { "error": { "code": "CIRCUIT_BREAKER_OPEN", "message": "..." } }
//! ```
//!
//! The three guarded-call outcomes map to distinct codes so callers can tell
//! "degraded, try later" (503) from "accepted, retrying in the background"
//! (202) from "needs attention" (422).

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::dlq::DlqError;
use crate::error::KernelError;
use crate::incident::IncidentError;
use crate::kernel::GuardedCallError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Circuit breaker open for {dependency}")]
    CircuitBreakerOpen {
        dependency: String,
        retry_after_seconds: u64,
    },

    #[error("{message}")]
    QueuedForRetry { task_id: Uuid, message: String },

    #[error("{message}")]
    PermanentlyFailed { message: String },

    #[error("Idempotency key '{key}' was reused with different content")]
    IdempotencyConflict { key: String },

    #[error("{message}")]
    NotFound { message: String },

    #[error("{message}")]
    BadRequest { message: String },

    #[error("{message}")]
    Conflict { message: String },

    #[error("{message}")]
    Internal { message: String },
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::CircuitBreakerOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::QueuedForRetry { .. } => StatusCode::ACCEPTED,
            ApiError::PermanentlyFailed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::IdempotencyConflict { .. } | ApiError::Conflict { .. } => StatusCode::CONFLICT,
            ApiError::NotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            ApiError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::CircuitBreakerOpen { .. } => "CIRCUIT_BREAKER_OPEN",
            ApiError::QueuedForRetry { .. } => "QUEUED_FOR_RETRY",
            ApiError::PermanentlyFailed { .. } => "PERMANENTLY_FAILED",
            ApiError::IdempotencyConflict { .. } => "IDEMPOTENCY_CONFLICT",
            ApiError::NotFound { .. } => "NOT_FOUND",
            ApiError::BadRequest { .. } => "BAD_REQUEST",
            ApiError::Conflict { .. } => "CONFLICT",
            ApiError::Internal { .. } => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut error = json!({
            "code": self.code(),
            "message": self.to_string(),
        });

        match &self {
            ApiError::CircuitBreakerOpen {
                dependency,
                retry_after_seconds,
            } => {
                error["dependency"] = json!(dependency);
                error["retry_after_seconds"] = json!(retry_after_seconds);
                return (
                    status,
                    [(header::RETRY_AFTER, retry_after_seconds.to_string())],
                    Json(json!({ "error": error })),
                )
                    .into_response();
            }
            ApiError::QueuedForRetry { task_id, .. } => {
                error["task_id"] = json!(task_id);
            }
            ApiError::IdempotencyConflict { key } => {
                error["idempotency_key"] = json!(key);
            }
            _ => {}
        }

        (status, Json(json!({ "error": error }))).into_response()
    }
}

impl<E: fmt::Display> From<GuardedCallError<E>> for ApiError {
    fn from(err: GuardedCallError<E>) -> Self {
        match err {
            GuardedCallError::ServiceDegraded {
                dependency,
                retry_after,
            } => ApiError::CircuitBreakerOpen {
                dependency,
                // Round up so clients never retry before the breaker half-opens
                retry_after_seconds: retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0),
            },
            GuardedCallError::QueuedForRetry {
                dependency,
                task_id,
                reason,
            } => ApiError::QueuedForRetry {
                task_id,
                message: format!("Request to {dependency} failed and was queued for retry: {reason}"),
            },
            GuardedCallError::Failed(e) => ApiError::PermanentlyFailed {
                message: e.to_string(),
            },
            GuardedCallError::IdempotencyConflict { key } => ApiError::IdempotencyConflict { key },
            GuardedCallError::InProgress { key } => {
                ApiError::conflict(format!("Request with idempotency key '{key}' is already being processed"))
            }
            GuardedCallError::Internal(message) => ApiError::internal(message),
        }
    }
}

impl From<DlqError> for ApiError {
    fn from(err: DlqError) -> Self {
        match err {
            DlqError::TaskNotFound { .. } => ApiError::not_found(err.to_string()),
            DlqError::InvalidTransition { .. } => ApiError::conflict(err.to_string()),
        }
    }
}

impl From<IncidentError> for ApiError {
    fn from(err: IncidentError) -> Self {
        match err {
            IncidentError::NotFound { .. } => ApiError::not_found(err.to_string()),
            IncidentError::AlreadyResolved { .. } => ApiError::conflict(err.to_string()),
            IncidentError::NotAnomalous { .. } => ApiError::bad_request(err.to_string()),
        }
    }
}

impl From<KernelError> for ApiError {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::DeadLetter(e) => e.into(),
            KernelError::Incident(e) => e.into(),
            KernelError::Validation(message) => ApiError::bad_request(message),
            other => ApiError::internal(other.to_string()),
        }
    }
}
