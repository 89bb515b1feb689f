//! # Incident Management
//!
//! Turns anomalous log windows into tracked incidents:
//!
//! `OPEN -> INVESTIGATING -> RESOLVED`
//!
//! An incident is OPEN when created, INVESTIGATING once a root-cause narrative
//! is attached, and RESOLVED by an operator or after a quiet period. While
//! active, further anomalies for the same component merge into it.

pub mod manager;
pub mod model;
pub mod root_cause;

pub use manager::IncidentManager;
pub use model::{AnomalyRef, Incident, IncidentRoute, IncidentStatus, Severity};
pub use root_cause::{
    AnalysisMethod, BreakerGuardedSummarizer, PatternRootCauseAnalyzer, RootCauseAnalysis,
    RootCauseSummarizer,
};

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum IncidentError {
    #[error("Incident {incident_id} not found")]
    NotFound { incident_id: Uuid },

    #[error("Incident {incident_id} is already resolved")]
    AlreadyResolved { incident_id: Uuid },

    #[error("Window {window_id} is not anomalous")]
    NotAnomalous { window_id: String },
}

pub type IncidentResult<T> = Result<T, IncidentError>;
