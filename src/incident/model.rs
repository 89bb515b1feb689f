//! Incident records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::constants::severity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Monotonic mapping from peak anomaly score
    pub fn from_score(score: f64) -> Self {
        if score >= severity::CRITICAL {
            Severity::Critical
        } else if score >= severity::HIGH {
            Severity::High
        } else if score >= severity::MEDIUM {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentStatus {
    Open,
    Investigating,
    Resolved,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Open => "OPEN",
            IncidentStatus::Investigating => "INVESTIGATING",
            IncidentStatus::Resolved => "RESOLVED",
        }
    }

    /// Accepts new anomaly merges
    pub fn is_active(&self) -> bool {
        !matches!(self, IncidentStatus::Resolved)
    }
}

impl fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IncidentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "open" => Ok(IncidentStatus::Open),
            "investigating" => Ok(IncidentStatus::Investigating),
            "resolved" => Ok(IncidentStatus::Resolved),
            other => Err(format!("unknown incident status '{other}'")),
        }
    }
}

/// Where an incident is surfaced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentRoute {
    /// Visible on the dashboard only
    Dashboard,
    /// Sent to the team notification channel
    Notify,
    /// Pages the on-call engineer
    Page,
}

impl From<Severity> for IncidentRoute {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Low => IncidentRoute::Dashboard,
            Severity::Medium | Severity::High => IncidentRoute::Notify,
            Severity::Critical => IncidentRoute::Page,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRef {
    pub window_id: String,
    pub score: f64,
    pub model_version: String,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: Uuid,
    pub opened_at: DateTime<Utc>,
    pub anomaly_refs: Vec<AnomalyRef>,
    pub severity: Severity,
    pub status: IncidentStatus,
    pub root_cause_text: Option<String>,
    pub recommended_fix: Option<String>,
    pub affected_component: String,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_notes: Option<String>,
    pub peak_score: f64,
    pub last_anomaly_at: DateTime<Utc>,
    pub route: IncidentRoute,
}

impl Incident {
    pub(crate) fn open(component: &str, anomaly: AnomalyRef) -> Self {
        let severity = Severity::from_score(anomaly.score);
        Self {
            id: Uuid::new_v4(),
            opened_at: anomaly.detected_at,
            severity,
            status: IncidentStatus::Open,
            root_cause_text: None,
            recommended_fix: None,
            affected_component: component.to_string(),
            resolved_at: None,
            resolution_notes: None,
            peak_score: anomaly.score,
            last_anomaly_at: anomaly.detected_at,
            route: severity.into(),
            anomaly_refs: vec![anomaly],
        }
    }

    /// Fold another anomaly in; severity only ever rises
    pub(crate) fn merge(&mut self, anomaly: AnomalyRef) {
        self.peak_score = self.peak_score.max(anomaly.score);
        self.severity = self.severity.max(Severity::from_score(self.peak_score));
        self.route = self.severity.into();
        self.last_anomaly_at = self.last_anomaly_at.max(anomaly.detected_at);
        self.anomaly_refs.push(anomaly);
    }
}
