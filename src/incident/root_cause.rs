//! Root-cause narratives for incidents.
//!
//! Narrative generation is an external collaborator behind
//! [`RootCauseSummarizer`]. [`PatternRootCauseAnalyzer`] is the built-in
//! implementation; [`BreakerGuardedSummarizer`] routes any summarizer through a
//! circuit breaker so a failing LLM endpoint degrades to a fallback instead of
//! stalling incident handling.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::anomaly::LogEvent;
use crate::incident::Incident;
use crate::resilience::CircuitBreakerRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisMethod {
    PatternMatching,
    Heuristic,
    Summarizer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootCauseAnalysis {
    pub root_cause: String,
    pub recommended_fix: String,
    pub matched_pattern: Option<String>,
    pub method: AnalysisMethod,
}

#[async_trait]
pub trait RootCauseSummarizer: Send + Sync + Debug {
    async fn summarize(
        &self,
        incident: &Incident,
        window: &[LogEvent],
    ) -> anyhow::Result<RootCauseAnalysis>;
}

#[derive(Debug)]
struct KnownPattern {
    label: &'static str,
    regex: Regex,
    cause: &'static str,
    fix: &'static str,
}

const KNOWN_PATTERNS: &[(&str, &str, &str, &str)] = &[
    (
        "connection_refused",
        r"connection.*refused",
        "Service is not running or a firewall is blocking the connection",
        "Verify the service is running and check network and firewall rules",
    ),
    (
        "timeout",
        r"timeout|timed out",
        "Operation took longer than the allowed timeout",
        "Increase the timeout or optimise the slow operation",
    ),
    (
        "disk_full",
        r"no.*space.*left|disk.*full",
        "Disk is full",
        "Free up disk space or increase storage capacity",
    ),
    (
        "permission_denied",
        r"permission.*denied",
        "Insufficient permissions to access a resource",
        "Check file permissions and service account access",
    ),
    (
        "not_found",
        r"404|not.*found",
        "Requested resource does not exist",
        "Verify the URL or path and that the resource still exists",
    ),
    (
        "out_of_memory",
        r"out.*of.*memory|memory.*error|\boom\b",
        "Insufficient memory available",
        "Increase the memory allocation or reduce memory usage",
    ),
];

/// Matches error lines against known failure signatures, falling back to the
/// dominant error template of the window.
#[derive(Debug)]
pub struct PatternRootCauseAnalyzer {
    patterns: Vec<KnownPattern>,
}

impl PatternRootCauseAnalyzer {
    pub fn new() -> Result<Self, regex::Error> {
        let patterns = KNOWN_PATTERNS
            .iter()
            .map(|&(label, pattern, cause, fix)| {
                Ok(KnownPattern {
                    label,
                    regex: Regex::new(&format!("(?i){pattern}"))?,
                    cause,
                    fix,
                })
            })
            .collect::<Result<Vec<_>, regex::Error>>()?;
        Ok(Self { patterns })
    }

    pub fn analyze(&self, component: &str, window: &[LogEvent]) -> RootCauseAnalysis {
        let errors: Vec<&LogEvent> = window
            .iter()
            .filter(|event| event.level.is_error())
            .collect();
        // Prefer error lines, but a window of warnings can still match
        let candidates: Vec<&LogEvent> = if errors.is_empty() {
            window.iter().collect()
        } else {
            errors.clone()
        };

        for event in &candidates {
            if let Some(known) = self
                .patterns
                .iter()
                .find(|known| known.regex.is_match(&event.raw_text))
            {
                return RootCauseAnalysis {
                    root_cause: format!("{} ({component})", known.cause),
                    recommended_fix: known.fix.to_string(),
                    matched_pattern: Some(known.label.to_string()),
                    method: AnalysisMethod::PatternMatching,
                };
            }
        }

        match dominant_template(&errors) {
            Some((template, count)) => RootCauseAnalysis {
                root_cause: format!(
                    "Repeated error in {component}: \"{template}\" ({count} of {} events)",
                    window.len()
                ),
                recommended_fix: format!(
                    "Check {component} service health, recent deployments and resource availability"
                ),
                matched_pattern: None,
                method: AnalysisMethod::Heuristic,
            },
            None => RootCauseAnalysis {
                root_cause: format!("Unusual log sequence in {component}; unable to determine root cause automatically"),
                recommended_fix: "Manual investigation required".to_string(),
                matched_pattern: None,
                method: AnalysisMethod::Heuristic,
            },
        }
    }
}

fn dominant_template(events: &[&LogEvent]) -> Option<(String, usize)> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for event in events {
        *counts.entry(event.template.as_str()).or_insert(0) += 1;
    }
    // Ties break on template text so the narrative is deterministic
    counts
        .into_iter()
        .max_by(|(a_template, a_count), (b_template, b_count)| {
            a_count.cmp(b_count).then_with(|| b_template.cmp(a_template))
        })
        .map(|(template, count)| (template.to_string(), count))
}

#[async_trait]
impl RootCauseSummarizer for PatternRootCauseAnalyzer {
    async fn summarize(
        &self,
        incident: &Incident,
        window: &[LogEvent],
    ) -> anyhow::Result<RootCauseAnalysis> {
        Ok(self.analyze(&incident.affected_component, window))
    }
}

/// Runs a summarizer through a named circuit breaker, with an optional
/// fallback for when the breaker rejects or the call fails.
#[derive(Debug)]
pub struct BreakerGuardedSummarizer {
    inner: Arc<dyn RootCauseSummarizer>,
    breakers: Arc<CircuitBreakerRegistry>,
    dependency: String,
    timeout: Duration,
    fallback: Option<Arc<dyn RootCauseSummarizer>>,
}

impl BreakerGuardedSummarizer {
    pub fn new(
        inner: Arc<dyn RootCauseSummarizer>,
        breakers: Arc<CircuitBreakerRegistry>,
        dependency: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            inner,
            breakers,
            dependency: dependency.into(),
            timeout,
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn RootCauseSummarizer>) -> Self {
        self.fallback = Some(fallback);
        self
    }
}

#[async_trait]
impl RootCauseSummarizer for BreakerGuardedSummarizer {
    async fn summarize(
        &self,
        incident: &Incident,
        window: &[LogEvent],
    ) -> anyhow::Result<RootCauseAnalysis> {
        let guarded = self
            .breakers
            .call_with_timeout(&self.dependency, self.timeout, || {
                self.inner.summarize(incident, window)
            })
            .await;

        match guarded {
            Ok(analysis) => Ok(analysis),
            Err(e) => {
                let Some(fallback) = &self.fallback else {
                    return Err(anyhow::anyhow!("{e}"));
                };
                warn!(
                    dependency = %self.dependency,
                    incident_id = %incident.id,
                    error = %e,
                    "Root-cause summarizer unavailable, using fallback"
                );
                let analysis = fallback.summarize(incident, window).await?;
                debug!(incident_id = %incident.id, "Fallback root-cause analysis produced");
                Ok(analysis)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::{LogLevel, LogParser, MaskingTemplateExtractor};
    use crate::clock::ManualClock;
    use crate::config::CircuitBreakerSettings;
    use crate::incident::model::AnomalyRef;
    use chrono::Utc;

    fn events(lines: &[(&str, LogLevel)]) -> Vec<LogEvent> {
        let parser = LogParser::new(Arc::new(MaskingTemplateExtractor::new().unwrap())).unwrap();
        lines
            .iter()
            .map(|(text, level)| parser.event(text, "crm", Utc::now(), *level))
            .collect()
    }

    fn incident() -> Incident {
        Incident::open(
            "crm",
            AnomalyRef {
                window_id: "crm-000001".to_string(),
                score: 0.8,
                model_version: "keyword-v1".to_string(),
                detected_at: Utc::now(),
            },
        )
    }

    #[test]
    fn test_known_pattern_matches_error_lines() {
        let analyzer = PatternRootCauseAnalyzer::new().unwrap();
        let window = events(&[
            ("Syncing contacts", LogLevel::Info),
            ("Connection to 10.0.0.4 refused", LogLevel::Error),
        ]);

        let analysis = analyzer.analyze("crm", &window);
        assert_eq!(analysis.method, AnalysisMethod::PatternMatching);
        assert_eq!(analysis.matched_pattern.as_deref(), Some("connection_refused"));
    }

    #[test]
    fn test_dominant_error_heuristic() {
        let analyzer = PatternRootCauseAnalyzer::new().unwrap();
        let window = events(&[
            ("Invalid field mapping for deal 17", LogLevel::Error),
            ("Invalid field mapping for deal 18", LogLevel::Error),
            ("Webhook rejected", LogLevel::Error),
        ]);

        let analysis = analyzer.analyze("crm", &window);
        assert_eq!(analysis.method, AnalysisMethod::Heuristic);
        assert!(analysis
            .root_cause
            .contains("Invalid field mapping for deal <NUM>"));
        assert!(analysis.root_cause.contains("2 of 3"));
    }

    #[derive(Debug)]
    struct UnavailableSummarizer;

    #[async_trait]
    impl RootCauseSummarizer for UnavailableSummarizer {
        async fn summarize(&self, _: &Incident, _: &[LogEvent]) -> anyhow::Result<RootCauseAnalysis> {
            anyhow::bail!("LLM endpoint returned 503")
        }
    }

    #[tokio::test]
    async fn test_guarded_summarizer_trips_breaker_and_falls_back() {
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            CircuitBreakerSettings::default(),
            Arc::new(ManualClock::starting_now()),
        ));
        let guarded = BreakerGuardedSummarizer::new(
            Arc::new(UnavailableSummarizer),
            Arc::clone(&breakers),
            "llm_api",
            Duration::from_secs(5),
        )
        .with_fallback(Arc::new(PatternRootCauseAnalyzer::new().unwrap()));

        let incident = incident();
        let window = events(&[("Request timed out after 30s", LogLevel::Error)]);
        for _ in 0..6 {
            let analysis = guarded.summarize(&incident, &window).await.unwrap();
            assert_eq!(analysis.matched_pattern.as_deref(), Some("timeout"));
        }

        assert!(breakers.snapshot().open_breakers().contains(&"llm_api".to_string()));
    }
}
