//! # Incident Manager
//!
//! Opens, merges and resolves incidents from anomalous windows. All mutations
//! for one component run under that component's async mutex, so two anomalies
//! racing for the same component always end up in a single incident.
//!
//! Resolved incidents are kept for a retention period and then purged along
//! with the locks of components that have nothing active.

use dashmap::DashMap;
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::anomaly::{AnomalyScore, LogEvent};
use crate::clock::{elapsed_between, Clock};
use crate::incident::model::AnomalyRef;
use crate::incident::{Incident, IncidentError, IncidentResult, IncidentStatus, RootCauseSummarizer};
use crate::metrics;

#[derive(Debug)]
pub struct IncidentManager {
    incidents: DashMap<Uuid, Incident>,
    /// Component -> its OPEN or INVESTIGATING incident
    active: DashMap<String, Uuid>,
    component_locks: DashMap<String, Arc<Mutex<()>>>,
    summarizer: Arc<dyn RootCauseSummarizer>,
    quiet_period: Duration,
    clock: Arc<dyn Clock>,
}

impl IncidentManager {
    pub fn new(
        summarizer: Arc<dyn RootCauseSummarizer>,
        quiet_period: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            incidents: DashMap::new(),
            active: DashMap::new(),
            component_locks: DashMap::new(),
            summarizer,
            quiet_period,
            clock,
        }
    }

    fn component_lock(&self, component: &str) -> Arc<Mutex<()>> {
        if let Some(existing) = self.component_locks.get(component) {
            return Arc::clone(existing.value());
        }
        let entry = self
            .component_locks
            .entry(component.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())));
        Arc::clone(entry.value())
    }

    /// Lock a component, retrying if a purge dropped the lock we waited on
    async fn lock_component(&self, component: &str) -> OwnedMutexGuard<()> {
        loop {
            let lock = self.component_lock(component);
            let guard = Arc::clone(&lock).lock_owned().await;
            let current = self
                .component_locks
                .get(component)
                .map(|entry| Arc::ptr_eq(entry.value(), &lock))
                .unwrap_or(false);
            if current {
                return guard;
            }
        }
    }

    fn active_incident_id(&self, component: &str) -> Option<Uuid> {
        let id = self.active.get(component).map(|entry| *entry.value())?;
        let still_active = self
            .incidents
            .get(&id)
            .map(|incident| incident.status.is_active())
            .unwrap_or(false);
        still_active.then_some(id)
    }

    pub async fn on_anomaly(&self, score: &AnomalyScore, component: &str) -> IncidentResult<Incident> {
        self.on_anomaly_with_window(score, component, &[]).await
    }

    /// Merge the anomaly into the component's open incident or open a new
    /// one. Every new incident is summarised from `window` (possibly empty)
    /// and moves to INVESTIGATING once a narrative exists. An incident still
    /// OPEN because an earlier summary failed is summarised again when a
    /// later anomaly brings a window.
    pub async fn on_anomaly_with_window(
        &self,
        score: &AnomalyScore,
        component: &str,
        window: &[LogEvent],
    ) -> IncidentResult<Incident> {
        if !score.is_anomaly {
            return Err(IncidentError::NotAnomalous {
                window_id: score.window_id.clone(),
            });
        }

        let _serialized = self.lock_component(component).await;

        let anomaly = AnomalyRef {
            window_id: score.window_id.clone(),
            score: score.score,
            model_version: score.model_version.clone(),
            detected_at: self.clock.now(),
        };

        if let Some(id) = self.active_incident_id(component) {
            if let Some(mut incident) = self.incidents.get_mut(&id) {
                let previous = incident.severity;
                incident.merge(anomaly);
                info!(
                    incident_id = %id,
                    component = %component,
                    anomalies = incident.anomaly_refs.len(),
                    severity = %incident.severity,
                    "Merged anomaly into open incident"
                );
                if incident.severity > previous {
                    warn!(
                        incident_id = %id,
                        from = %previous,
                        to = %incident.severity,
                        route = ?incident.route,
                        "⬆️ Incident severity escalated"
                    );
                }
                let merged = incident.clone();
                drop(incident);

                if merged.status == IncidentStatus::Open && !window.is_empty() {
                    return Ok(self.attach_summary(merged, window).await);
                }
                return Ok(merged);
            }
        }

        let incident = Incident::open(component, anomaly);
        let id = incident.id;
        warn!(
            incident_id = %id,
            component = %component,
            severity = %incident.severity,
            route = ?incident.route,
            score = score.score,
            "🚨 Incident opened"
        );
        metrics::incidents_opened_total().add(
            1,
            &[
                KeyValue::new("component", component.to_string()),
                KeyValue::new("severity", incident.severity.as_str()),
            ],
        );
        self.incidents.insert(id, incident.clone());
        self.active.insert(component.to_string(), id);

        Ok(self.attach_summary(incident, window).await)
    }

    async fn attach_summary(&self, incident: Incident, window: &[LogEvent]) -> Incident {
        let id = incident.id;
        match self.summarizer.summarize(&incident, window).await {
            Ok(analysis) => {
                let Some(mut stored) = self.incidents.get_mut(&id) else {
                    return incident;
                };
                if stored.status == IncidentStatus::Open {
                    stored.root_cause_text = Some(analysis.root_cause);
                    stored.recommended_fix = Some(analysis.recommended_fix);
                    stored.status = IncidentStatus::Investigating;
                    info!(
                        incident_id = %id,
                        method = ?analysis.method,
                        events = window.len(),
                        "🔍 Root cause attached, incident under investigation"
                    );
                }
                stored.clone()
            }
            Err(e) => {
                warn!(
                    incident_id = %id,
                    error = %e,
                    "Root-cause summarization failed, incident stays open"
                );
                incident
            }
        }
    }

    pub async fn resolve(&self, id: Uuid, notes: &str) -> IncidentResult<Incident> {
        let component = self
            .incidents
            .get(&id)
            .map(|incident| incident.affected_component.clone())
            .ok_or(IncidentError::NotFound { incident_id: id })?;

        let _serialized = self.lock_component(&component).await;
        self.resolve_locked(id, notes)
    }

    fn resolve_locked(&self, id: Uuid, notes: &str) -> IncidentResult<Incident> {
        let mut incident = self
            .incidents
            .get_mut(&id)
            .ok_or(IncidentError::NotFound { incident_id: id })?;

        if incident.status == IncidentStatus::Resolved {
            return Err(IncidentError::AlreadyResolved { incident_id: id });
        }

        incident.status = IncidentStatus::Resolved;
        incident.resolved_at = Some(self.clock.now());
        incident.resolution_notes = Some(notes.to_string());
        let resolved = incident.clone();
        drop(incident);

        self.active
            .remove_if(&resolved.affected_component, |_, active_id| *active_id == id);

        info!(
            incident_id = %id,
            component = %resolved.affected_component,
            anomalies = resolved.anomaly_refs.len(),
            "✅ Incident resolved"
        );
        Ok(resolved)
    }

    /// Resolve every active incident with no anomaly for the quiet period
    pub async fn auto_resolve_quiet(&self) -> Vec<Incident> {
        let now = self.clock.now();
        let quiet: Vec<(Uuid, String)> = self
            .incidents
            .iter()
            .filter(|entry| {
                entry.status.is_active()
                    && elapsed_between(entry.last_anomaly_at, now) >= self.quiet_period
            })
            .map(|entry| (entry.id, entry.affected_component.clone()))
            .collect();

        let notes = format!(
            "Auto-resolved after {}s without new anomalies",
            self.quiet_period.as_secs()
        );

        let mut resolved = Vec::new();
        for (id, component) in quiet {
            let _serialized = self.lock_component(&component).await;

            // An anomaly may have merged while we waited for the lock
            let still_quiet = self
                .incidents
                .get(&id)
                .map(|incident| {
                    incident.status.is_active()
                        && elapsed_between(incident.last_anomaly_at, self.clock.now())
                            >= self.quiet_period
                })
                .unwrap_or(false);
            if !still_quiet {
                continue;
            }

            match self.resolve_locked(id, &notes) {
                Ok(incident) => resolved.push(incident),
                Err(e) => warn!(incident_id = %id, error = %e, "Auto-resolve skipped"),
            }
        }
        resolved
    }

    /// Drop resolved incidents older than `retention`, then the locks of
    /// components with no active incident. Returns the incidents removed.
    pub fn purge_resolved_older_than(&self, retention: Duration) -> usize {
        let now = self.clock.now();
        let before = self.incidents.len();
        self.incidents.retain(|_, incident| match incident.resolved_at {
            Some(resolved_at) if incident.status == IncidentStatus::Resolved => {
                elapsed_between(resolved_at, now) < retention
            }
            _ => true,
        });
        let purged = before.saturating_sub(self.incidents.len());

        // A held lock means a mutation is in flight for that component
        self.component_locks.retain(|component, lock| {
            self.active.contains_key(component) || lock.try_lock().is_err()
        });

        if purged > 0 {
            info!(
                purged = purged,
                retained = self.incidents.len(),
                retention_secs = retention.as_secs(),
                "🧹 Purged resolved incidents"
            );
        } else {
            debug!(retained = self.incidents.len(), "No resolved incidents past retention");
        }
        purged
    }

    pub fn get(&self, id: Uuid) -> Option<Incident> {
        self.incidents.get(&id).map(|incident| incident.clone())
    }

    pub fn active_for(&self, component: &str) -> Option<Incident> {
        self.active_incident_id(component).and_then(|id| self.get(id))
    }

    /// Incidents filtered by status, newest first
    pub fn list(&self, status: Option<IncidentStatus>) -> Vec<Incident> {
        let mut incidents: Vec<Incident> = self
            .incidents
            .iter()
            .filter(|entry| status.map(|s| entry.status == s).unwrap_or(true))
            .map(|entry| entry.value().clone())
            .collect();
        incidents.sort_by(|a, b| b.opened_at.cmp(&a.opened_at));
        incidents
    }

    pub fn active_count(&self) -> usize {
        self.incidents
            .iter()
            .filter(|entry| entry.status.is_active())
            .count()
    }

    pub fn len(&self) -> usize {
        self.incidents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.incidents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::{LogLevel, LogParser, MaskingTemplateExtractor};
    use crate::clock::ManualClock;
    use crate::incident::{PatternRootCauseAnalyzer, RootCauseAnalysis, Severity};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager() -> (Arc<IncidentManager>, ManualClock) {
        let clock = ManualClock::starting_now();
        let manager = IncidentManager::new(
            Arc::new(PatternRootCauseAnalyzer::new().unwrap()),
            Duration::from_secs(1800),
            Arc::new(clock.clone()),
        );
        (Arc::new(manager), clock)
    }

    fn anomaly(window_id: &str, score: f64) -> AnomalyScore {
        AnomalyScore {
            window_id: window_id.to_string(),
            partition: "scraper".to_string(),
            sequence_of_template_ids: vec![],
            score,
            threshold: 0.5,
            is_anomaly: score > 0.5,
            model_version: "keyword-v1".to_string(),
            scored_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_two_anomalies_merge_into_one_incident() {
        let (manager, _clock) = manager();

        let first = manager.on_anomaly(&anomaly("w1", 0.8), "scraper").await.unwrap();
        let second = manager.on_anomaly(&anomaly("w2", 0.7), "scraper").await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.anomaly_refs.len(), 2);
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn test_severity_never_decreases_while_open() {
        let (manager, _clock) = manager();

        manager.on_anomaly(&anomaly("w1", 0.93), "crm").await.unwrap();
        let merged = manager.on_anomaly(&anomaly("w2", 0.55), "crm").await.unwrap();

        assert_eq!(merged.severity, Severity::Critical);
        assert_eq!(merged.peak_score, 0.93);
    }

    #[tokio::test]
    async fn test_severity_escalates_on_higher_score() {
        let (manager, _clock) = manager();

        let opened = manager.on_anomaly(&anomaly("w1", 0.6), "crm").await.unwrap();
        assert_eq!(opened.severity, Severity::Medium);
        let merged = manager.on_anomaly(&anomaly("w2", 0.91), "crm").await.unwrap();
        assert_eq!(merged.severity, Severity::Critical);
    }

    #[tokio::test]
    async fn test_non_anomalous_score_is_rejected() {
        let (manager, _clock) = manager();
        let result = manager.on_anomaly(&anomaly("w1", 0.2), "crm").await;
        assert!(matches!(result, Err(IncidentError::NotAnomalous { .. })));
    }

    #[tokio::test]
    async fn test_components_get_separate_incidents() {
        let (manager, _clock) = manager();
        let a = manager.on_anomaly(&anomaly("w1", 0.8), "crm").await.unwrap();
        let b = manager.on_anomaly(&anomaly("w2", 0.8), "llm").await.unwrap();
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn test_resolved_incident_does_not_accept_merges() {
        let (manager, _clock) = manager();
        let first = manager.on_anomaly(&anomaly("w1", 0.8), "crm").await.unwrap();

        let resolved = manager.resolve(first.id, "Rotated CRM token").await.unwrap();
        assert_eq!(resolved.status, IncidentStatus::Resolved);
        assert_eq!(resolved.resolution_notes.as_deref(), Some("Rotated CRM token"));

        let next = manager.on_anomaly(&anomaly("w2", 0.8), "crm").await.unwrap();
        assert_ne!(next.id, first.id);
        assert_eq!(manager.get(first.id).unwrap().anomaly_refs.len(), 1);
        assert!(matches!(
            manager.resolve(first.id, "again").await,
            Err(IncidentError::AlreadyResolved { .. })
        ));
        assert!(matches!(
            manager.resolve(Uuid::new_v4(), "?").await,
            Err(IncidentError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_window_summary_moves_incident_to_investigating() {
        let (manager, _clock) = manager();
        let parser = LogParser::new(Arc::new(MaskingTemplateExtractor::new().unwrap())).unwrap();
        let window = vec![parser.event(
            "write failed: No space left on device",
            "scraper",
            Utc::now(),
            LogLevel::Error,
        )];

        let incident = manager
            .on_anomaly_with_window(&anomaly("w1", 0.8), "scraper", &window)
            .await
            .unwrap();

        assert_eq!(incident.status, IncidentStatus::Investigating);
        assert!(incident.root_cause_text.unwrap().contains("Disk is full"));
    }

    #[derive(Debug)]
    struct BrokenSummarizer;

    #[async_trait]
    impl RootCauseSummarizer for BrokenSummarizer {
        async fn summarize(&self, _: &Incident, _: &[LogEvent]) -> anyhow::Result<RootCauseAnalysis> {
            anyhow::bail!("summarizer offline")
        }
    }

    #[tokio::test]
    async fn test_failed_summary_leaves_incident_open() {
        let clock = ManualClock::starting_now();
        let manager = IncidentManager::new(
            Arc::new(BrokenSummarizer),
            Duration::from_secs(60),
            Arc::new(clock),
        );
        let parser = LogParser::new(Arc::new(MaskingTemplateExtractor::new().unwrap())).unwrap();
        let window = vec![parser.event("boom", "crm", Utc::now(), LogLevel::Error)];

        let incident = manager
            .on_anomaly_with_window(&anomaly("w1", 0.8), "crm", &window)
            .await
            .unwrap();
        assert_eq!(incident.status, IncidentStatus::Open);
        assert!(incident.root_cause_text.is_none());
    }

    #[tokio::test]
    async fn test_anomaly_without_window_is_still_summarised() {
        let (manager, _clock) = manager();

        let incident = manager.on_anomaly(&anomaly("w1", 0.8), "crm").await.unwrap();

        assert_eq!(incident.status, IncidentStatus::Investigating);
        assert!(incident
            .root_cause_text
            .unwrap()
            .contains("Unusual log sequence in crm"));
        assert_eq!(incident.recommended_fix.as_deref(), Some("Manual investigation required"));
    }

    /// Fails its first call, then delegates to the pattern analyzer
    #[derive(Debug)]
    struct RecoveringSummarizer {
        calls: AtomicUsize,
        inner: PatternRootCauseAnalyzer,
    }

    #[async_trait]
    impl RootCauseSummarizer for RecoveringSummarizer {
        async fn summarize(&self, incident: &Incident, window: &[LogEvent]) -> anyhow::Result<RootCauseAnalysis> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("summarizer warming up");
            }
            self.inner.summarize(incident, window).await
        }
    }

    #[tokio::test]
    async fn test_open_incident_is_summarised_when_a_later_window_arrives() {
        let summarizer = Arc::new(RecoveringSummarizer {
            calls: AtomicUsize::new(0),
            inner: PatternRootCauseAnalyzer::new().unwrap(),
        });
        let manager = IncidentManager::new(
            summarizer.clone(),
            Duration::from_secs(1800),
            Arc::new(ManualClock::starting_now()),
        );
        let parser = LogParser::new(Arc::new(MaskingTemplateExtractor::new().unwrap())).unwrap();
        let window = vec![parser.event("upstream timed out", "crm", Utc::now(), LogLevel::Error)];

        let opened = manager.on_anomaly(&anomaly("w1", 0.8), "crm").await.unwrap();
        assert_eq!(opened.status, IncidentStatus::Open);

        // Merging without a window does not retry the summary
        manager.on_anomaly(&anomaly("w2", 0.8), "crm").await.unwrap();
        assert_eq!(summarizer.calls.load(Ordering::SeqCst), 1);

        let merged = manager
            .on_anomaly_with_window(&anomaly("w3", 0.8), "crm", &window)
            .await
            .unwrap();
        assert_eq!(merged.id, opened.id);
        assert_eq!(merged.status, IncidentStatus::Investigating);
        assert!(merged.root_cause_text.unwrap().contains("timeout"));
        assert_eq!(merged.anomaly_refs.len(), 3);

        // Already investigating, so no further summaries
        manager
            .on_anomaly_with_window(&anomaly("w4", 0.8), "crm", &window)
            .await
            .unwrap();
        assert_eq!(summarizer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_resolved_incidents_are_purged_after_retention() {
        let (manager, clock) = manager();
        let old = manager.on_anomaly(&anomaly("w1", 0.8), "crm").await.unwrap();
        manager.resolve(old.id, "fixed").await.unwrap();
        clock.advance(Duration::from_secs(3600));
        let recent = manager.on_anomaly(&anomaly("w2", 0.8), "llm").await.unwrap();
        manager.resolve(recent.id, "fixed").await.unwrap();
        let active = manager.on_anomaly(&anomaly("w3", 0.8), "slack").await.unwrap();
        assert_eq!(manager.component_locks.len(), 3);

        clock.advance(Duration::from_secs(1800));
        let purged = manager.purge_resolved_older_than(Duration::from_secs(3000));

        assert_eq!(purged, 1);
        assert!(manager.get(old.id).is_none());
        assert!(manager.get(recent.id).is_some());
        assert!(manager.get(active.id).is_some());
        assert_eq!(manager.component_locks.len(), 1);
        assert!(manager.component_locks.contains_key("slack"));
    }

    #[tokio::test]
    async fn test_purged_component_lock_is_recreated_on_next_anomaly() {
        let (manager, _clock) = manager();
        let first = manager.on_anomaly(&anomaly("w1", 0.8), "crm").await.unwrap();
        manager.resolve(first.id, "fixed").await.unwrap();

        let stale = manager.component_lock("crm");
        manager.purge_resolved_older_than(Duration::from_secs(3600));
        assert!(!manager.component_locks.contains_key("crm"));

        let next = manager.on_anomaly(&anomaly("w2", 0.8), "crm").await.unwrap();
        assert_ne!(next.id, first.id);
        let current = manager.component_lock("crm");
        assert!(!Arc::ptr_eq(&stale, &current));
    }

    #[tokio::test]
    async fn test_quiet_incidents_auto_resolve() {
        let (manager, clock) = manager();
        let quiet = manager.on_anomaly(&anomaly("w1", 0.8), "crm").await.unwrap();
        clock.advance(Duration::from_secs(1000));
        let noisy = manager.on_anomaly(&anomaly("w2", 0.8), "llm").await.unwrap();
        clock.advance(Duration::from_secs(900));

        let resolved = manager.auto_resolve_quiet().await;

        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].id, quiet.id);
        assert!(manager.get(noisy.id).unwrap().status.is_active());
        assert!(manager.active_for("crm").is_none());
    }

    #[tokio::test]
    async fn test_concurrent_anomalies_never_duplicate() {
        let (manager, _clock) = manager();
        let mut handles = Vec::new();
        for i in 0..16 {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move {
                manager
                    .on_anomaly(&anomaly(&format!("w{i}"), 0.8), "notion")
                    .await
                    .unwrap()
                    .id
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(manager.get(ids[0]).unwrap().anomaly_refs.len(), 16);
    }
}
