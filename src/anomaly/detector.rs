//! # Log Anomaly Detector
//!
//! Groups incoming events into per-partition windows and scores each window
//! once it is full. Partitions are keyed by source component and each has its
//! own lock, so ingestion for different components proceeds in parallel and
//! windows never interleave. Partitions that stop receiving events are evicted
//! by [`LogAnomalyDetector::evict_idle`], dropping any partial window.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::anomaly::event::LogEvent;
use crate::anomaly::scorer::Scorer;
use crate::anomaly::template::TemplateId;
use crate::anomaly::window::{Window, WindowBuffer};
use crate::clock::{elapsed_between, Clock};
use crate::config::AnomalyDetectionConfig;
use crate::constants;
use crate::metrics;

/// Score of one completed window. Never recomputed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyScore {
    pub window_id: String,
    pub partition: String,
    pub sequence_of_template_ids: Vec<TemplateId>,
    pub score: f64,
    pub threshold: f64,
    pub is_anomaly: bool,
    pub model_version: String,
    pub scored_at: DateTime<Utc>,
}

/// A completed window together with its score
#[derive(Debug, Clone)]
pub struct WindowEvaluation {
    pub window: Window,
    pub score: AnomalyScore,
}

#[derive(Debug)]
pub struct LogAnomalyDetector {
    scorer: Arc<dyn Scorer>,
    window_size: usize,
    threshold: f64,
    history_limit: usize,
    partitions: DashMap<String, Arc<Mutex<WindowBuffer>>>,
    anomalies: Mutex<VecDeque<AnomalyScore>>,
    clock: Arc<dyn Clock>,
}

impl LogAnomalyDetector {
    /// Threshold precedence: configured value, then the scorer's calibration,
    /// then 0.5.
    pub fn new(config: &AnomalyDetectionConfig, scorer: Arc<dyn Scorer>, clock: Arc<dyn Clock>) -> Self {
        let threshold = config
            .anomaly_threshold
            .or_else(|| scorer.calibrated_threshold())
            .unwrap_or(constants::DEFAULT_ANOMALY_THRESHOLD);

        debug!(
            model_version = %scorer.model_version(),
            window_size = config.window_size,
            threshold = threshold,
            "Initialized log anomaly detector"
        );

        Self {
            scorer,
            window_size: config.window_size,
            threshold,
            history_limit: config.history_limit,
            partitions: DashMap::new(),
            anomalies: Mutex::new(VecDeque::new()),
            clock,
        }
    }

    fn partition(&self, name: &str) -> Arc<Mutex<WindowBuffer>> {
        if let Some(existing) = self.partitions.get(name) {
            return Arc::clone(existing.value());
        }
        let entry = self
            .partitions
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(WindowBuffer::new(name, self.window_size))));
        Arc::clone(entry.value())
    }

    fn holds_partition(&self, name: &str, partition: &Arc<Mutex<WindowBuffer>>) -> bool {
        self.partitions
            .get(name)
            .map(|entry| Arc::ptr_eq(entry.value(), partition))
            .unwrap_or(false)
    }

    /// Buffer an event; scores and returns the window it completes, if any
    pub fn ingest(&self, event: LogEvent) -> Option<WindowEvaluation> {
        let completed = loop {
            let partition = self.partition(&event.source_component);
            let mut buffer = partition.lock();
            // Evicted between lookup and lock
            if !self.holds_partition(&event.source_component, &partition) {
                continue;
            }
            buffer.touch(self.clock.now());
            break buffer.push(event);
        }?;

        let score = self.score_window(&completed)?;
        if score.is_anomaly {
            self.remember(score.clone());
        }
        Some(WindowEvaluation {
            window: completed,
            score,
        })
    }

    pub fn ingest_batch<I>(&self, events: I) -> Vec<WindowEvaluation>
    where
        I: IntoIterator<Item = LogEvent>,
    {
        events
            .into_iter()
            .filter_map(|event| self.ingest(event))
            .collect()
    }

    /// Score a window. Incomplete windows are never scored.
    pub fn score_window(&self, window: &Window) -> Option<AnomalyScore> {
        if window.len() < self.window_size {
            debug!(
                window_id = %window.window_id,
                events = window.len(),
                window_size = self.window_size,
                "Deferring incomplete window"
            );
            return None;
        }

        let raw = self.scorer.score(window);
        let score = if raw.is_finite() { raw.clamp(0.0, 1.0) } else { 0.0 };
        let is_anomaly = score > self.threshold;
        let model_version = self.scorer.model_version().to_string();

        metrics::anomaly_windows_scored_total()
            .add(1, &[KeyValue::new("partition", window.partition.clone())]);
        if is_anomaly {
            metrics::anomalies_detected_total()
                .add(1, &[KeyValue::new("partition", window.partition.clone())]);
            warn!(
                window_id = %window.window_id,
                partition = %window.partition,
                score = score,
                threshold = self.threshold,
                model_version = %model_version,
                "🚨 Anomalous log window detected"
            );
        }

        Some(AnomalyScore {
            window_id: window.window_id.clone(),
            partition: window.partition.clone(),
            sequence_of_template_ids: window.template_ids(),
            score,
            threshold: self.threshold,
            is_anomaly,
            model_version,
            scored_at: self.clock.now(),
        })
    }

    fn remember(&self, score: AnomalyScore) {
        let mut anomalies = self.anomalies.lock();
        anomalies.push_front(score);
        anomalies.truncate(self.history_limit);
    }

    /// Most recent anomalous windows, newest first
    pub fn recent_anomalies(&self, limit: usize) -> Vec<AnomalyScore> {
        self.anomalies.lock().iter().take(limit).cloned().collect()
    }

    /// Events buffered for a partition's next window
    pub fn pending(&self, partition: &str) -> usize {
        self.partitions
            .get(partition)
            .map(|entry| entry.value().lock().pending())
            .unwrap_or(0)
    }

    /// Remove partitions with no event for `idle`. Partitions locked by an
    /// ingest in progress are kept. Returns the number evicted.
    pub fn evict_idle(&self, idle: Duration) -> usize {
        let now = self.clock.now();
        let before = self.partitions.len();
        self.partitions.retain(|name, partition| {
            let Some(buffer) = partition.try_lock() else {
                return true;
            };
            let is_idle = buffer
                .last_active()
                .map(|at| elapsed_between(at, now) >= idle)
                .unwrap_or(true);
            if is_idle && buffer.pending() > 0 {
                debug!(
                    partition = %name,
                    dropped_events = buffer.pending(),
                    "Dropping partial window of idle partition"
                );
            }
            !is_idle
        });

        let evicted = before.saturating_sub(self.partitions.len());
        if evicted > 0 {
            info!(
                evicted = evicted,
                remaining = self.partitions.len(),
                idle_secs = idle.as_secs(),
                "🧹 Evicted idle log partitions"
            );
        }
        evicted
    }

    pub fn partitions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.partitions.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn model_version(&self) -> &str {
        self.scorer.model_version()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::event::{LogLevel, LogParser};
    use crate::anomaly::scorer::KeywordScorer;
    use crate::anomaly::template::MaskingTemplateExtractor;
    use crate::clock::ManualClock;

    fn setup(window_size: usize) -> (LogAnomalyDetector, LogParser) {
        let config = AnomalyDetectionConfig {
            window_size,
            history_limit: 3,
            ..AnomalyDetectionConfig::default()
        };
        let detector = LogAnomalyDetector::new(
            &config,
            Arc::new(KeywordScorer),
            Arc::new(ManualClock::starting_now()),
        );
        let parser = LogParser::new(Arc::new(MaskingTemplateExtractor::new().unwrap())).unwrap();
        (detector, parser)
    }

    fn event(parser: &LogParser, text: &str, source: &str) -> LogEvent {
        parser.event(text, source, Utc::now(), LogLevel::Info)
    }

    #[test]
    fn test_incomplete_window_is_buffered_not_scored() {
        let (detector, parser) = setup(4);
        for i in 0..3 {
            assert!(detector.ingest(event(&parser, &format!("error {i}"), "crm")).is_none());
        }
        assert_eq!(detector.pending("crm"), 3);

        let partial = Window::new("manual", "crm", 4, vec![event(&parser, "error", "crm")]);
        assert!(detector.score_window(&partial).is_none());
    }

    #[test]
    fn test_full_window_is_scored_against_threshold() {
        let (detector, parser) = setup(3);
        let lines = ["Request failed", "Request failed", "timeout talking to CRM"];

        let evaluations = detector.ingest_batch(lines.iter().map(|l| event(&parser, l, "crm")));

        assert_eq!(evaluations.len(), 1);
        let score = &evaluations[0].score;
        assert!((score.score - 0.9).abs() < 1e-9);
        assert_eq!(score.threshold, 0.5);
        assert!(score.is_anomaly);
        assert_eq!(score.model_version, KeywordScorer::MODEL_VERSION);
        assert_eq!(detector.recent_anomalies(10).len(), 1);
        assert_eq!(detector.pending("crm"), 0);
    }

    #[test]
    fn test_partitions_do_not_interleave() {
        let (detector, parser) = setup(2);
        assert!(detector.ingest(event(&parser, "a", "api")).is_none());
        assert!(detector.ingest(event(&parser, "b", "worker")).is_none());

        let completed = detector.ingest(event(&parser, "c", "api")).unwrap();
        assert_eq!(completed.window.partition, "api");
        assert_eq!(detector.pending("worker"), 1);
        assert_eq!(detector.partitions(), vec!["api", "worker"]);
    }

    #[test]
    fn test_same_window_same_score() {
        let (detector, parser) = setup(2);
        let window = Window::new(
            "w",
            "api",
            2,
            vec![event(&parser, "slow response", "api"), event(&parser, "fatal", "api")],
        );

        let first = detector.score_window(&window).unwrap();
        let second = detector.score_window(&window).unwrap();
        assert_eq!(first.score.to_bits(), second.score.to_bits());
        assert_eq!(first.sequence_of_template_ids, second.sequence_of_template_ids);
    }

    #[test]
    fn test_anomaly_history_is_bounded() {
        let (detector, parser) = setup(2);
        for i in 0..5 {
            let source = format!("svc{i}");
            detector.ingest(event(&parser, "ERROR one", &source));
            detector.ingest(event(&parser, "ERROR two", &source));
        }

        let recent = detector.recent_anomalies(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].partition, "svc4");
    }

    #[test]
    fn test_idle_partitions_are_evicted() {
        let config = AnomalyDetectionConfig {
            window_size: 3,
            ..AnomalyDetectionConfig::default()
        };
        let clock = ManualClock::starting_now();
        let detector = LogAnomalyDetector::new(&config, Arc::new(KeywordScorer), Arc::new(clock.clone()));
        let parser = LogParser::new(Arc::new(MaskingTemplateExtractor::new().unwrap())).unwrap();

        detector.ingest(event(&parser, "a", "batch-2024-01"));
        detector.ingest(event(&parser, "b", "batch-2024-01"));
        clock.advance(Duration::from_secs(1800));
        detector.ingest(event(&parser, "c", "api"));
        clock.advance(Duration::from_secs(1800));

        assert_eq!(detector.evict_idle(Duration::from_secs(3600)), 1);
        assert_eq!(detector.partitions(), vec!["api"]);
        assert_eq!(detector.pending("batch-2024-01"), 0);

        // A returning component starts a fresh window
        assert!(detector.ingest(event(&parser, "d", "batch-2024-01")).is_none());
        assert_eq!(detector.pending("batch-2024-01"), 1);
    }

    #[test]
    fn test_locked_partition_survives_eviction() {
        let (detector, parser) = setup(3);
        detector.ingest(event(&parser, "a", "api"));
        let partition = detector.partition("api");
        let _held = partition.lock();

        assert_eq!(detector.evict_idle(Duration::ZERO), 0);
        assert_eq!(detector.partitions(), vec!["api"]);
    }

    #[test]
    fn test_configured_threshold_wins() {
        let config = AnomalyDetectionConfig {
            anomaly_threshold: Some(0.95),
            ..AnomalyDetectionConfig::default()
        };
        let detector = LogAnomalyDetector::new(
            &config,
            Arc::new(KeywordScorer),
            Arc::new(ManualClock::starting_now()),
        );
        assert_eq!(detector.threshold(), 0.95);
    }
}
