//! # Backpressure Controller
//!
//! Tracks per-queue depth against a high and a low watermark and decides
//! whether new work may be admitted. Distinct watermarks give hysteresis:
//!
//! - `NORMAL -> THROTTLED` when `depth / capacity >= high_watermark_ratio`
//! - `THROTTLED -> REJECTING` when `depth / capacity >= 1.0`
//! - `THROTTLED | REJECTING -> NORMAL` when `depth / capacity <= low_watermark_ratio`
//!
//! Every queue has its own mutex inside a `DashMap`; queues never contend.

use dashmap::DashMap;
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{BackpressureConfig, QueueCapacityConfig};
use crate::metrics;

#[derive(Debug, Error)]
pub enum BackpressureError {
    #[error("Queue '{queue}' is rejecting new work ({depth}/{capacity})")]
    Rejected {
        queue: String,
        depth: u64,
        capacity: u64,
    },

    #[error("Timed out after {waited:?} waiting for capacity on queue '{queue}'")]
    Timeout { queue: String, waited: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdmissionMode {
    Normal,
    Throttled,
    Rejecting,
}

impl fmt::Display for AdmissionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AdmissionMode::Normal => "NORMAL",
            AdmissionMode::Throttled => "THROTTLED",
            AdmissionMode::Rejecting => "REJECTING",
        };
        f.write_str(name)
    }
}

/// Outcome of a non-blocking admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    Admit,
    /// Admit after waiting the recommended delay
    Delay(Duration),
    Reject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueAdmissionState {
    pub queue_name: String,
    pub current_depth: u64,
    pub capacity: u64,
    pub high_watermark_ratio: f64,
    pub low_watermark_ratio: f64,
    pub mode: AdmissionMode,
}

impl QueueAdmissionState {
    fn new(queue_name: &str, settings: &QueueCapacityConfig) -> Self {
        Self {
            queue_name: queue_name.to_string(),
            current_depth: 0,
            capacity: settings.capacity,
            high_watermark_ratio: settings.high_watermark_ratio,
            low_watermark_ratio: settings.low_watermark_ratio,
            mode: AdmissionMode::Normal,
        }
    }

    pub fn ratio(&self) -> f64 {
        if self.capacity == 0 {
            return 1.0;
        }
        self.current_depth as f64 / self.capacity as f64
    }

    fn next_mode(&self) -> AdmissionMode {
        let ratio = self.ratio();
        match self.mode {
            AdmissionMode::Normal if ratio >= self.high_watermark_ratio => AdmissionMode::Throttled,
            AdmissionMode::Throttled if ratio >= 1.0 => AdmissionMode::Rejecting,
            AdmissionMode::Throttled | AdmissionMode::Rejecting
                if ratio <= self.low_watermark_ratio =>
            {
                AdmissionMode::Normal
            }
            mode => mode,
        }
    }

    /// Apply transitions until the mode is stable; returns `(from, to)` on change
    fn reevaluate(&mut self) -> Option<(AdmissionMode, AdmissionMode)> {
        let from = self.mode;
        loop {
            let next = self.next_mode();
            if next == self.mode {
                break;
            }
            self.mode = next;
        }
        (from != self.mode).then_some((from, self.mode))
    }
}

#[derive(Debug)]
pub struct BackpressureController {
    queues: DashMap<String, Arc<Mutex<QueueAdmissionState>>>,
    config: BackpressureConfig,
}

impl BackpressureController {
    /// Create a controller with every configured queue registered
    pub fn new(config: BackpressureConfig) -> Self {
        let controller = Self {
            queues: DashMap::new(),
            config,
        };
        let configured: Vec<String> = controller.config.queues.keys().cloned().collect();
        for name in &configured {
            controller.queue(name);
        }
        controller
    }

    fn queue(&self, name: &str) -> Arc<Mutex<QueueAdmissionState>> {
        if let Some(existing) = self.queues.get(name) {
            return Arc::clone(existing.value());
        }
        let entry = self.queues.entry(name.to_string()).or_insert_with(|| {
            let settings = self.config.config_for_queue(name);
            Arc::new(Mutex::new(QueueAdmissionState::new(name, settings)))
        });
        Arc::clone(entry.value())
    }

    fn update<F>(&self, name: &str, apply: F) -> AdmissionMode
    where
        F: FnOnce(&mut QueueAdmissionState),
    {
        let handle = self.queue(name);
        let mut state = handle.lock();
        apply(&mut state);

        if let Some((from, to)) = state.reevaluate() {
            let log = |message: &str| {
                info!(
                    queue = %name,
                    from = %from,
                    to = %to,
                    depth = state.current_depth,
                    capacity = state.capacity,
                    "{}",
                    message
                )
            };
            match to {
                AdmissionMode::Normal => log("✅ Backpressure released"),
                AdmissionMode::Throttled => log("🐢 Backpressure throttling queue"),
                AdmissionMode::Rejecting => {
                    warn!(
                        queue = %name,
                        depth = state.current_depth,
                        capacity = state.capacity,
                        "🚫 Backpressure rejecting new work"
                    );
                }
            }
        }
        state.mode
    }

    pub fn record_enqueue(&self, name: &str) -> AdmissionMode {
        self.update(name, |state| state.current_depth += 1)
    }

    /// Decrement depth, saturating at zero
    pub fn record_dequeue(&self, name: &str) -> AdmissionMode {
        self.update(name, |state| {
            if state.current_depth == 0 {
                warn!(queue = %state.queue_name, "Dequeue recorded on an empty queue");
            }
            state.current_depth = state.current_depth.saturating_sub(1);
        })
    }

    /// Replace the tracked depth with an externally observed one
    pub fn set_depth(&self, name: &str, depth: u64) -> AdmissionMode {
        self.update(name, |state| state.current_depth = depth)
    }

    pub fn state(&self, name: &str) -> QueueAdmissionState {
        self.queue(name).lock().clone()
    }

    /// All tracked queues, ordered by name
    pub fn snapshot(&self) -> Vec<QueueAdmissionState> {
        let mut states: Vec<QueueAdmissionState> = self
            .queues
            .iter()
            .map(|entry| entry.value().lock().clone())
            .collect();
        states.sort_by(|a, b| a.queue_name.cmp(&b.queue_name));
        states
    }

    /// Delay grows linearly from the base delay at the high watermark to the
    /// max delay at full capacity.
    pub fn recommended_delay(&self, state: &QueueAdmissionState) -> Duration {
        let base = self.config.throttle_base_delay();
        let max = self.config.throttle_max_delay();
        let span = 1.0 - state.high_watermark_ratio;
        let factor = if span <= f64::EPSILON {
            1.0
        } else {
            ((state.ratio() - state.high_watermark_ratio) / span).clamp(0.0, 1.0)
        };
        base + (max.saturating_sub(base)).mul_f64(factor)
    }

    /// Non-blocking admission check
    pub fn try_admit(&self, name: &str) -> AdmissionDecision {
        let state = self.state(name);
        match state.mode {
            AdmissionMode::Normal => AdmissionDecision::Admit,
            AdmissionMode::Throttled => AdmissionDecision::Delay(self.recommended_delay(&state)),
            AdmissionMode::Rejecting => {
                metrics::backpressure_rejections_total()
                    .add(1, &[KeyValue::new("queue", name.to_string())]);
                debug!(
                    queue = %name,
                    depth = state.current_depth,
                    capacity = state.capacity,
                    "Admission rejected"
                );
                AdmissionDecision::Reject
            }
        }
    }

    /// `true` in NORMAL; in THROTTLED waits the recommended delay, then admits
    /// unless the queue has started rejecting; `false` in REJECTING.
    pub async fn should_admit(&self, name: &str) -> bool {
        match self.try_admit(name) {
            AdmissionDecision::Admit => true,
            AdmissionDecision::Reject => false,
            AdmissionDecision::Delay(delay) => {
                debug!(queue = %name, delay_ms = delay.as_millis() as u64, "Throttled admission");
                tokio::time::sleep(delay).await;
                self.try_admit(name) != AdmissionDecision::Reject
            }
        }
    }

    /// [`should_admit`](Self::should_admit) as a `Result`
    pub async fn admit(&self, name: &str) -> Result<(), BackpressureError> {
        if self.should_admit(name).await {
            return Ok(());
        }
        let state = self.state(name);
        Err(BackpressureError::Rejected {
            queue: name.to_string(),
            depth: state.current_depth,
            capacity: state.capacity,
        })
    }

    /// Wait until the queue stops rejecting, polling every `check_interval`
    pub async fn wait_for_admission(
        &self,
        name: &str,
        max_wait: Duration,
    ) -> Result<(), BackpressureError> {
        let started = tokio::time::Instant::now();
        let check_interval = self.config.check_interval();

        loop {
            let waited = started.elapsed();
            match self.try_admit(name) {
                AdmissionDecision::Admit => return Ok(()),
                AdmissionDecision::Delay(delay) => {
                    tokio::time::sleep(delay.min(max_wait.saturating_sub(waited))).await;
                    return Ok(());
                }
                AdmissionDecision::Reject => {
                    if waited >= max_wait {
                        warn!(
                            queue = %name,
                            waited_ms = waited.as_millis() as u64,
                            "Gave up waiting for queue capacity"
                        );
                        return Err(BackpressureError::Timeout {
                            queue: name.to_string(),
                            waited,
                        });
                    }
                    debug!(queue = %name, waited_ms = waited.as_millis() as u64, "Waiting for queue capacity");
                    tokio::time::sleep(check_interval.min(max_wait - waited)).await;
                }
            }
        }
    }

    pub fn config(&self) -> &BackpressureConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn controller() -> BackpressureController {
        let mut config = BackpressureConfig {
            throttle_base_delay_ms: 100,
            throttle_max_delay_ms: 1_000,
            check_interval_ms: 50,
            ..BackpressureConfig::default()
        };
        config.default = QueueCapacityConfig {
            capacity: 100,
            high_watermark_ratio: 0.8,
            low_watermark_ratio: 0.3,
        };
        config.queues.clear();
        BackpressureController::new(config)
    }

    fn fill(controller: &BackpressureController, queue: &str, depth: u64) -> AdmissionMode {
        let mut mode = controller.state(queue).mode;
        while controller.state(queue).current_depth < depth {
            mode = controller.record_enqueue(queue);
        }
        while controller.state(queue).current_depth > depth {
            mode = controller.record_dequeue(queue);
        }
        mode
    }

    #[test]
    fn test_watermark_transitions() {
        let controller = controller();
        let q = "scraper_queue";

        assert_eq!(fill(&controller, q, 79), AdmissionMode::Normal);
        assert_eq!(fill(&controller, q, 80), AdmissionMode::Throttled);
        assert_eq!(fill(&controller, q, 99), AdmissionMode::Throttled);
        assert_eq!(fill(&controller, q, 100), AdmissionMode::Rejecting);
        assert_eq!(fill(&controller, q, 81), AdmissionMode::Rejecting);
        assert_eq!(fill(&controller, q, 31), AdmissionMode::Rejecting);
        assert_eq!(fill(&controller, q, 30), AdmissionMode::Normal);
    }

    #[test]
    fn test_no_oscillation_around_high_watermark() {
        let controller = controller();
        let q = "notification_queue";
        fill(&controller, q, 81);

        for _ in 0..5 {
            assert_eq!(fill(&controller, q, 79), AdmissionMode::Throttled);
            assert_eq!(fill(&controller, q, 81), AdmissionMode::Throttled);
        }
    }

    #[test]
    fn test_jump_to_full_rejects_immediately() {
        let controller = controller();
        assert_eq!(controller.set_depth("ai", 150), AdmissionMode::Rejecting);
        assert_eq!(controller.try_admit("ai"), AdmissionDecision::Reject);
    }

    #[test]
    fn test_dequeue_saturates_at_zero() {
        let controller = controller();
        controller.record_dequeue("empty");
        assert_eq!(controller.state("empty").current_depth, 0);
    }

    #[test]
    fn test_recommended_delay_is_linear() {
        let controller = controller();
        controller.set_depth("q", 80);
        assert_eq!(
            controller.try_admit("q"),
            AdmissionDecision::Delay(Duration::from_millis(100))
        );

        controller.set_depth("q", 90);
        assert_eq!(
            controller.try_admit("q"),
            AdmissionDecision::Delay(Duration::from_millis(550))
        );
    }

    #[test]
    fn test_unknown_queue_uses_default_settings() {
        let controller = controller();
        let state = controller.state("brand_new");
        assert_eq!(state.capacity, 100);
        assert_eq!(state.mode, AdmissionMode::Normal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_should_admit_by_mode() {
        let controller = controller();
        assert!(controller.should_admit("q").await);

        controller.set_depth("q", 85);
        let started = tokio::time::Instant::now();
        assert!(controller.should_admit("q").await);
        assert!(started.elapsed() >= Duration::from_millis(100));

        controller.set_depth("q", 100);
        assert!(!controller.should_admit("q").await);
        assert!(matches!(
            controller.admit("q").await,
            Err(BackpressureError::Rejected { depth: 100, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_admission_times_out() {
        let controller = controller();
        controller.set_depth("q", 120);

        let result = controller
            .wait_for_admission("q", Duration::from_millis(200))
            .await;
        assert!(matches!(result, Err(BackpressureError::Timeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_admission_succeeds_once_drained() {
        let controller = Arc::new(controller());
        controller.set_depth("q", 120);

        let drainer = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(120)).await;
                controller.set_depth("q", 10);
            })
        };

        let result = controller
            .wait_for_admission("q", Duration::from_secs(5))
            .await;
        assert!(result.is_ok());
        drainer.await.unwrap();
    }

    proptest! {
        #[test]
        fn prop_modes_respect_watermarks(steps in proptest::collection::vec(any::<bool>(), 1..400)) {
            let controller = controller();
            for enqueue in steps {
                let mode = if enqueue {
                    controller.record_enqueue("q")
                } else {
                    controller.record_dequeue("q")
                };
                let state = controller.state("q");
                let ratio = state.ratio();

                if ratio <= state.low_watermark_ratio {
                    prop_assert_eq!(mode, AdmissionMode::Normal);
                }
                if ratio >= 1.0 {
                    prop_assert_eq!(mode, AdmissionMode::Rejecting);
                }
                if mode == AdmissionMode::Normal {
                    prop_assert!(ratio < state.high_watermark_ratio);
                }
            }
        }
    }
}
