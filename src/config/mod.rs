//! # Kernel Configuration
//!
//! Typed configuration for every kernel component. Values are loaded once at
//! process start from `config/kernel.toml`, deep-merged with an optional
//! `config/environments/{env}/kernel.toml` overlay (see [`loader`]), and then
//! validated. Every field has a default so partial files load cleanly.
//!
//! ```toml
//! [circuit_breakers.components.llm_api]
//! failure_threshold = 5
//! recovery_timeout_seconds = 60
//!
//! [backpressure.queues.scraper_queue]
//! capacity = 100
//! high_watermark_ratio = 0.8
//! low_watermark_ratio = 0.3
//! ```

pub mod error;
pub mod loader;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::{deep_merge_toml, ConfigManager};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::constants::{self, dependencies, queues};
use crate::resilience::CircuitBreakerConfig;

/// Root configuration document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub circuit_breakers: CircuitBreakerSettings,
    pub dead_letter_queue: DeadLetterQueueConfig,
    pub backpressure: BackpressureConfig,
    pub idempotency: IdempotencyConfig,
    pub anomaly_detection: AnomalyDetectionConfig,
    pub incidents: IncidentConfig,
    pub fallback: FallbackConfig,
    pub web: WebConfig,
    pub logging: LoggingConfig,
}

impl KernelConfig {
    /// Validate every section, returning the first violation found
    pub fn validate(&self) -> ConfigResult<()> {
        self.circuit_breakers.validate()?;
        self.dead_letter_queue.validate()?;
        self.backpressure.validate()?;
        self.idempotency.validate()?;
        self.anomaly_detection.validate()?;
        self.incidents.validate()?;
        self.fallback.validate()?;

        if self.web.enabled && self.incidents.summarizer_timeout() >= self.web.request_timeout() {
            return Err(ConfigurationError::invalid_value(
                "incidents.summarizer_timeout_seconds",
                self.incidents.summarizer_timeout_seconds,
                "must be shorter than web.request_timeout_ms",
            ));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Circuit breakers
// ----------------------------------------------------------------------------

/// `[circuit_breakers]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    /// Soft limit; exceeding it only logs a warning
    pub max_circuit_breakers: usize,
    /// Settings for dependencies without an entry in `components`
    pub default: CircuitBreakerComponentConfig,
    pub components: HashMap<String, CircuitBreakerComponentConfig>,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        let components = [
            dependencies::LLM_API,
            dependencies::SLACK_API,
            dependencies::NOTION_API,
            dependencies::CRM_API,
            dependencies::SCRAPER,
        ]
        .into_iter()
        .filter_map(|name| {
            CircuitBreakerConfig::preset_for(name)
                .map(|preset| (name.to_string(), CircuitBreakerComponentConfig::from(&preset)))
        })
        .collect();

        Self {
            max_circuit_breakers: 50,
            default: CircuitBreakerComponentConfig::default(),
            components,
        }
    }
}

impl CircuitBreakerSettings {
    /// Configuration for a named dependency, falling back to `default`
    pub fn config_for_component(&self, name: &str) -> &CircuitBreakerComponentConfig {
        self.components.get(name).unwrap_or(&self.default)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.max_circuit_breakers == 0 {
            return Err(ConfigurationError::invalid_value(
                "circuit_breakers.max_circuit_breakers",
                self.max_circuit_breakers,
                "must be greater than 0",
            ));
        }

        self.default.validate("circuit_breakers.default")?;
        for (name, component) in &self.components {
            component.validate(&format!("circuit_breakers.components.{name}"))?;
        }
        Ok(())
    }
}

/// Per-dependency breaker settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerComponentConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_seconds: u64,
    pub half_open_trial_limit: u32,
    /// Trial successes needed to close; defaults to `half_open_trial_limit`
    pub success_threshold: Option<u32>,
}

impl Default for CircuitBreakerComponentConfig {
    fn default() -> Self {
        Self::from(&CircuitBreakerConfig::default())
    }
}

impl From<&CircuitBreakerConfig> for CircuitBreakerComponentConfig {
    fn from(config: &CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            recovery_timeout_seconds: config.recovery_timeout.as_secs(),
            half_open_trial_limit: config.half_open_trial_limit,
            success_threshold: None,
        }
    }
}

impl CircuitBreakerComponentConfig {
    /// Convert to the runtime breaker configuration
    pub fn to_resilience_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            recovery_timeout: Duration::from_secs(self.recovery_timeout_seconds),
            half_open_trial_limit: self.half_open_trial_limit,
            success_threshold: self.success_threshold.unwrap_or(self.half_open_trial_limit),
        }
    }

    fn validate(&self, context: &str) -> ConfigResult<()> {
        self.to_resilience_config()
            .validate()
            .map_err(|reason| ConfigurationError::invalid_value(context, format!("{self:?}"), reason))
    }
}

// ----------------------------------------------------------------------------
// Dead-letter queue
// ----------------------------------------------------------------------------

/// `[dead_letter_queue]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadLetterQueueConfig {
    /// Retry delays indexed by retry count
    pub backoff_seconds: Vec<u64>,
    pub poll_interval_seconds: u64,
    pub batch_size: usize,
    pub retention_days: u64,
    pub max_error_length: usize,
    /// Backpressure queue consulted before each retry
    pub retry_queue: String,
}

impl Default for DeadLetterQueueConfig {
    fn default() -> Self {
        Self {
            backoff_seconds: constants::DEFAULT_DLQ_BACKOFF_SECONDS.to_vec(),
            poll_interval_seconds: constants::DEFAULT_DLQ_POLL_INTERVAL_SECONDS,
            batch_size: constants::DEFAULT_DLQ_BATCH_SIZE,
            retention_days: constants::DEFAULT_DLQ_RETENTION_DAYS,
            max_error_length: constants::DEFAULT_MAX_ERROR_LENGTH,
            retry_queue: queues::DLQ_RETRY.to_string(),
        }
    }
}

impl DeadLetterQueueConfig {
    pub fn backoff_table(&self) -> Vec<Duration> {
        self.backoff_seconds
            .iter()
            .copied()
            .map(Duration::from_secs)
            .collect()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days * 24 * 60 * 60)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.backoff_seconds.is_empty() {
            return Err(ConfigurationError::invalid_value(
                "dead_letter_queue.backoff_seconds",
                "[]",
                "backoff table must contain at least one delay",
            ));
        }
        if self.poll_interval_seconds == 0 {
            return Err(ConfigurationError::invalid_value(
                "dead_letter_queue.poll_interval_seconds",
                0,
                "must be greater than 0",
            ));
        }
        if self.batch_size == 0 {
            return Err(ConfigurationError::invalid_value(
                "dead_letter_queue.batch_size",
                0,
                "must be greater than 0",
            ));
        }
        if self.max_error_length == 0 {
            return Err(ConfigurationError::invalid_value(
                "dead_letter_queue.max_error_length",
                0,
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Backpressure
// ----------------------------------------------------------------------------

/// `[backpressure]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackpressureConfig {
    /// Delay recommended at the high watermark while throttled
    pub throttle_base_delay_ms: u64,
    /// Delay recommended at full capacity while throttled
    pub throttle_max_delay_ms: u64,
    /// Poll interval for `wait_for_admission`
    pub check_interval_ms: u64,
    /// Default bound for `wait_for_admission`
    pub max_wait_ms: u64,
    pub default: QueueCapacityConfig,
    pub queues: HashMap<String, QueueCapacityConfig>,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        let queues = [
            (queues::DLQ_RETRY, 100),
            (queues::SCRAPER, 100),
            (queues::AI_PROCESSOR, 50),
            (queues::NOTIFICATION, 200),
            (queues::BATTLECARD, 30),
        ]
        .into_iter()
        .map(|(name, capacity)| {
            (
                name.to_string(),
                QueueCapacityConfig {
                    capacity,
                    ..QueueCapacityConfig::default()
                },
            )
        })
        .collect();

        Self {
            throttle_base_delay_ms: 100,
            throttle_max_delay_ms: 10_000,
            check_interval_ms: 500,
            max_wait_ms: 60_000,
            default: QueueCapacityConfig::default(),
            queues,
        }
    }
}

impl BackpressureConfig {
    pub fn config_for_queue(&self, name: &str) -> &QueueCapacityConfig {
        self.queues.get(name).unwrap_or(&self.default)
    }

    pub fn throttle_base_delay(&self) -> Duration {
        Duration::from_millis(self.throttle_base_delay_ms)
    }

    pub fn throttle_max_delay(&self) -> Duration {
        Duration::from_millis(self.throttle_max_delay_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.throttle_base_delay_ms > self.throttle_max_delay_ms {
            return Err(ConfigurationError::invalid_value(
                "backpressure.throttle_base_delay_ms",
                self.throttle_base_delay_ms,
                "must not exceed throttle_max_delay_ms",
            ));
        }
        if self.check_interval_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "backpressure.check_interval_ms",
                0,
                "must be greater than 0",
            ));
        }
        self.default.validate("backpressure.default")?;
        for (name, queue) in &self.queues {
            queue.validate(&format!("backpressure.queues.{name}"))?;
        }
        Ok(())
    }
}

/// Capacity and watermarks for one queue
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueCapacityConfig {
    pub capacity: u64,
    pub high_watermark_ratio: f64,
    pub low_watermark_ratio: f64,
}

impl Default for QueueCapacityConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            high_watermark_ratio: 0.8,
            low_watermark_ratio: 0.3,
        }
    }
}

impl QueueCapacityConfig {
    fn validate(&self, context: &str) -> ConfigResult<()> {
        if self.capacity == 0 {
            return Err(ConfigurationError::invalid_value(
                format!("{context}.capacity"),
                0,
                "must be greater than 0",
            ));
        }
        for (field, ratio) in [
            ("high_watermark_ratio", self.high_watermark_ratio),
            ("low_watermark_ratio", self.low_watermark_ratio),
        ] {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(ConfigurationError::invalid_value(
                    format!("{context}.{field}"),
                    ratio,
                    "must be within (0, 1]",
                ));
            }
        }
        if self.low_watermark_ratio >= self.high_watermark_ratio {
            return Err(ConfigurationError::invalid_value(
                format!("{context}.low_watermark_ratio"),
                self.low_watermark_ratio,
                "must be lower than high_watermark_ratio",
            ));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Idempotency, anomaly detection, incidents
// ----------------------------------------------------------------------------

/// `[idempotency]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    pub ttl_seconds: u64,
    pub lock_timeout_ms: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: constants::DEFAULT_IDEMPOTENCY_TTL_SECONDS,
            lock_timeout_ms: constants::DEFAULT_IDEMPOTENCY_LOCK_TIMEOUT_MS,
        }
    }
}

impl IdempotencyConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.ttl_seconds == 0 {
            return Err(ConfigurationError::invalid_value(
                "idempotency.ttl_seconds",
                0,
                "must be greater than 0",
            ));
        }
        if self.lock_timeout_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "idempotency.lock_timeout_ms",
                0,
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// `[anomaly_detection]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyDetectionConfig {
    /// Events per evaluation window
    pub window_size: usize,
    /// Overrides the scorer's calibrated threshold when set
    pub anomaly_threshold: Option<f64>,
    /// Percentile of training scores used to calibrate the threshold
    pub calibration_percentile: f64,
    /// Additive smoothing for unseen template transitions
    pub smoothing: f64,
    /// Scored windows retained for `GET /logs/anomalies`
    pub history_limit: usize,
    /// Component partitions idle this long are evicted by the sweep
    pub partition_idle_seconds: u64,
    /// Template catalogue cap; later templates share one overflow id
    pub max_templates: usize,
}

impl Default for AnomalyDetectionConfig {
    fn default() -> Self {
        Self {
            window_size: constants::DEFAULT_WINDOW_SIZE,
            anomaly_threshold: None,
            calibration_percentile: 0.99,
            smoothing: 1.0,
            history_limit: 500,
            partition_idle_seconds: constants::DEFAULT_PARTITION_IDLE_SECONDS,
            max_templates: constants::DEFAULT_MAX_TEMPLATES,
        }
    }
}

impl AnomalyDetectionConfig {
    pub fn partition_idle(&self) -> Duration {
        Duration::from_secs(self.partition_idle_seconds)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.window_size < 2 {
            return Err(ConfigurationError::invalid_value(
                "anomaly_detection.window_size",
                self.window_size,
                "windows need at least two events",
            ));
        }
        if let Some(threshold) = self.anomaly_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(ConfigurationError::invalid_value(
                    "anomaly_detection.anomaly_threshold",
                    threshold,
                    "must be within [0, 1]",
                ));
            }
        }
        if !(self.calibration_percentile > 0.0 && self.calibration_percentile <= 1.0) {
            return Err(ConfigurationError::invalid_value(
                "anomaly_detection.calibration_percentile",
                self.calibration_percentile,
                "must be within (0, 1]",
            ));
        }
        if self.smoothing <= 0.0 {
            return Err(ConfigurationError::invalid_value(
                "anomaly_detection.smoothing",
                self.smoothing,
                "must be greater than 0",
            ));
        }
        if self.history_limit == 0 {
            return Err(ConfigurationError::invalid_value(
                "anomaly_detection.history_limit",
                0,
                "must be greater than 0",
            ));
        }
        if self.partition_idle_seconds == 0 {
            return Err(ConfigurationError::invalid_value(
                "anomaly_detection.partition_idle_seconds",
                0,
                "must be greater than 0",
            ));
        }
        if self.max_templates == 0 {
            return Err(ConfigurationError::invalid_value(
                "anomaly_detection.max_templates",
                0,
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// `[incidents]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IncidentConfig {
    pub quiet_period_seconds: u64,
    pub sweep_interval_seconds: u64,
    /// Resolved incidents older than this are purged
    pub resolved_retention_seconds: u64,
    /// Bound on one root-cause summarizer call
    pub summarizer_timeout_seconds: u64,
}

impl Default for IncidentConfig {
    fn default() -> Self {
        Self {
            quiet_period_seconds: constants::DEFAULT_INCIDENT_QUIET_PERIOD_SECONDS,
            sweep_interval_seconds: 60,
            resolved_retention_seconds: constants::DEFAULT_RESOLVED_INCIDENT_RETENTION_SECONDS,
            summarizer_timeout_seconds: constants::DEFAULT_SUMMARIZER_TIMEOUT_SECONDS,
        }
    }
}

impl IncidentConfig {
    pub fn quiet_period(&self) -> Duration {
        Duration::from_secs(self.quiet_period_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    pub fn resolved_retention(&self) -> Duration {
        Duration::from_secs(self.resolved_retention_seconds)
    }

    pub fn summarizer_timeout(&self) -> Duration {
        Duration::from_secs(self.summarizer_timeout_seconds)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.quiet_period_seconds == 0 {
            return Err(ConfigurationError::invalid_value(
                "incidents.quiet_period_seconds",
                0,
                "must be greater than 0",
            ));
        }
        if self.sweep_interval_seconds == 0 {
            return Err(ConfigurationError::invalid_value(
                "incidents.sweep_interval_seconds",
                0,
                "must be greater than 0",
            ));
        }
        if self.summarizer_timeout_seconds == 0 {
            return Err(ConfigurationError::invalid_value(
                "incidents.summarizer_timeout_seconds",
                0,
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// `[fallback]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Last-good results older than this are never served
    pub max_stale_seconds: u64,
    pub max_entries: usize,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            max_stale_seconds: constants::DEFAULT_FALLBACK_MAX_STALE_SECONDS,
            max_entries: constants::DEFAULT_FALLBACK_MAX_ENTRIES,
        }
    }
}

impl FallbackConfig {
    pub fn max_stale(&self) -> Duration {
        Duration::from_secs(self.max_stale_seconds)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.max_stale_seconds == 0 {
            return Err(ConfigurationError::invalid_value(
                "fallback.max_stale_seconds",
                0,
                "must be greater than 0",
            ));
        }
        if self.max_entries == 0 {
            return Err(ConfigurationError::invalid_value(
                "fallback.max_entries",
                0,
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Web and logging
// ----------------------------------------------------------------------------

/// `[web]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub request_timeout_ms: u64,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "0.0.0.0:8080".to_string(),
            request_timeout_ms: 30_000,
        }
    }
}

impl WebConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// `[logging]`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Explicit filter directive; otherwise derived from the environment
    pub level: Option<String>,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = KernelConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_breaker_table() {
        let settings = CircuitBreakerSettings::default();

        let llm = settings.config_for_component("llm_api").to_resilience_config();
        assert_eq!(llm.failure_threshold, 5);
        assert_eq!(llm.recovery_timeout, Duration::from_secs(60));

        let crm = settings.config_for_component("crm_api").to_resilience_config();
        assert_eq!(crm.failure_threshold, 3);
        assert_eq!(crm.recovery_timeout, Duration::from_secs(120));

        let scraper = settings.config_for_component("scraper").to_resilience_config();
        assert_eq!(scraper.failure_threshold, 10);
        assert_eq!(scraper.recovery_timeout, Duration::from_secs(300));

        let unknown = settings.config_for_component("geo_lookup").to_resilience_config();
        assert_eq!(unknown.failure_threshold, 5);
        assert_eq!(unknown.recovery_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_success_threshold_defaults_to_trial_limit() {
        let component = CircuitBreakerComponentConfig {
            half_open_trial_limit: 3,
            ..Default::default()
        };
        assert_eq!(component.to_resilience_config().success_threshold, 3);
    }

    #[test]
    fn test_watermark_validation() {
        let mut config = KernelConfig::default();
        config.backpressure.default.low_watermark_ratio = 0.9;
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidValue { .. })
        ));

        let mut config = KernelConfig::default();
        config.backpressure.default.high_watermark_ratio = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_empty_backoff_and_tiny_windows() {
        let mut config = KernelConfig::default();
        config.dead_letter_queue.backoff_seconds.clear();
        assert!(config.validate().is_err());

        let mut config = KernelConfig::default();
        config.anomaly_detection.window_size = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_summarizer_timeout_must_fit_inside_request_timeout() {
        let mut config = KernelConfig::default();
        config.incidents.summarizer_timeout_seconds = 30;
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidValue { .. })
        ));

        config.web.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_bounds_are_set() {
        let config = KernelConfig::default();
        assert_eq!(config.incidents.summarizer_timeout(), Duration::from_secs(10));
        assert!(config.incidents.summarizer_timeout() < config.web.request_timeout());
        assert_eq!(config.anomaly_detection.partition_idle(), Duration::from_secs(3600));
        assert_eq!(config.anomaly_detection.max_templates, 10_000);
        assert_eq!(config.incidents.resolved_retention(), Duration::from_secs(604_800));
        assert_eq!(config.fallback.max_stale(), Duration::from_secs(604_800));
    }

    #[test]
    fn test_success_threshold_above_trial_limit_rejected() {
        let mut config = KernelConfig::default();
        config.circuit_breakers.components.insert(
            "llm_api".to_string(),
            CircuitBreakerComponentConfig {
                half_open_trial_limit: 1,
                success_threshold: Some(2),
                ..Default::default()
            },
        );
        assert!(config.validate().is_err());
    }
}
