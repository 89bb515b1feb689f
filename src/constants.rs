//! # Kernel Constants
//!
//! Default values shared by the configuration layer and the components.
//! Everything here can be overridden through `config/kernel.toml`; these are
//! the values a freshly constructed [`crate::config::KernelConfig`] carries.

/// Retry delays (seconds) indexed by a dead-letter task's `retry_count`.
pub const DEFAULT_DLQ_BACKOFF_SECONDS: [u64; 3] = [60, 300, 900];

/// Seconds between DLQ retry worker polls.
pub const DEFAULT_DLQ_POLL_INTERVAL_SECONDS: u64 = 30;

/// Maximum tasks claimed by one worker poll.
pub const DEFAULT_DLQ_BATCH_SIZE: usize = 100;

/// Days a DEAD task is retained before the cleanup sweep removes it.
pub const DEFAULT_DLQ_RETENTION_DAYS: u64 = 7;

/// Error text stored on a task is truncated to this many characters.
pub const DEFAULT_MAX_ERROR_LENGTH: usize = 5000;

/// Default idempotency record lifetime (24h).
pub const DEFAULT_IDEMPOTENCY_TTL_SECONDS: u64 = 86_400;

/// How long a caller waits on another in-flight execution for the same key.
pub const DEFAULT_IDEMPOTENCY_LOCK_TIMEOUT_MS: u64 = 30_000;

/// Number of log events per evaluation window.
pub const DEFAULT_WINDOW_SIZE: usize = 10;

/// Threshold used when neither configuration nor the scorer provides one.
pub const DEFAULT_ANOMALY_THRESHOLD: f64 = 0.5;

/// Quiet period after which an incident with no new anomalies auto-resolves.
pub const DEFAULT_INCIDENT_QUIET_PERIOD_SECONDS: u64 = 1800;

/// Resolved incidents older than this are dropped by the maintenance sweep (7 days).
pub const DEFAULT_RESOLVED_INCIDENT_RETENTION_SECONDS: u64 = 604_800;

/// Upper bound on one root-cause summarizer call. Kept well below the HTTP
/// request timeout so `POST /logs/analyze` can summarise several components.
pub const DEFAULT_SUMMARIZER_TIMEOUT_SECONDS: u64 = 10;

/// A component partition with no events for this long is evicted (1h).
pub const DEFAULT_PARTITION_IDLE_SECONDS: u64 = 3600;

/// Distinct templates catalogued before new ones share the overflow id.
pub const DEFAULT_MAX_TEMPLATES: usize = 10_000;

/// Oldest last-good result served in place of a failed call (7 days).
pub const DEFAULT_FALLBACK_MAX_STALE_SECONDS: u64 = 604_800;

/// Fallback entries retained before the oldest are evicted.
pub const DEFAULT_FALLBACK_MAX_ENTRIES: usize = 10_000;

/// Severity cut-offs over the peak anomaly score.
pub mod severity {
    pub const CRITICAL: f64 = 0.9;
    pub const HIGH: f64 = 0.75;
    pub const MEDIUM: f64 = 0.5;
}

/// Well-known dependency names guarded by circuit breakers.
pub mod dependencies {
    pub const LLM_API: &str = "llm_api";
    pub const SLACK_API: &str = "slack_api";
    pub const NOTION_API: &str = "notion_api";
    pub const CRM_API: &str = "crm_api";
    pub const SCRAPER: &str = "scraper";
}

/// Well-known background queue names.
pub mod queues {
    pub const DLQ_RETRY: &str = "dlq_retry";
    pub const SCRAPER: &str = "scraper_queue";
    pub const AI_PROCESSOR: &str = "ai_processor_queue";
    pub const NOTIFICATION: &str = "notification_queue";
    pub const BATTLECARD: &str = "battlecard_queue";
}
