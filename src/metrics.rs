//! # Kernel Metrics
//!
//! OpenTelemetry counters for kernel events. No exporter is wired here; the
//! global no-op provider is used unless the host process installs one.
//!
//! ```rust
//! use opentelemetry::KeyValue;
//! use resilience_kernel::metrics::breaker_rejections_total;
//!
//! breaker_rejections_total().add(1, &[KeyValue::new("dependency", "llm_api")]);
//! ```

use opentelemetry::metrics::{Counter, Meter};
use std::sync::OnceLock;

static KERNEL_METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    KERNEL_METER.get_or_init(|| opentelemetry::global::meter("resilience-kernel"))
}

/// Breaker state transitions
///
/// Labels:
/// - dependency: Breaker name
/// - to_state: closed, open, half_open
pub fn breaker_transitions_total() -> Counter<u64> {
    meter()
        .u64_counter("kernel.breaker.transitions.total")
        .with_description("Total number of circuit breaker state transitions")
        .build()
}

/// Calls rejected without reaching the dependency
///
/// Labels:
/// - dependency: Breaker name
pub fn breaker_rejections_total() -> Counter<u64> {
    meter()
        .u64_counter("kernel.breaker.rejections.total")
        .with_description("Total number of calls rejected by an open circuit breaker")
        .build()
}

/// Tasks entering the dead-letter queue
///
/// Labels:
/// - task_name: Logical task name
pub fn dlq_enqueued_total() -> Counter<u64> {
    meter()
        .u64_counter("kernel.dlq.enqueued.total")
        .with_description("Total number of tasks enqueued to the dead-letter queue")
        .build()
}

/// Tasks demoted to DEAD
///
/// Labels:
/// - task_name: Logical task name
pub fn dlq_dead_letters_total() -> Counter<u64> {
    meter()
        .u64_counter("kernel.dlq.dead_letters.total")
        .with_description("Total number of tasks that exhausted their retries")
        .build()
}

/// Retry attempts by outcome
///
/// Labels:
/// - outcome: resolved, failed, dead, deferred, skipped
pub fn dlq_retries_total() -> Counter<u64> {
    meter()
        .u64_counter("kernel.dlq.retries.total")
        .with_description("Total number of dead-letter retry attempts")
        .build()
}

/// Admissions refused by the backpressure controller
///
/// Labels:
/// - queue: Queue name
pub fn backpressure_rejections_total() -> Counter<u64> {
    meter()
        .u64_counter("kernel.backpressure.rejections.total")
        .with_description("Total number of admissions rejected by backpressure")
        .build()
}

/// Idempotent executions served from cache
pub fn idempotency_hits_total() -> Counter<u64> {
    meter()
        .u64_counter("kernel.idempotency.hits.total")
        .with_description("Total number of idempotent calls served from a cached result")
        .build()
}

/// Completed windows scored
///
/// Labels:
/// - partition: Source component
pub fn anomaly_windows_scored_total() -> Counter<u64> {
    meter()
        .u64_counter("kernel.anomaly.windows_scored.total")
        .with_description("Total number of log windows scored")
        .build()
}

/// Windows whose score crossed the threshold
///
/// Labels:
/// - partition: Source component
pub fn anomalies_detected_total() -> Counter<u64> {
    meter()
        .u64_counter("kernel.anomaly.detected.total")
        .with_description("Total number of anomalous log windows")
        .build()
}

/// Incidents opened
///
/// Labels:
/// - component: Affected component
/// - severity: low, medium, high, critical
pub fn incidents_opened_total() -> Counter<u64> {
    meter()
        .u64_counter("kernel.incidents.opened.total")
        .with_description("Total number of incidents opened")
        .build()
}

/// Last-good results served in place of a failed call
///
/// Labels:
/// - dependency: Breaker name
/// - reason: degraded, queued
pub fn fallback_served_total() -> Counter<u64> {
    meter()
        .u64_counter("kernel.fallback.served.total")
        .with_description("Total number of stale results served for failed calls")
        .build()
}
