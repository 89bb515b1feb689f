//! # Resilience Kernel
//!
//! Composition root for the resilience and observability components. One
//! kernel is built at process start and shared by reference (`Arc`) with the
//! HTTP layer and background tasks; nothing in the crate keeps global state.
//!
//! ## Guarded calls
//!
//! [`ResilienceKernel::execute_guarded`] runs an outbound dependency call
//! through that dependency's circuit breaker and turns the outcome into one of
//! three caller-visible results:
//!
//! - breaker open: [`GuardedCallError::ServiceDegraded`], returned without
//!   touching the dependency
//! - transient failure or timeout: the call is parked in the dead-letter queue
//!   and [`GuardedCallError::QueuedForRetry`] carries the task id
//! - permanent failure: [`GuardedCallError::Failed`] with the caller's error
//!
//! [`ResilienceKernel::execute_guarded_with_fallback`] additionally remembers
//! each success and answers the first two cases with the last good result,
//! flagged `is_stale`, when one is young enough.
//!
//! ## Log analysis
//!
//! [`ResilienceKernel::analyze_logs`] feeds events to the anomaly detector and
//! opens or merges incidents for every anomalous window, keyed by the window's
//! partition (its source component). Components are handled concurrently;
//! windows of one component are handled in order.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use opentelemetry::KeyValue;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::anomaly::{
    AnomalyScore, KeywordScorer, LogAnomalyDetector, LogEvent, LogLevel, LogParser,
    MaskingTemplateExtractor, Scorer, WindowEvaluation,
};
use crate::backpressure::{AdmissionMode, BackpressureController};
use crate::clock::Clock;
use crate::config::KernelConfig;
use crate::constants::dependencies;
use crate::dlq::task::task_fingerprint;
use crate::dlq::{DeadLetterQueue, DlqRetryWorker, DlqStats, RetryHandler};
use crate::error::Result;
use crate::fallback::{FallbackCache, Served};
use crate::idempotency::{IdempotencyError, IdempotencyStore};
use crate::incident::{
    BreakerGuardedSummarizer, Incident, IncidentManager, PatternRootCauseAnalyzer,
    RootCauseSummarizer,
};
use crate::logging::{log_error, log_kernel_operation};
use crate::metrics;
use crate::resilience::{CircuitBreakerError, CircuitBreakerRegistry};

/// Caller-visible outcome of a failed guarded call
#[derive(Debug, Error)]
pub enum GuardedCallError<E> {
    /// Breaker is open; the dependency was not called
    #[error("Service temporarily degraded: {dependency} unavailable (retry after {retry_after:?})")]
    ServiceDegraded {
        dependency: String,
        retry_after: Duration,
    },

    /// Transient failure; the call was parked in the dead-letter queue
    #[error("Request to {dependency} failed and was queued for retry as task {task_id}: {reason}")]
    QueuedForRetry {
        dependency: String,
        task_id: Uuid,
        reason: String,
    },

    /// Permanent failure as classified by the caller
    #[error("Request failed permanently: {0}")]
    Failed(E),

    #[error("Idempotency key '{key}' was reused with different content")]
    IdempotencyConflict { key: String },

    #[error("Request with idempotency key '{key}' is already being processed")]
    InProgress { key: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl<E> GuardedCallError<E> {
    pub fn is_degraded(&self) -> bool {
        matches!(self, GuardedCallError::ServiceDegraded { .. })
    }

    pub fn queued_task_id(&self) -> Option<Uuid> {
        match self {
            GuardedCallError::QueuedForRetry { task_id, .. } => Some(*task_id),
            _ => None,
        }
    }
}

/// Describes one outbound dependency call
#[derive(Debug, Clone)]
pub struct GuardedCall {
    pub dependency: String,
    /// DLQ task name the call is retried under
    pub task_name: String,
    pub payload: Value,
    pub timeout: Option<Duration>,
    /// Key the last good result is cached under
    pub fallback_key: Option<String>,
}

impl GuardedCall {
    pub fn new(dependency: impl Into<String>, task_name: impl Into<String>, payload: Value) -> Self {
        Self {
            dependency: dependency.into(),
            task_name: task_name.into(),
            payload,
            timeout: None,
            fallback_key: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_fallback_key(mut self, key: impl Into<String>) -> Self {
        self.fallback_key = Some(key.into());
        self
    }

    /// Explicit fallback key, else the dependency plus the content fingerprint
    pub fn fallback_key(&self) -> String {
        match &self.fallback_key {
            Some(key) => key.clone(),
            None => format!("{}:{}", self.dependency, self.fingerprint()),
        }
    }

    /// Payload `idempotency_key` when present, else derived from content
    pub fn idempotency_key(&self) -> String {
        let fingerprint = self.fingerprint();
        match self.payload.get("idempotency_key").and_then(Value::as_str) {
            Some(key) if !key.is_empty() => key.to_string(),
            _ => format!("{}:{fingerprint}", self.task_name),
        }
    }

    pub fn fingerprint(&self) -> String {
        task_fingerprint(&self.task_name, &self.payload)
    }
}

/// Failure of the guarded operation as seen by the breaker
#[derive(Debug)]
enum Attempt<E> {
    Failed(E),
    TimedOut(Duration),
}

/// Result of one `analyze_logs` batch
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub events_ingested: usize,
    pub windows_scored: usize,
    pub anomalies: Vec<AnomalyScore>,
    /// Incidents opened or updated by this batch, latest state
    pub incidents: Vec<Incident>,
    /// Events still buffered per partition touched by the batch
    pub pending: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => f.write_str("healthy"),
            HealthStatus::Degraded => f.write_str("degraded"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelHealth {
    pub status: HealthStatus,
    pub open_breakers: Vec<String>,
    pub rejecting_queues: Vec<String>,
    pub dlq: DlqStats,
    pub active_incidents: usize,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct ResilienceKernel {
    config: KernelConfig,
    clock: Arc<dyn Clock>,
    breakers: Arc<CircuitBreakerRegistry>,
    dlq: Arc<DeadLetterQueue>,
    backpressure: Arc<BackpressureController>,
    idempotency: Arc<IdempotencyStore>,
    fallback: Arc<FallbackCache>,
    detector: Arc<LogAnomalyDetector>,
    incidents: Arc<IncidentManager>,
    parser: LogParser,
}

impl ResilienceKernel {
    /// Build every component from validated configuration. The summarizer is
    /// routed through the `llm_api` breaker with the pattern analyzer as
    /// fallback.
    pub fn new(
        config: KernelConfig,
        clock: Arc<dyn Clock>,
        scorer: Arc<dyn Scorer>,
        summarizer: Arc<dyn RootCauseSummarizer>,
    ) -> Result<Self> {
        config.validate()?;

        let breakers = Arc::new(CircuitBreakerRegistry::new(
            config.circuit_breakers.clone(),
            Arc::clone(&clock),
        ));
        let backpressure = Arc::new(BackpressureController::new(config.backpressure.clone()));
        let dlq = Arc::new(
            DeadLetterQueue::new(&config.dead_letter_queue, Arc::clone(&clock)).with_backlog_gauge(
                Arc::clone(&backpressure),
                config.dead_letter_queue.retry_queue.clone(),
            ),
        );
        let idempotency = Arc::new(IdempotencyStore::new(
            &config.idempotency,
            Arc::clone(&clock),
        ));
        let fallback = Arc::new(FallbackCache::new(&config.fallback, Arc::clone(&clock)));
        let detector = Arc::new(LogAnomalyDetector::new(
            &config.anomaly_detection,
            scorer,
            Arc::clone(&clock),
        ));

        let guarded = BreakerGuardedSummarizer::new(
            summarizer,
            Arc::clone(&breakers),
            dependencies::LLM_API,
            config.incidents.summarizer_timeout(),
        )
        .with_fallback(Arc::new(PatternRootCauseAnalyzer::new()?));
        let incidents = Arc::new(IncidentManager::new(
            Arc::new(guarded),
            config.incidents.quiet_period(),
            Arc::clone(&clock),
        ));

        let parser = LogParser::new(Arc::new(MaskingTemplateExtractor::with_max_templates(
            config.anomaly_detection.max_templates,
        )?))?;

        info!(
            breakers = breakers.len(),
            window_size = detector.window_size(),
            threshold = detector.threshold(),
            model_version = %detector.model_version(),
            "🛡️ Resilience kernel initialized"
        );

        Ok(Self {
            config,
            clock,
            breakers,
            dlq,
            backpressure,
            idempotency,
            fallback,
            detector,
            incidents,
            parser,
        })
    }

    /// Kernel with the keyword scorer and pattern-based root-cause analysis
    pub fn with_defaults(config: KernelConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let analyzer = Arc::new(PatternRootCauseAnalyzer::new()?);
        Self::new(config, clock, Arc::new(KeywordScorer), analyzer)
    }

    /// Run `operation` through the breaker for `call.dependency`.
    ///
    /// `is_transient` decides which errors count against the breaker and are
    /// parked for retry; everything else is returned as `Failed`. Timeouts
    /// are always transient.
    pub async fn execute_guarded<T, E, F, Fut, C>(
        &self,
        call: GuardedCall,
        operation: F,
        is_transient: C,
    ) -> std::result::Result<T, GuardedCallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: fmt::Display,
        C: Fn(&E) -> bool,
    {
        self.run_guarded(call, operation, is_transient, None).await
    }

    /// `retry_key` is the idempotency key a parked task is retried under; None
    /// falls back to the payload key or the task id.
    async fn run_guarded<T, E, F, Fut, C>(
        &self,
        call: GuardedCall,
        operation: F,
        is_transient: C,
        retry_key: Option<String>,
    ) -> std::result::Result<T, GuardedCallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: fmt::Display,
        C: Fn(&E) -> bool,
    {
        let timeout = call.timeout;
        let attempt = || async move {
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, operation()).await {
                    Ok(result) => result.map_err(Attempt::Failed),
                    Err(_) => Err(Attempt::TimedOut(limit)),
                },
                None => operation().await.map_err(Attempt::Failed),
            }
        };

        let outcome = self
            .breakers
            .call_classified(&call.dependency, attempt, |failure| match failure {
                Attempt::TimedOut(_) => true,
                Attempt::Failed(e) => is_transient(e),
            })
            .await;

        match outcome {
            Ok(value) => Ok(value),
            Err(CircuitBreakerError::CircuitOpen { retry_after, .. }) => {
                debug!(
                    dependency = %call.dependency,
                    task_name = %call.task_name,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Guarded call rejected by open breaker"
                );
                Err(GuardedCallError::ServiceDegraded {
                    dependency: call.dependency,
                    retry_after,
                })
            }
            Err(CircuitBreakerError::Timeout { timeout, .. })
            | Err(CircuitBreakerError::OperationFailed(Attempt::TimedOut(timeout))) => {
                let reason = format!("timed out after {timeout:?}");
                Err(self.park_for_retry(call, reason, retry_key))
            }
            Err(CircuitBreakerError::OperationFailed(Attempt::Failed(e))) => {
                if is_transient(&e) {
                    Err(self.park_for_retry(call, e.to_string(), retry_key))
                } else {
                    warn!(
                        dependency = %call.dependency,
                        task_name = %call.task_name,
                        error = %e,
                        "Guarded call failed permanently"
                    );
                    Err(GuardedCallError::Failed(e))
                }
            }
        }
    }

    /// `execute_guarded` behind the idempotency store: a repeated call with
    /// the same key and content returns the cached result without touching
    /// the dependency. A call parked for retry keeps the same key, so the DLQ
    /// retry and a resubmission by the caller run the side effect once.
    pub async fn execute_guarded_once<T, E, F, Fut, C>(
        &self,
        call: GuardedCall,
        operation: F,
        is_transient: C,
    ) -> std::result::Result<T, GuardedCallError<E>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: fmt::Display,
        C: Fn(&E) -> bool,
    {
        let key = call.idempotency_key();
        let fingerprint = call.fingerprint();

        let result = self
            .idempotency
            .execute_once(&key, &fingerprint, || {
                self.run_guarded(call, operation, is_transient, Some(key.clone()))
            })
            .await;

        result.map_err(|e| match e {
            IdempotencyError::OperationFailed(guarded) => guarded,
            IdempotencyError::Conflict { key, .. } => GuardedCallError::IdempotencyConflict { key },
            IdempotencyError::InProgress { key } => GuardedCallError::InProgress { key },
            IdempotencyError::Serialization { key, source } => {
                GuardedCallError::Internal(format!("result for '{key}' not serializable: {source}"))
            }
        })
    }

    /// `execute_guarded` with a last-good-result cache under
    /// [`GuardedCall::fallback_key`]. Successes are stored; when the breaker
    /// is open or the call was parked for retry, a cached result no older
    /// than `fallback.max_stale_seconds` is returned as [`Served::stale`].
    /// Permanent failures are never masked.
    pub async fn execute_guarded_with_fallback<T, E, F, Fut, C>(
        &self,
        call: GuardedCall,
        operation: F,
        is_transient: C,
    ) -> std::result::Result<Served<T>, GuardedCallError<E>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: fmt::Display,
        C: Fn(&E) -> bool,
    {
        let key = call.fallback_key();
        let dependency = call.dependency.clone();

        let err = match self.run_guarded(call, operation, is_transient, None).await {
            Ok(value) => {
                if let Err(e) = self.fallback.store(&key, &value) {
                    warn!(fallback_key = %key, error = %e, "Result not cached for fallback");
                }
                return Ok(Served::fresh(value));
            }
            Err(err) => err,
        };

        let reason = match err {
            GuardedCallError::ServiceDegraded { .. } => "degraded",
            GuardedCallError::QueuedForRetry { .. } => "queued",
            _ => return Err(err),
        };
        let Some(served) = self.fallback.lookup_as::<T>(&key) else {
            debug!(dependency = %dependency, fallback_key = %key, "No fallback result available");
            return Err(err);
        };

        metrics::fallback_served_total().add(
            1,
            &[
                KeyValue::new("dependency", dependency.clone()),
                KeyValue::new("reason", reason),
            ],
        );
        warn!(
            dependency = %dependency,
            fallback_key = %key,
            reason = reason,
            task_id = ?err.queued_task_id(),
            stored_at = ?served.stored_at,
            "♻️ Serving stale result for unavailable dependency"
        );
        Ok(served)
    }

    fn park_for_retry<E>(
        &self,
        call: GuardedCall,
        reason: String,
        retry_key: Option<String>,
    ) -> GuardedCallError<E> {
        let task_id = self
            .dlq
            .enqueue_with_key(&call.task_name, call.payload, &reason, retry_key);
        warn!(
            dependency = %call.dependency,
            task_name = %call.task_name,
            task_id = %task_id,
            reason = %reason,
            "📮 Guarded call failed transiently, queued for retry"
        );
        GuardedCallError::QueuedForRetry {
            dependency: call.dependency,
            task_id,
            reason,
        }
    }

    /// Parse raw log lines, stamping lines without a timestamp with now
    pub fn parse_lines<S: AsRef<str>>(&self, lines: &[S], default_source: &str) -> Vec<LogEvent> {
        let now = self.clock.now();
        lines
            .iter()
            .map(|line| line.as_ref())
            .filter(|line| !line.trim().is_empty())
            .map(|line| self.parser.parse(line, default_source, now))
            .collect()
    }

    /// Build an event from already-structured fields
    pub fn event(
        &self,
        raw_text: &str,
        source_component: &str,
        timestamp: Option<DateTime<Utc>>,
        level: Option<LogLevel>,
    ) -> LogEvent {
        self.parser.event(
            raw_text,
            source_component,
            timestamp.unwrap_or_else(|| self.clock.now()),
            level.unwrap_or(LogLevel::Info),
        )
    }

    /// Ingest a batch, then open or merge an incident for every anomalous
    /// window it completes
    pub async fn analyze_logs(&self, events: Vec<LogEvent>) -> AnalysisReport {
        let mut report = AnalysisReport {
            events_ingested: events.len(),
            ..AnalysisReport::default()
        };
        let mut touched: Vec<String> = events
            .iter()
            .map(|event| event.source_component.clone())
            .collect();
        touched.sort();
        touched.dedup();

        let evaluations = self.detector.ingest_batch(events);
        report.windows_scored = evaluations.len();

        let mut by_component: BTreeMap<String, Vec<WindowEvaluation>> = BTreeMap::new();
        for evaluation in evaluations {
            if !evaluation.score.is_anomaly {
                continue;
            }
            report.anomalies.push(evaluation.score.clone());
            by_component
                .entry(evaluation.score.partition.clone())
                .or_default()
                .push(evaluation);
        }

        let per_component = join_all(
            by_component
                .into_iter()
                .map(|(component, evaluations)| self.raise_incidents(component, evaluations)),
        )
        .await;
        report.incidents = per_component.into_iter().flatten().collect();
        report.pending = touched
            .into_iter()
            .map(|partition| {
                let pending = self.detector.pending(&partition);
                (partition, pending)
            })
            .collect();

        log_kernel_operation(
            "anomaly",
            "analyze_logs",
            "completed",
            Some(&format!(
                "events={} windows={} anomalies={}",
                report.events_ingested,
                report.windows_scored,
                report.anomalies.len()
            )),
        );
        report
    }

    /// Open or merge one component's incidents, in window order
    async fn raise_incidents(&self, component: String, evaluations: Vec<WindowEvaluation>) -> Vec<Incident> {
        let mut incidents: Vec<Incident> = Vec::new();
        for evaluation in evaluations {
            match self
                .incidents
                .on_anomaly_with_window(&evaluation.score, &component, &evaluation.window.events)
                .await
            {
                Ok(incident) => match incidents.iter_mut().find(|i| i.id == incident.id) {
                    Some(existing) => *existing = incident,
                    None => incidents.push(incident),
                },
                Err(e) => log_error(
                    "incident",
                    "on_anomaly",
                    &e.to_string(),
                    Some(&format!("component={component} window_id={}", evaluation.score.window_id)),
                ),
            }
        }
        incidents
    }

    pub fn health(&self) -> KernelHealth {
        let open_breakers = self.breakers.snapshot().open_breakers();
        let rejecting_queues: Vec<String> = self
            .backpressure
            .snapshot()
            .into_iter()
            .filter(|queue| queue.mode == AdmissionMode::Rejecting)
            .map(|queue| queue.queue_name)
            .collect();
        let dlq = self.dlq.stats();

        let status = if open_breakers.is_empty() && rejecting_queues.is_empty() && dlq.dead == 0 {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };

        KernelHealth {
            status,
            open_breakers,
            rejecting_queues,
            dlq,
            active_incidents: self.incidents.active_count(),
            checked_at: self.clock.now(),
        }
    }

    /// Start the DLQ retry worker and the maintenance sweeper
    pub fn spawn_background(
        &self,
        handlers: HashMap<String, Arc<dyn RetryHandler>>,
    ) -> BackgroundTasks {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker = Arc::new(
            DlqRetryWorker::new(
                Arc::clone(&self.dlq),
                Arc::clone(&self.backpressure),
                Arc::clone(&self.idempotency),
                &self.config.dead_letter_queue,
            )
            .with_handlers(handlers),
        );
        let worker_handle = tokio::spawn(worker.run(shutdown_rx.clone()));

        let sweeper = MaintenanceSweeper {
            dlq: Arc::clone(&self.dlq),
            idempotency: Arc::clone(&self.idempotency),
            incidents: Arc::clone(&self.incidents),
            detector: Arc::clone(&self.detector),
            fallback: Arc::clone(&self.fallback),
            interval: self.config.incidents.sweep_interval(),
            dlq_retention: self.config.dead_letter_queue.retention(),
            incident_retention: self.config.incidents.resolved_retention(),
            partition_idle: self.config.anomaly_detection.partition_idle(),
        };
        let sweeper_handle = tokio::spawn(sweeper.run(shutdown_rx));

        info!("🚀 Background tasks started (dlq retry worker, maintenance sweeper)");
        BackgroundTasks {
            shutdown: shutdown_tx,
            handles: vec![worker_handle, sweeper_handle],
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn dlq(&self) -> &Arc<DeadLetterQueue> {
        &self.dlq
    }

    pub fn backpressure(&self) -> &Arc<BackpressureController> {
        &self.backpressure
    }

    pub fn idempotency(&self) -> &Arc<IdempotencyStore> {
        &self.idempotency
    }

    pub fn fallback(&self) -> &Arc<FallbackCache> {
        &self.fallback
    }

    pub fn detector(&self) -> &Arc<LogAnomalyDetector> {
        &self.detector
    }

    pub fn incidents(&self) -> &Arc<IncidentManager> {
        &self.incidents
    }

    pub fn parser(&self) -> &LogParser {
        &self.parser
    }
}

/// Periodic housekeeping. Resolves quiet incidents and bounds every store
/// that would otherwise only grow.
#[derive(Debug)]
struct MaintenanceSweeper {
    dlq: Arc<DeadLetterQueue>,
    idempotency: Arc<IdempotencyStore>,
    incidents: Arc<IncidentManager>,
    detector: Arc<LogAnomalyDetector>,
    fallback: Arc<FallbackCache>,
    interval: Duration,
    dlq_retention: Duration,
    incident_retention: Duration,
    partition_idle: Duration,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct SweepSummary {
    incidents_resolved: usize,
    incidents_purged: usize,
    idempotency_purged: usize,
    dead_tasks_removed: usize,
    partitions_evicted: usize,
    fallback_purged: usize,
}

impl MaintenanceSweeper {
    async fn sweep(&self) -> SweepSummary {
        let summary = SweepSummary {
            incidents_resolved: self.incidents.auto_resolve_quiet().await.len(),
            incidents_purged: self.incidents.purge_resolved_older_than(self.incident_retention),
            idempotency_purged: self.idempotency.purge_expired(),
            dead_tasks_removed: self.dlq.cleanup_dead_older_than(self.dlq_retention),
            partitions_evicted: self.detector.evict_idle(self.partition_idle),
            fallback_purged: self.fallback.purge_stale(),
        };

        if summary != SweepSummary::default() {
            info!(
                incidents_resolved = summary.incidents_resolved,
                incidents_purged = summary.incidents_purged,
                idempotency_purged = summary.idempotency_purged,
                dead_tasks_removed = summary.dead_tasks_removed,
                partitions_evicted = summary.partitions_evicted,
                fallback_purged = summary.fallback_purged,
                "🧹 Maintenance sweep completed"
            );
        }
        summary
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Maintenance sweeper stopping");
                        break;
                    }
                }
            }
        }
    }
}

/// Handles to the kernel's background tasks
#[derive(Debug)]
pub struct BackgroundTasks {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Signal shutdown and wait for every task to finish
    pub async fn shutdown(self) {
        if self.shutdown.send(true).is_err() {
            debug!("Background tasks already stopped");
        }
        for joined in join_all(self.handles).await {
            if let Err(e) = joined {
                error!(error = %e, "Background task ended abnormally");
            }
        }
        info!("🛑 Background tasks stopped");
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::dlq::TaskStatus;
    use crate::incident::{AnalysisMethod, RootCauseAnalysis, IncidentStatus};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn kernel() -> ResilienceKernel {
        ResilienceKernel::with_defaults(
            KernelConfig::default(),
            Arc::new(ManualClock::starting_now()),
        )
        .unwrap()
    }

    #[derive(Debug)]
    enum CrmError {
        Unavailable,
        InvalidRecord,
    }

    impl fmt::Display for CrmError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                CrmError::Unavailable => f.write_str("503 service unavailable"),
                CrmError::InvalidRecord => f.write_str("422 invalid record"),
            }
        }
    }

    fn transient(e: &CrmError) -> bool {
        matches!(e, CrmError::Unavailable)
    }

    fn crm_call() -> GuardedCall {
        GuardedCall::new(
            dependencies::CRM_API,
            "sync_crm",
            serde_json::json!({"deal_id": 42}),
        )
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        let kernel = kernel();
        let result: std::result::Result<u32, GuardedCallError<CrmError>> = kernel
            .execute_guarded(crm_call(), || async { Ok(7) }, transient)
            .await;
        assert_eq!(result.unwrap(), 7);
        assert!(kernel.dlq().is_empty());
    }

    #[tokio::test]
    async fn test_transient_failure_is_queued_for_retry() {
        let kernel = kernel();
        let err = kernel
            .execute_guarded(
                crm_call(),
                || async { Err::<(), _>(CrmError::Unavailable) },
                transient,
            )
            .await
            .unwrap_err();

        let task_id = err.queued_task_id().unwrap();
        let task = kernel.dlq().get(task_id).unwrap();
        assert_eq!(task.task_name, "sync_crm");
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.last_error.contains("503"));
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_queued_or_counted() {
        let kernel = kernel();
        for _ in 0..5 {
            let err = kernel
                .execute_guarded(
                    crm_call(),
                    || async { Err::<(), _>(CrmError::InvalidRecord) },
                    transient,
                )
                .await
                .unwrap_err();
            assert!(matches!(err, GuardedCallError::Failed(CrmError::InvalidRecord)));
        }
        assert!(kernel.dlq().is_empty());
        assert!(kernel.breakers().snapshot().open_breakers().is_empty());
    }

    #[tokio::test]
    async fn test_open_breaker_fails_fast_without_calling_dependency() {
        let kernel = kernel();
        // crm_api trips after 3 failures
        for _ in 0..3 {
            let _ = kernel
                .execute_guarded(
                    crm_call(),
                    || async { Err::<(), _>(CrmError::Unavailable) },
                    transient,
                )
                .await;
        }

        let calls = AtomicU32::new(0);
        let err = kernel
            .execute_guarded(
                crm_call(),
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, CrmError>(())
                },
                transient,
            )
            .await
            .unwrap_err();

        assert!(err.is_degraded());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(kernel.dlq().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_transient() {
        let kernel = kernel();
        let call = crm_call().with_timeout(Duration::from_millis(50));
        let err = kernel
            .execute_guarded(
                call,
                || async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<_, CrmError>(())
                },
                transient,
            )
            .await
            .unwrap_err();

        assert!(err.queued_task_id().is_some());
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_guarded_once_runs_operation_once() {
        let kernel = kernel();
        let calls = AtomicU32::new(0);
        let counter = &calls;

        for _ in 0..2 {
            let value: String = kernel
                .execute_guarded_once(
                    crm_call(),
                    move || async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, CrmError>("synced".to_string())
                    },
                    transient,
                )
                .await
                .unwrap();
            assert_eq!(value, "synced");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_guarded_once_rejects_reused_key_with_new_content() {
        let kernel = kernel();
        let first = GuardedCall::new(
            dependencies::SLACK_API,
            "post_to_slack",
            serde_json::json!({"idempotency_key": "alert-1", "text": "a"}),
        );
        let second = GuardedCall::new(
            dependencies::SLACK_API,
            "post_to_slack",
            serde_json::json!({"idempotency_key": "alert-1", "text": "b"}),
        );

        let ok: std::result::Result<u8, GuardedCallError<CrmError>> = kernel
            .execute_guarded_once(first, || async { Ok(1) }, transient)
            .await;
        assert!(ok.is_ok());

        let err = kernel
            .execute_guarded_once(second, || async { Ok::<u8, CrmError>(2) }, transient)
            .await
            .unwrap_err();
        assert!(matches!(err, GuardedCallError::IdempotencyConflict { ref key } if key == "alert-1"));
    }

    #[tokio::test]
    async fn test_analyze_logs_opens_one_incident_per_component() {
        let kernel = kernel();
        let lines: Vec<String> = (0..20)
            .map(|i| format!("2024-05-01T10:00:{i:02}Z ERROR [scraper] Connection to 10.0.0.{i} refused"))
            .collect();
        let events = kernel.parse_lines(&lines, "unknown");

        let report = kernel.analyze_logs(events).await;

        assert_eq!(report.events_ingested, 20);
        assert_eq!(report.windows_scored, 2);
        assert_eq!(report.anomalies.len(), 2);
        assert_eq!(report.incidents.len(), 1);
        let incident = &report.incidents[0];
        assert_eq!(incident.affected_component, "scraper");
        assert_eq!(incident.anomaly_refs.len(), 2);
        assert!(incident.root_cause_text.is_some());
        assert_eq!(report.pending.get("scraper"), Some(&0));
    }

    fn crm_lookup() -> GuardedCall {
        crm_call().with_fallback_key("crm:deal:42")
    }

    #[tokio::test]
    async fn test_fallback_serves_last_good_result_when_dependency_is_down() {
        let kernel = kernel();
        let fresh: Served<String> = kernel
            .execute_guarded_with_fallback(crm_lookup(), || async { Ok::<_, CrmError>("stage=won".to_string()) }, transient)
            .await
            .unwrap();
        assert!(!fresh.is_stale);

        // Transient failure: parked for retry, caller still gets data
        let queued: Served<String> = kernel
            .execute_guarded_with_fallback(
                crm_lookup(),
                || async { Err::<String, _>(CrmError::Unavailable) },
                transient,
            )
            .await
            .unwrap();
        assert!(queued.is_stale);
        assert_eq!(queued.value, "stage=won");
        assert!(queued.stored_at.is_some());
        assert_eq!(kernel.dlq().len(), 1);

        // Breaker open: dependency untouched
        kernel.breakers().force_open(dependencies::CRM_API);
        let calls = AtomicU32::new(0);
        let degraded: Served<String> = kernel
            .execute_guarded_with_fallback(
                crm_lookup(),
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, CrmError>("unreachable".to_string())
                },
                transient,
            )
            .await
            .unwrap();
        assert!(degraded.is_stale);
        assert_eq!(degraded.value, "stage=won");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fallback_never_masks_permanent_failures_or_misses() {
        let kernel = kernel();
        kernel
            .execute_guarded_with_fallback(crm_lookup(), || async { Ok::<_, CrmError>(1u32) }, transient)
            .await
            .unwrap();

        let err = kernel
            .execute_guarded_with_fallback(
                crm_lookup(),
                || async { Err::<u32, _>(CrmError::InvalidRecord) },
                transient,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GuardedCallError::Failed(CrmError::InvalidRecord)));

        let uncached = crm_call().with_fallback_key("crm:deal:7");
        let err = kernel
            .execute_guarded_with_fallback(
                uncached,
                || async { Err::<u32, _>(CrmError::Unavailable) },
                transient,
            )
            .await
            .unwrap_err();
        assert!(err.queued_task_id().is_some());
    }

    #[tokio::test]
    async fn test_fallback_older_than_max_stale_is_not_served() {
        let clock = ManualClock::starting_now();
        let kernel = ResilienceKernel::with_defaults(KernelConfig::default(), Arc::new(clock.clone())).unwrap();
        kernel
            .execute_guarded_with_fallback(crm_lookup(), || async { Ok::<_, CrmError>(5u32) }, transient)
            .await
            .unwrap();

        clock.advance(kernel.config().fallback.max_stale() + Duration::from_secs(1));
        kernel.breakers().force_open(dependencies::CRM_API);

        let err = kernel
            .execute_guarded_with_fallback(crm_lookup(), || async { Ok::<_, CrmError>(6u32) }, transient)
            .await
            .unwrap_err();
        assert!(err.is_degraded());
    }

    #[derive(Debug)]
    struct SlowSummarizer;

    #[async_trait]
    impl RootCauseSummarizer for SlowSummarizer {
        async fn summarize(&self, incident: &Incident, _: &[LogEvent]) -> anyhow::Result<RootCauseAnalysis> {
            tokio::time::sleep(Duration::from_secs(8)).await;
            Ok(RootCauseAnalysis {
                root_cause: format!("{} saturated", incident.affected_component),
                recommended_fix: "Scale out".to_string(),
                matched_pattern: None,
                method: AnalysisMethod::Summarizer,
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_components_are_summarised_concurrently() {
        let kernel = ResilienceKernel::new(
            KernelConfig::default(),
            Arc::new(ManualClock::starting_now()),
            Arc::new(KeywordScorer),
            Arc::new(SlowSummarizer),
        )
        .unwrap();
        let lines: Vec<String> = ["scraper", "crm", "notion"]
            .iter()
            .flat_map(|component| {
                (0..10).map(move |i| format!("2024-05-01T10:00:{i:02}Z ERROR [{component}] request {i} failed"))
            })
            .collect();
        let events = kernel.parse_lines(&lines, "unknown");

        let started = tokio::time::Instant::now();
        let report = kernel.analyze_logs(events).await;
        let elapsed = started.elapsed();

        assert!(elapsed < Duration::from_secs(16), "took {elapsed:?}");
        assert!(elapsed < kernel.config().web.request_timeout());
        let components: Vec<&str> = report
            .incidents
            .iter()
            .map(|incident| incident.affected_component.as_str())
            .collect();
        assert_eq!(components, vec!["crm", "notion", "scraper"]);
        assert!(report
            .incidents
            .iter()
            .all(|incident| incident.status == IncidentStatus::Investigating));
    }

    #[tokio::test]
    async fn test_sweep_bounds_growing_stores() {
        let clock = ManualClock::starting_now();
        let kernel = ResilienceKernel::with_defaults(KernelConfig::default(), Arc::new(clock.clone())).unwrap();

        let lines: Vec<String> = (0..13)
            .map(|i| format!("2024-05-01T10:00:{i:02}Z ERROR [batch-7] Job {i} crashed"))
            .collect();
        let report = kernel.analyze_logs(kernel.parse_lines(&lines, "unknown")).await;
        kernel
            .incidents()
            .resolve(report.incidents[0].id, "Batch retired")
            .await
            .unwrap();
        kernel
            .execute_guarded_with_fallback(crm_lookup(), || async { Ok::<_, CrmError>(1u8) }, transient)
            .await
            .unwrap();
        assert_eq!(kernel.detector().partitions(), vec!["batch-7"]);

        clock.advance(Duration::from_secs(8 * 24 * 60 * 60));
        let sweeper = MaintenanceSweeper {
            dlq: Arc::clone(kernel.dlq()),
            idempotency: Arc::clone(kernel.idempotency()),
            incidents: Arc::clone(kernel.incidents()),
            detector: Arc::clone(kernel.detector()),
            fallback: Arc::clone(kernel.fallback()),
            interval: kernel.config().incidents.sweep_interval(),
            dlq_retention: kernel.config().dead_letter_queue.retention(),
            incident_retention: kernel.config().incidents.resolved_retention(),
            partition_idle: kernel.config().anomaly_detection.partition_idle(),
        };
        let summary = sweeper.sweep().await;

        assert_eq!(summary.incidents_purged, 1);
        assert_eq!(summary.partitions_evicted, 1);
        assert_eq!(summary.fallback_purged, 1);
        assert!(kernel.incidents().is_empty());
        assert!(kernel.detector().partitions().is_empty());
        assert!(kernel.fallback().is_empty());
    }

    #[tokio::test]
    async fn test_health_degrades_with_open_breaker() {
        let kernel = kernel();
        assert_eq!(kernel.health().status, HealthStatus::Healthy);

        kernel.breakers().force_open(dependencies::LLM_API);
        let health = kernel.health();
        assert_eq!(health.status, HealthStatus::Degraded);
        assert_eq!(health.open_breakers, vec![dependencies::LLM_API.to_string()]);
    }

    #[tokio::test]
    async fn test_background_tasks_shut_down() {
        let kernel = kernel();
        let tasks = kernel.spawn_background(HashMap::new());
        assert_eq!(tasks.len(), 2);
        tasks.shutdown().await;
    }
}
