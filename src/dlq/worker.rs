//! # DLQ Retry Worker
//!
//! Polls the dead-letter queue for due tasks and re-executes them through the
//! registered [`RetryHandler`] for each task name. Several workers may share
//! one queue: `retry_due` claims atomically, so a task is attempted by at most
//! one worker at a time.

use async_trait::async_trait;
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backpressure::BackpressureController;
use crate::config::DeadLetterQueueConfig;
use crate::dlq::{DeadLetterQueue, DeadLetterTask, DlqError, TaskStatus};
use crate::dlq::task::task_fingerprint;
use crate::idempotency::{IdempotencyError, IdempotencyStore};
use crate::metrics;

/// Re-executes one kind of dead-lettered task
#[async_trait]
pub trait RetryHandler: Send + Sync {
    async fn handle(&self, payload: &Value) -> anyhow::Result<Value>;
}

/// Tally of one polling cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryCycleReport {
    pub attempted: usize,
    pub resolved: usize,
    /// Rescheduled for a later attempt
    pub failed: usize,
    pub dead: usize,
    /// Released back to PENDING because backpressure did not admit the retry
    pub deferred: usize,
    /// Cancelled or otherwise changed between claim and execution
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryOutcome {
    Resolved,
    Failed,
    Dead,
    Deferred,
    Skipped,
}

impl RetryOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            RetryOutcome::Resolved => "resolved",
            RetryOutcome::Failed => "failed",
            RetryOutcome::Dead => "dead",
            RetryOutcome::Deferred => "deferred",
            RetryOutcome::Skipped => "skipped",
        }
    }
}

pub struct DlqRetryWorker {
    queue: Arc<DeadLetterQueue>,
    backpressure: Arc<BackpressureController>,
    idempotency: Arc<IdempotencyStore>,
    handlers: HashMap<String, Arc<dyn RetryHandler>>,
    retry_queue: String,
    batch_size: usize,
    poll_interval: Duration,
}

impl std::fmt::Debug for DlqRetryWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut handlers: Vec<&String> = self.handlers.keys().collect();
        handlers.sort();
        f.debug_struct("DlqRetryWorker")
            .field("handlers", &handlers)
            .field("retry_queue", &self.retry_queue)
            .field("batch_size", &self.batch_size)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl DlqRetryWorker {
    pub fn new(
        queue: Arc<DeadLetterQueue>,
        backpressure: Arc<BackpressureController>,
        idempotency: Arc<IdempotencyStore>,
        config: &DeadLetterQueueConfig,
    ) -> Self {
        Self {
            queue,
            backpressure,
            idempotency,
            handlers: HashMap::new(),
            retry_queue: config.retry_queue.clone(),
            batch_size: config.batch_size,
            poll_interval: config.poll_interval(),
        }
    }

    pub fn register_handler(&mut self, task_name: impl Into<String>, handler: Arc<dyn RetryHandler>) {
        let task_name = task_name.into();
        debug!(task_name = %task_name, "Registered DLQ retry handler");
        self.handlers.insert(task_name, handler);
    }

    pub fn with_handlers(mut self, handlers: HashMap<String, Arc<dyn RetryHandler>>) -> Self {
        for (task_name, handler) in handlers {
            self.register_handler(task_name, handler);
        }
        self
    }

    pub fn handler_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Claim and attempt one batch of due tasks
    pub async fn process_due(&self) -> RetryCycleReport {
        let claimed = self.queue.retry_due(self.batch_size);
        let mut report = RetryCycleReport::default();

        for (index, task) in claimed.into_iter().enumerate() {
            report.attempted += 1;
            let outcome = self.process_task(task, index == 0).await;
            metrics::dlq_retries_total().add(1, &[KeyValue::new("outcome", outcome.as_str())]);
            match outcome {
                RetryOutcome::Resolved => report.resolved += 1,
                RetryOutcome::Failed => report.failed += 1,
                RetryOutcome::Dead => report.dead += 1,
                RetryOutcome::Deferred => report.deferred += 1,
                RetryOutcome::Skipped => report.skipped += 1,
            }
        }

        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                resolved = report.resolved,
                failed = report.failed,
                dead = report.dead,
                deferred = report.deferred,
                skipped = report.skipped,
                "🔁 DLQ retry cycle complete"
            );
        }
        report
    }

    /// `drain` marks the first task of a cycle: it runs even while the retry
    /// queue is rejecting, since the retries themselves are what shrink the
    /// backlog the queue depth reflects.
    async fn process_task(&self, task: DeadLetterTask, drain: bool) -> RetryOutcome {
        let task_id = task.task_id;

        let Some(handler) = self.handlers.get(&task.task_name).cloned() else {
            let reason = format!("No retry handler registered for task '{}'", task.task_name);
            return self.settle(task_id, self.queue.mark_dead(task_id, &reason));
        };

        if !self.backpressure.should_admit(&self.retry_queue).await && !drain {
            debug!(task_id = %task_id, queue = %self.retry_queue, "Retry deferred by backpressure");
            return match self.queue.release(task_id) {
                Ok(_) => RetryOutcome::Deferred,
                Err(e) => self.skip(task_id, &e),
            };
        }

        // A task may be resolved externally (cancelled) after it was claimed
        match self.queue.get(task_id).map(|current| current.status) {
            Some(TaskStatus::Retrying) => {}
            status => {
                debug!(task_id = %task_id, status = ?status, "Skipping retry of task that is no longer claimed");
                return RetryOutcome::Skipped;
            }
        }

        let fingerprint = task_fingerprint(&task.task_name, &task.payload);

        let result = self
            .idempotency
            .execute_once(&task.idempotency_key, &fingerprint, || {
                handler.handle(&task.payload)
            })
            .await;

        match result {
            Ok(_) => self.settle(task_id, self.queue.mark_resolved(task_id)),
            Err(IdempotencyError::OperationFailed(e)) => {
                let message = format!("{e:#}");
                self.settle(task_id, self.queue.mark_failed(task_id, &message))
            }
            Err(e @ IdempotencyError::Serialization { .. }) => {
                self.settle(task_id, self.queue.mark_failed(task_id, &e.to_string()))
            }
            Err(e @ IdempotencyError::Conflict { .. }) => {
                error!(task_id = %task_id, error = %e, "🚨 Idempotency conflict, task will not be retried");
                self.settle(task_id, self.queue.mark_dead(task_id, &e.to_string()))
            }
            Err(IdempotencyError::InProgress { .. }) => match self.queue.release(task_id) {
                Ok(_) => RetryOutcome::Deferred,
                Err(e) => self.skip(task_id, &e),
            },
        }
    }

    fn settle(&self, task_id: Uuid, result: Result<DeadLetterTask, DlqError>) -> RetryOutcome {
        match result {
            Ok(task) => match task.status {
                TaskStatus::Resolved => RetryOutcome::Resolved,
                TaskStatus::Dead => RetryOutcome::Dead,
                TaskStatus::Pending | TaskStatus::Retrying => RetryOutcome::Failed,
            },
            Err(e) => self.skip(task_id, &e),
        }
    }

    fn skip(&self, task_id: Uuid, error: &DlqError) -> RetryOutcome {
        warn!(task_id = %task_id, error = %error, "Dead-letter task changed during retry");
        RetryOutcome::Skipped
    }

    /// Poll every `poll_interval` until `shutdown` carries `true`
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            batch_size = self.batch_size,
            handlers = self.handlers.len(),
            "🚀 DLQ retry worker started"
        );

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    self.process_due().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("DLQ retry worker shutting down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::backpressure::AdmissionMode;
    use crate::config::{BackpressureConfig, IdempotencyConfig};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct CountingHandler {
        calls: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl RetryHandler for CountingHandler {
        async fn handle(&self, payload: &Value) -> anyhow::Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("upstream returned 503");
            }
            Ok(json!({"delivered": payload}))
        }
    }

    struct Fixture {
        queue: Arc<DeadLetterQueue>,
        backpressure: Arc<BackpressureController>,
        worker: DlqRetryWorker,
        clock: ManualClock,
    }

    fn fixture(handlers: Vec<(&str, Arc<dyn RetryHandler>)>) -> Fixture {
        let clock = ManualClock::starting_now();
        let config = DeadLetterQueueConfig::default();
        let backpressure = Arc::new(BackpressureController::new(BackpressureConfig::default()));
        let queue = Arc::new(
            DeadLetterQueue::new(&config, Arc::new(clock.clone()))
                .with_backlog_gauge(Arc::clone(&backpressure), config.retry_queue.clone()),
        );
        let idempotency = Arc::new(IdempotencyStore::new(
            &IdempotencyConfig::default(),
            Arc::new(clock.clone()),
        ));

        let mut worker = DlqRetryWorker::new(
            Arc::clone(&queue),
            Arc::clone(&backpressure),
            idempotency,
            &config,
        );
        for (name, handler) in handlers {
            worker.register_handler(name, handler);
        }

        Fixture {
            queue,
            backpressure,
            worker,
            clock,
        }
    }

    #[tokio::test]
    async fn test_successful_retry_resolves_task() {
        let handler = Arc::new(CountingHandler::default());
        let f = fixture(vec![("post_to_slack", handler.clone() as Arc<dyn RetryHandler>)]);
        let task_id = f.queue.enqueue("post_to_slack", json!({"channel": "#intel"}), "503");
        f.clock.advance(Duration::from_secs(60));

        let report = f.worker.process_due().await;

        assert_eq!(report.attempted, 1);
        assert_eq!(report.resolved, 1);
        assert_eq!(f.queue.get(task_id).unwrap().status, TaskStatus::Resolved);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.backpressure.state("dlq_retry").current_depth, 0);
    }

    #[tokio::test]
    async fn test_failing_retry_is_rescheduled() {
        let handler = Arc::new(CountingHandler {
            fail: true,
            ..Default::default()
        });
        let f = fixture(vec![("sync_crm", handler as Arc<dyn RetryHandler>)]);
        let task_id = f.queue.enqueue("sync_crm", json!({}), "timeout");
        f.clock.advance(Duration::from_secs(60));

        let report = f.worker.process_due().await;

        assert_eq!(report.failed, 1);
        let task = f.queue.get(task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 1);
        assert!(task.last_error.contains("503"));
    }

    #[tokio::test]
    async fn test_missing_handler_marks_dead() {
        let f = fixture(vec![]);
        let task_id = f.queue.enqueue("unknown_job", json!({}), "boom");
        f.clock.advance(Duration::from_secs(60));

        let report = f.worker.process_due().await;

        assert_eq!(report.dead, 1);
        assert_eq!(f.queue.get(task_id).unwrap().status, TaskStatus::Dead);
    }

    #[tokio::test]
    async fn test_rejecting_backpressure_defers_without_consuming_retry() {
        let handler = Arc::new(CountingHandler::default());
        let f = fixture(vec![("scrape", handler.clone() as Arc<dyn RetryHandler>)]);
        let first = f.queue.enqueue("scrape", json!({"page": 1}), "429");
        f.clock.advance(Duration::from_secs(1));
        let second = f.queue.enqueue("scrape", json!({"page": 2}), "429");
        f.backpressure.set_depth("dlq_retry", 500);
        f.clock.advance(Duration::from_secs(60));

        let report = f.worker.process_due().await;

        // The oldest due task drains, the rest wait for capacity
        assert_eq!(report.resolved, 1);
        assert_eq!(report.deferred, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.queue.get(first).unwrap().status, TaskStatus::Resolved);
        let task = f.queue.get(second).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 0);
    }

    #[tokio::test]
    async fn test_saturated_backlog_rejects_then_drains_each_cycle() {
        let handler = Arc::new(CountingHandler::default());
        let f = fixture(vec![("scrape", handler.clone() as Arc<dyn RetryHandler>)]);
        for page in 0..150 {
            f.queue.enqueue("scrape", json!({"page": page}), "429");
        }
        let state = f.backpressure.state("dlq_retry");
        assert_eq!(state.current_depth, 150);
        assert_eq!(state.mode, AdmissionMode::Rejecting);

        f.clock.advance(Duration::from_secs(60));
        let report = f.worker.process_due().await;

        assert_eq!(report.attempted, 100);
        assert_eq!(report.resolved, 1);
        assert_eq!(report.deferred, 99);
        assert_eq!(f.backpressure.state("dlq_retry").current_depth, 149);
        assert_eq!(f.queue.backlog(), 149);
    }

    #[tokio::test]
    async fn test_shared_idempotency_key_runs_side_effect_once() {
        let handler = Arc::new(CountingHandler::default());
        let f = fixture(vec![("publish", handler.clone() as Arc<dyn RetryHandler>)]);
        let payload = json!({"idempotency_key": "battlecard:9", "body": "v1"});
        let first = f.queue.enqueue("publish", payload.clone(), "503");
        let second = f.queue.enqueue("publish", payload, "503");
        f.clock.advance(Duration::from_secs(60));

        let report = f.worker.process_due().await;

        assert_eq!(report.resolved, 2);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.queue.get(first).unwrap().status, TaskStatus::Resolved);
        assert_eq!(f.queue.get(second).unwrap().status, TaskStatus::Resolved);
    }

    #[tokio::test]
    async fn test_idempotency_conflict_marks_dead() {
        let handler = Arc::new(CountingHandler::default());
        let f = fixture(vec![("publish", handler.clone() as Arc<dyn RetryHandler>)]);
        f.queue
            .enqueue("publish", json!({"idempotency_key": "k", "body": "v1"}), "503");
        f.clock.advance(Duration::from_secs(1));
        let conflicting = f
            .queue
            .enqueue("publish", json!({"idempotency_key": "k", "body": "v2"}), "503");
        f.clock.advance(Duration::from_secs(60));

        let report = f.worker.process_due().await;

        assert_eq!(report.resolved, 1);
        assert_eq!(report.dead, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.queue.get(conflicting).unwrap().status, TaskStatus::Dead);
    }

    #[tokio::test]
    async fn test_cancelled_task_is_skipped() {
        let handler = Arc::new(CountingHandler::default());
        let f = fixture(vec![("notify", handler.clone() as Arc<dyn RetryHandler>)]);
        let task_id = f.queue.enqueue("notify", json!({}), "503");
        f.clock.advance(Duration::from_secs(60));

        let mut claimed = f.queue.retry_due(10);
        f.queue.mark_resolved(task_id).unwrap();
        let outcome = f.worker.process_task(claimed.remove(0), true).await;

        assert_eq!(outcome, RetryOutcome::Skipped);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let f = fixture(vec![]);
        let worker = Arc::new(f.worker);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(Arc::clone(&worker).run(rx));
        tokio::time::sleep(Duration::from_secs(90)).await;
        tx.send(true).unwrap();

        handle.await.unwrap();
    }
}
