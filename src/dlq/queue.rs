//! # Dead-Letter Queue
//!
//! Holds tasks whose execution failed and schedules bounded retries from a
//! fixed backoff table indexed by `retry_count`. Each task sits behind its own
//! mutex, so claiming, failing and resolving one task never blocks another.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backpressure::BackpressureController;
use crate::clock::{chrono_duration, Clock};
use crate::config::DeadLetterQueueConfig;
use crate::dlq::task::{idempotency_key_for, truncate_error};
use crate::dlq::{DeadLetterTask, DlqError, DlqResult, TaskAttempt, TaskStatus};
use crate::metrics;

#[derive(Debug, Default)]
struct LifetimeCounters {
    enqueued: AtomicU64,
    retries_scheduled: AtomicU64,
    dead_letters: AtomicU64,
    manual_retries: AtomicU64,
    resolved: AtomicU64,
}

/// Counts by status plus lifetime totals
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlqStats {
    pub pending: usize,
    pub retrying: usize,
    pub dead: usize,
    pub resolved: usize,
    pub total: usize,
    pub enqueued_total: u64,
    pub retries_scheduled: u64,
    pub dead_letters: u64,
    pub manual_retries: u64,
    pub resolved_total: u64,
}

/// Mirrors the retry backlog (PENDING + RETRYING tasks) into a backpressure
/// queue's depth
#[derive(Debug)]
struct BacklogGauge {
    controller: Arc<BackpressureController>,
    queue: String,
}

#[derive(Debug)]
pub struct DeadLetterQueue {
    tasks: DashMap<Uuid, Arc<Mutex<DeadLetterTask>>>,
    backoff: Vec<Duration>,
    max_error_length: usize,
    clock: Arc<dyn Clock>,
    counters: LifetimeCounters,
    backlog: Option<BacklogGauge>,
}

impl DeadLetterQueue {
    pub fn new(config: &DeadLetterQueueConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_backoff(config.backoff_table(), config.max_error_length, clock)
    }

    pub fn with_backoff(
        backoff: Vec<Duration>,
        max_error_length: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            tasks: DashMap::new(),
            backoff,
            max_error_length,
            clock,
            counters: LifetimeCounters::default(),
            backlog: None,
        }
    }

    /// Report the retry backlog as the depth of `queue` on `controller`
    pub fn with_backlog_gauge(
        mut self,
        controller: Arc<BackpressureController>,
        queue: impl Into<String>,
    ) -> Self {
        self.backlog = Some(BacklogGauge {
            controller,
            queue: queue.into(),
        });
        self
    }

    fn backlog_grew(&self) {
        if let Some(gauge) = &self.backlog {
            gauge.controller.record_enqueue(&gauge.queue);
        }
    }

    fn backlog_shrank(&self) {
        if let Some(gauge) = &self.backlog {
            gauge.controller.record_dequeue(&gauge.queue);
        }
    }

    /// Tasks still scheduled or in flight
    pub fn backlog(&self) -> usize {
        self.tasks
            .iter()
            .filter(|entry| !entry.value().lock().status.is_terminal())
            .count()
    }

    pub fn backoff_table(&self) -> &[Duration] {
        &self.backoff
    }

    fn delay_for(&self, retry_count: u32) -> Option<Duration> {
        self.backoff.get(retry_count as usize).copied()
    }

    fn task_handle(&self, task_id: Uuid) -> DlqResult<Arc<Mutex<DeadLetterTask>>> {
        self.tasks
            .get(&task_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(DlqError::TaskNotFound { task_id })
    }

    /// Record a failed task; the first retry is scheduled `backoff[0]` from now
    pub fn enqueue(&self, task_name: &str, payload: Value, error: &str) -> Uuid {
        self.enqueue_with_key(task_name, payload, error, None)
    }

    /// [`enqueue`](Self::enqueue) with an explicit idempotency key, so retries
    /// share the key the original caller executed under
    pub fn enqueue_with_key(
        &self,
        task_name: &str,
        payload: Value,
        error: &str,
        idempotency_key: Option<String>,
    ) -> Uuid {
        let task_id = Uuid::new_v4();
        let now = self.clock.now();
        let first_delay = self.delay_for(0).unwrap_or_default();
        let next_retry_at = now + chrono_duration(first_delay);
        let last_error = truncate_error(error, self.max_error_length);

        let task = DeadLetterTask {
            task_id,
            task_name: task_name.to_string(),
            idempotency_key: idempotency_key
                .unwrap_or_else(|| idempotency_key_for(&payload, task_id)),
            payload,
            last_error: last_error.clone(),
            retry_count: 0,
            next_retry_at: Some(next_retry_at),
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            history: vec![TaskAttempt {
                attempt: 0,
                error: last_error,
                failed_at: now,
                next_retry_at: Some(next_retry_at),
            }],
        };

        self.tasks.insert(task_id, Arc::new(Mutex::new(task)));
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        self.backlog_grew();
        metrics::dlq_enqueued_total().add(1, &[KeyValue::new("task_name", task_name.to_string())]);

        warn!(
            task_id = %task_id,
            task_name = %task_name,
            next_retry_at = %next_retry_at,
            "📮 Task added to dead-letter queue"
        );

        task_id
    }

    /// Claim up to `limit` due tasks (PENDING with `next_retry_at <= now`),
    /// oldest due first. Claimed tasks move to RETRYING and are invisible to
    /// other callers until failed, resolved or released.
    pub fn retry_due(&self, limit: usize) -> Vec<DeadLetterTask> {
        let now = self.clock.now();

        let mut candidates: Vec<(DateTime<Utc>, Arc<Mutex<DeadLetterTask>>)> = self
            .tasks
            .iter()
            .filter_map(|entry| {
                let task = entry.value().lock();
                if task.is_due(now) {
                    task.next_retry_at.map(|at| (at, Arc::clone(entry.value())))
                } else {
                    None
                }
            })
            .collect();
        candidates.sort_by_key(|(due_at, _)| *due_at);

        let mut claimed = Vec::new();
        for (_, handle) in candidates {
            if claimed.len() >= limit {
                break;
            }
            let mut task = handle.lock();
            // Re-check under the task lock; another worker may have claimed it
            if !task.is_due(now) {
                continue;
            }
            task.status = TaskStatus::Retrying;
            task.updated_at = now;
            debug!(
                task_id = %task.task_id,
                task_name = %task.task_name,
                retry_count = task.retry_count,
                "Claimed dead-letter task for retry"
            );
            claimed.push(task.clone());
        }

        claimed
    }

    /// Mark a task as successfully completed (or cancelled by an operator)
    pub fn mark_resolved(&self, task_id: Uuid) -> DlqResult<DeadLetterTask> {
        let handle = self.task_handle(task_id)?;
        let mut task = handle.lock();

        if task.status == TaskStatus::Resolved {
            return Err(DlqError::invalid_transition(task_id, task.status, "resolve"));
        }

        let was_live = !task.status.is_terminal();
        task.status = TaskStatus::Resolved;
        task.next_retry_at = None;
        task.updated_at = self.clock.now();
        self.counters.resolved.fetch_add(1, Ordering::Relaxed);
        if was_live {
            self.backlog_shrank();
        }

        info!(
            task_id = %task_id,
            task_name = %task.task_name,
            retry_count = task.retry_count,
            "✅ Dead-letter task resolved"
        );

        Ok(task.clone())
    }

    /// Record a failed retry. The task is rescheduled from the backoff table,
    /// or becomes DEAD once `retry_count` reaches the table length.
    pub fn mark_failed(&self, task_id: Uuid, error: &str) -> DlqResult<DeadLetterTask> {
        let handle = self.task_handle(task_id)?;
        let mut task = handle.lock();

        if !matches!(task.status, TaskStatus::Pending | TaskStatus::Retrying) {
            return Err(DlqError::invalid_transition(task_id, task.status, "fail"));
        }

        let now = self.clock.now();
        let error = truncate_error(error, self.max_error_length);
        task.retry_count += 1;
        task.last_error = error.clone();
        task.updated_at = now;

        match self.delay_for(task.retry_count) {
            Some(delay) => {
                let next_retry_at = now + chrono_duration(delay);
                task.status = TaskStatus::Pending;
                task.next_retry_at = Some(next_retry_at);
                self.counters.retries_scheduled.fetch_add(1, Ordering::Relaxed);

                warn!(
                    task_id = %task_id,
                    task_name = %task.task_name,
                    retry_count = task.retry_count,
                    next_retry_at = %next_retry_at,
                    "🔁 Retry failed, rescheduled"
                );
            }
            None => {
                task.status = TaskStatus::Dead;
                task.next_retry_at = None;
                self.counters.dead_letters.fetch_add(1, Ordering::Relaxed);
                self.backlog_shrank();
                metrics::dlq_dead_letters_total()
                    .add(1, &[KeyValue::new("task_name", task.task_name.clone())]);

                error!(
                    task_id = %task_id,
                    task_name = %task.task_name,
                    retry_count = task.retry_count,
                    last_error = %task.last_error,
                    "💀 Retries exhausted, task is dead"
                );
            }
        }

        let attempt = task.retry_count;
        let next_retry_at = task.next_retry_at;
        task.history.push(TaskAttempt {
            attempt,
            error,
            failed_at: now,
            next_retry_at,
        });

        Ok(task.clone())
    }

    /// Move a task straight to DEAD (fatal error, no handler, idempotency conflict)
    pub fn mark_dead(&self, task_id: Uuid, reason: &str) -> DlqResult<DeadLetterTask> {
        let handle = self.task_handle(task_id)?;
        let mut task = handle.lock();

        if task.status.is_terminal() {
            return Err(DlqError::invalid_transition(task_id, task.status, "kill"));
        }

        let now = self.clock.now();
        let reason = truncate_error(reason, self.max_error_length);
        task.status = TaskStatus::Dead;
        task.next_retry_at = None;
        task.last_error = reason.clone();
        task.updated_at = now;
        let attempt = task.retry_count;
        task.history.push(TaskAttempt {
            attempt,
            error: reason,
            failed_at: now,
            next_retry_at: None,
        });
        self.counters.dead_letters.fetch_add(1, Ordering::Relaxed);
        self.backlog_shrank();
        metrics::dlq_dead_letters_total()
            .add(1, &[KeyValue::new("task_name", task.task_name.clone())]);

        error!(
            task_id = %task_id,
            task_name = %task.task_name,
            reason = %task.last_error,
            "💀 Task moved to dead state"
        );

        Ok(task.clone())
    }

    /// Give a claimed task back without consuming a retry
    pub fn release(&self, task_id: Uuid) -> DlqResult<DeadLetterTask> {
        let handle = self.task_handle(task_id)?;
        let mut task = handle.lock();

        if task.status != TaskStatus::Retrying {
            return Err(DlqError::invalid_transition(task_id, task.status, "release"));
        }

        task.status = TaskStatus::Pending;
        task.updated_at = self.clock.now();
        debug!(task_id = %task_id, "Released claimed task back to pending");
        Ok(task.clone())
    }

    pub fn is_claimed(&self, task_id: Uuid) -> bool {
        self.tasks
            .get(&task_id)
            .map(|entry| entry.value().lock().status == TaskStatus::Retrying)
            .unwrap_or(false)
    }

    /// Operator force-requeue of a DEAD task: retry count restarts at zero and
    /// the next attempt is scheduled `backoff[0]` from now.
    pub fn retry_dead(&self, task_id: Uuid) -> DlqResult<DeadLetterTask> {
        let handle = self.task_handle(task_id)?;
        let mut task = handle.lock();

        if task.status != TaskStatus::Dead {
            return Err(DlqError::invalid_transition(task_id, task.status, "requeue"));
        }

        let now = self.clock.now();
        let next_retry_at = now + chrono_duration(self.delay_for(0).unwrap_or_default());
        task.status = TaskStatus::Pending;
        task.retry_count = 0;
        task.next_retry_at = Some(next_retry_at);
        task.updated_at = now;
        self.counters.manual_retries.fetch_add(1, Ordering::Relaxed);
        self.backlog_grew();

        info!(
            task_id = %task_id,
            task_name = %task.task_name,
            next_retry_at = %next_retry_at,
            "🔄 Dead task requeued by operator"
        );

        Ok(task.clone())
    }

    pub fn get(&self, task_id: Uuid) -> Option<DeadLetterTask> {
        self.tasks
            .get(&task_id)
            .map(|entry| entry.value().lock().clone())
    }

    /// Tasks filtered by status, newest first
    pub fn list(&self, status: Option<TaskStatus>, limit: usize) -> Vec<DeadLetterTask> {
        let mut tasks: Vec<DeadLetterTask> = self
            .tasks
            .iter()
            .map(|entry| entry.value().lock().clone())
            .filter(|task| status.map(|s| task.status == s).unwrap_or(true))
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks.truncate(limit);
        tasks
    }

    pub fn stats(&self) -> DlqStats {
        let mut by_status: HashMap<TaskStatus, usize> = HashMap::new();
        for entry in self.tasks.iter() {
            *by_status.entry(entry.value().lock().status).or_insert(0) += 1;
        }
        let count = |status: TaskStatus| by_status.get(&status).copied().unwrap_or(0);

        DlqStats {
            pending: count(TaskStatus::Pending),
            retrying: count(TaskStatus::Retrying),
            dead: count(TaskStatus::Dead),
            resolved: count(TaskStatus::Resolved),
            total: self.tasks.len(),
            enqueued_total: self.counters.enqueued.load(Ordering::Relaxed),
            retries_scheduled: self.counters.retries_scheduled.load(Ordering::Relaxed),
            dead_letters: self.counters.dead_letters.load(Ordering::Relaxed),
            manual_retries: self.counters.manual_retries.load(Ordering::Relaxed),
            resolved_total: self.counters.resolved.load(Ordering::Relaxed),
        }
    }

    /// Drop DEAD and RESOLVED tasks untouched for longer than `retention`
    pub fn cleanup_dead_older_than(&self, retention: Duration) -> usize {
        let cutoff = self.clock.now() - chrono_duration(retention);
        let before = self.tasks.len();

        self.tasks.retain(|_, handle| {
            let task = handle.lock();
            !(task.status.is_terminal() && task.updated_at < cutoff)
        });

        let removed = before.saturating_sub(self.tasks.len());
        if removed > 0 {
            info!(removed = removed, "🧹 Cleaned up expired dead-letter tasks");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
