//! # Dead-Letter Queue
//!
//! Failed tasks land here with a bounded retry schedule; exhausted tasks are
//! kept as DEAD for operator inspection. [`DlqRetryWorker`] drains due tasks,
//! consulting backpressure and the idempotency store before each attempt.

pub mod queue;
pub mod task;
pub mod worker;

pub use queue::{DeadLetterQueue, DlqStats};
pub use task::{DeadLetterTask, TaskAttempt, TaskStatus};
pub use worker::{DlqRetryWorker, RetryCycleReport, RetryHandler};

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DlqError {
    #[error("Dead-letter task {task_id} not found")]
    TaskNotFound { task_id: Uuid },

    #[error("Cannot {action} dead-letter task {task_id} in status {from}")]
    InvalidTransition {
        task_id: Uuid,
        from: TaskStatus,
        action: &'static str,
    },
}

impl DlqError {
    pub fn invalid_transition(task_id: Uuid, from: TaskStatus, action: &'static str) -> Self {
        Self::InvalidTransition {
            task_id,
            from,
            action,
        }
    }
}

pub type DlqResult<T> = Result<T, DlqError>;
