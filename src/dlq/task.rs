//! Dead-letter task model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::idempotency::content_fingerprint;

/// Lifecycle of a dead-letter task
///
/// `Pending -> Retrying -> {Resolved | Pending | Dead}`; an operator can move
/// `Dead` back to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Retrying,
    Dead,
    Resolved,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Retrying => "RETRYING",
            TaskStatus::Dead => "DEAD",
            TaskStatus::Resolved => "RESOLVED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Dead | TaskStatus::Resolved)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "retrying" => Ok(TaskStatus::Retrying),
            "dead" => Ok(TaskStatus::Dead),
            "resolved" => Ok(TaskStatus::Resolved),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

/// One failed execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAttempt {
    /// 0 is the original failure that enqueued the task
    pub attempt: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
    /// None when this failure exhausted the backoff table
    pub next_retry_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterTask {
    pub task_id: Uuid,
    pub task_name: String,
    pub payload: Value,
    /// Key under which retries consult the idempotency store
    pub idempotency_key: String,
    pub last_error: String,
    pub retry_count: u32,
    /// None once the task is DEAD or RESOLVED
    pub next_retry_at: Option<DateTime<Utc>>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub history: Vec<TaskAttempt>,
}

impl DeadLetterTask {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending
            && self.next_retry_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// Idempotency key for a payload: its `idempotency_key` field when present,
/// otherwise the task id.
pub(crate) fn idempotency_key_for(payload: &Value, task_id: Uuid) -> String {
    payload
        .get("idempotency_key")
        .and_then(Value::as_str)
        .filter(|key| !key.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| task_id.to_string())
}

/// Content fingerprint of a task: its name plus payload
pub(crate) fn task_fingerprint(task_name: &str, payload: &Value) -> String {
    content_fingerprint(&serde_json::json!({
        "task_name": task_name,
        "payload": payload,
    }))
}

/// Truncate on a character boundary
pub(crate) fn truncate_error(error: &str, max_chars: usize) -> String {
    match error.char_indices().nth(max_chars) {
        Some((byte_index, _)) => error[..byte_index].to_string(),
        None => error.to_string(),
    }
}
