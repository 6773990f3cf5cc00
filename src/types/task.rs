#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use super::identifiers::WorkerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Queued,
    InProgress,
    AwaitingApproval,
    Completed,
    Failed,
}

impl TaskStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl TryFrom<&str> for TaskStatus {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "queued" => Ok(Self::Queued),
            "in_progress" => Ok(Self::InProgress),
            "awaiting_approval" => Ok(Self::AwaitingApproval),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown task status: {s}")),
        }
    }
}

/// A background unit of work with dependency edges and retry bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub role: String,
    pub status: TaskStatus,
    pub priority: i32,
    pub payload: Value,
    pub depends_on: Vec<Uuid>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub is_retryable: bool,
    pub approval_required: bool,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub session_id: Option<String>,
    pub created_by: Option<String>,
    pub claimed_by: Option<WorkerId>,
    pub started_at: Option<DateTime<Utc>>,
    pub timeout_seconds: u32,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Whether the in-progress heartbeat is stale beyond the task timeout.
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        if self.status != TaskStatus::InProgress {
            return false;
        }
        let reference = self.last_heartbeat_at.or(self.started_at);
        reference.is_some_and(|seen| {
            (now - seen).num_seconds() >= i64::from(self.timeout_seconds)
        })
    }
}

/// Creation request for `TaskScheduler::create_task`. An explicit `id` lets
/// producers wire dependency graphs before inserting every node.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub id: Option<Uuid>,
    pub role: String,
    pub payload: Value,
    pub depends_on: Vec<Uuid>,
    pub priority: i32,
    pub approval_required: bool,
    pub is_retryable: bool,
    pub max_retries: Option<u32>,
    pub session_id: Option<String>,
    pub created_by: Option<String>,
    pub timeout_seconds: u32,
}

impl NewTask {
    #[must_use]
    pub fn new(role: impl Into<String>, payload: Value) -> Self {
        Self {
            id: None,
            role: role.into(),
            payload,
            depends_on: Vec::new(),
            priority: 0,
            approval_required: false,
            is_retryable: true,
            max_retries: None,
            session_id: None,
            created_by: None,
            timeout_seconds: 300,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    #[must_use]
    pub fn depends_on(mut self, deps: Vec<Uuid>) -> Self {
        self.depends_on = deps;
        self
    }

    #[must_use]
    pub const fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub const fn approval_required(mut self, required: bool) -> Self {
        self.approval_required = required;
        self
    }

    #[must_use]
    pub const fn retryable(mut self, retryable: bool) -> Self {
        self.is_retryable = retryable;
        self
    }

    #[must_use]
    pub const fn max_retries(mut self, max: u32) -> Self {
        self.max_retries = Some(max);
        self
    }
}

/// Outcome of an atomic claim attempt. A lost race is a normal result, not an
/// error.
#[derive(Debug, Clone)]
pub struct ClaimOutcome {
    pub success: bool,
    pub task: Option<Task>,
}

impl ClaimOutcome {
    #[must_use]
    pub const fn won(task: Task) -> Self {
        Self {
            success: true,
            task: Some(task),
        }
    }

    #[must_use]
    pub const fn lost() -> Self {
        Self {
            success: false,
            task: None,
        }
    }
}

/// Outcome of `fail_task_with_retry`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Returned to the queue; `attempt` is the retry number just consumed.
    Scheduled { attempt: u32, delay: Duration },
    /// Retries exhausted or the task is not retryable; terminal failure.
    Exhausted,
}
