//! The task record and its status machine

use serde::{Deserialize, Serialize};

use super::result_log::{decode_child_log, ChildOutcome, ResultLogError};

/// Whether a task runs once or on a recurring schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// One-shot task; terminal on completion or permanent failure
    Async,

    /// Recurring task driven by a cron expression
    Cron,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Async => "async",
            Self::Cron => "cron",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "async" => Some(Self::Async),
            "cron" => Some(Self::Cron),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task status
///
/// `Completed` and `PermanentlyFailed` are terminal for async tasks. Cron
/// tasks oscillate between `Pending` and `Running` and settle on `Paused`
/// when retries are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    PermanentlyFailed,
    Paused,
    Suspended,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::PermanentlyFailed => "permanently_failed",
            Self::Paused => "paused",
            Self::Suspended => "suspended",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "timeout" => Some(Self::Timeout),
            "permanently_failed" => Some(Self::PermanentlyFailed),
            "paused" => Some(Self::Paused),
            "suspended" => Some(Self::Suspended),
            _ => None,
        }
    }

    /// Statuses a row must currently be in for a transition to `self` to
    /// be accepted.
    pub fn allowed_predecessors(&self) -> &'static [TaskStatus] {
        use TaskStatus::*;
        match self {
            Running => &[Pending],
            Completed => &[Running],
            Failed => &[Running],
            Timeout => &[Running],
            Pending => &[Running, Failed, Timeout, Paused, Suspended],
            PermanentlyFailed => &[Failed, Timeout],
            Paused => &[Running, Pending, Failed, Timeout],
            Suspended => &[Running],
        }
    }

    /// Whether `from -> self` is an allowed status change.
    pub fn accepts_from(&self, from: TaskStatus) -> bool {
        self.allowed_predecessors().contains(&from)
    }

    /// Terminal states for async tasks.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::PermanentlyFailed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded view of a task's `result` column
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedResult {
    /// The handler's own return value
    Value(serde_json::Value),

    /// Accumulated child outcomes, ordered by child id
    Children(Vec<ChildOutcome>),
}

/// A persisted task record
///
/// Times are whole seconds since the Unix epoch. `result` is stored raw:
/// either the handler's JSON return value or, on a suspended-then-woken
/// parent, the newline-delimited child-outcome log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: u64,
    pub name: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub priority: i32,
    pub payload: serde_json::Value,
    pub tag: Option<String>,
    pub created_at: i64,
    pub next_run_time: i64,
    pub last_active_time: Option<i64>,
    pub start_time: Option<i64>,

    /// Total wall-clock budget per attempt, in seconds
    pub timeout: i64,
    pub retry_count: u32,
    pub max_retries: u32,

    /// Seconds to wait after a failure before the task is claimable again
    pub retry_interval: i64,
    pub cron_expr: Option<String>,

    /// Id of the workflow root; equals `id` for root tasks
    pub root_id: Option<u64>,
    pub parent_id: Option<u64>,
    pub total_children: u32,
    pub completed_children: u32,

    /// Re-entry counter, incremented each time a suspended parent wakes
    pub stage: u32,
    pub worker_id: Option<String>,
    pub result: Option<String>,
    pub error: Option<String>,

    /// Opaque blob a handler can stash across stages
    pub context: Option<Vec<u8>>,
}

impl Task {
    /// Decode the raw `result` column.
    ///
    /// A completed task (or one that never spawned, `stage == 0`) holds
    /// the handler's JSON return value; anything else holds the child log.
    pub fn decoded_result(&self) -> Result<Option<DecodedResult>, ResultLogError> {
        let Some(raw) = self.result.as_deref() else {
            return Ok(None);
        };

        if self.status == TaskStatus::Completed || self.stage == 0 {
            let value =
                serde_json::from_str(raw).map_err(|e| ResultLogError::Json(e.to_string()))?;
            Ok(Some(DecodedResult::Value(value)))
        } else {
            Ok(Some(DecodedResult::Children(decode_child_log(raw)?)))
        }
    }

    /// Child outcomes accumulated since the last wake, ordered by child
    /// id. Empty for tasks that have not spawned.
    pub fn child_outcomes(&self) -> Result<Vec<ChildOutcome>, ResultLogError> {
        match self.decoded_result()? {
            Some(DecodedResult::Children(outcomes)) => Ok(outcomes),
            _ => Ok(vec![]),
        }
    }
}
