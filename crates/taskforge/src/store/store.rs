//! TaskStore trait definition

use async_trait::async_trait;

use crate::task::{NewTask, Task, TaskStatus};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Task not found
    #[error("task not found: {0}")]
    NotFound(u64),

    /// Structurally invalid task submission
    #[error("invalid task: {0}")]
    InvalidTask(String),

    /// Status change not in the transition matrix
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    /// Unrecognized status value (bad filter input or corrupt row)
    #[error("invalid status: {0}")]
    InvalidStatus(String),

    /// Claim attempted with an empty worker id
    #[error("worker id must not be empty")]
    InvalidWorkerId,

    /// Insert-with-parent precondition failed: the parent is not running
    #[error("parent task {0} is not running")]
    ParentNotRunning(u64),

    /// Transient backend error; callers may retry
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Links inserted tasks to a running parent, suspending it
#[derive(Debug, Clone)]
pub struct ParentLink {
    /// Root of the workflow tree the children belong to
    pub root_id: u64,

    /// The spawning task; must be `running` and async
    pub parent_id: u64,

    /// Replacement for the parent's context blob, if the handler stashed one
    pub context: Option<Vec<u8>>,
}

/// Optional fields accompanying a status change
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    /// Raw result text (serialized JSON)
    pub result: Option<String>,

    /// Error string/trace of the most recent failure
    pub error: Option<String>,

    pub next_run_time: Option<i64>,

    /// Overwrite the retry counter (used by resume)
    pub retry_count: Option<u32>,

    /// When set with a `Completed` transition, the same transaction
    /// appends this task's outcome to the parent's child log and performs
    /// wake accounting.
    pub parent_id: Option<u64>,
}

/// Filter for task listing and bulk deletion
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub name: Option<String>,
    pub tag: Option<String>,
    pub status: Option<TaskStatus>,
}

impl TaskFilter {
    pub fn by_tag(tag: impl Into<String>) -> Self {
        Self {
            tag: Some(tag.into()),
            ..Self::default()
        }
    }

    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn by_status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

/// One row of the (tag, name, status) statistics aggregation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagStat {
    pub tag: Option<String>,
    pub name: String,
    pub status: TaskStatus,
    pub count: u64,
}

/// Per-step counts from one maintenance sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Rows that exceeded their total timeout
    pub timed_out: u64,

    /// Rows whose worker stopped heartbeating
    pub heartbeat_lost: u64,

    /// Rows rescheduled for another attempt
    pub retried: u64,

    /// Rows that exhausted retries (async -> permanently_failed,
    /// cron -> paused)
    pub exhausted: u64,

    /// Suspended parents that absorbed a child's permanent failure
    pub cascaded: u64,

    /// Terminal rows deleted by expiry GC
    pub expired: u64,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Shared persistent task storage
///
/// The store is the concurrency boundary between producers, dispatchers,
/// executors, and maintenance loops, possibly across processes. Every
/// composite operation below (claim, status change with parent
/// accounting, insert with parent suspend, the timeout sweep) must be
/// serialisable: a transaction with status predicates for relational
/// implementations, an exclusive guard for in-memory ones.
#[async_trait]
pub trait TaskStore: Send + Sync + 'static {
    /// Insert one or more tasks, returning their assigned ids in order.
    ///
    /// With a [`ParentLink`], the same atomic step asserts the parent is
    /// `running`, flips it to `suspended`, adds `tasks.len()` to its
    /// `total_children`, optionally replaces its context blob, and clears
    /// its result so the child log starts fresh. Fails with
    /// [`StoreError::ParentNotRunning`] otherwise.
    async fn insert(
        &self,
        tasks: Vec<NewTask>,
        link: Option<ParentLink>,
    ) -> Result<Vec<u64>, StoreError>;

    /// Claim the best eligible pending task for `worker_id`.
    ///
    /// Eligible rows have `status = pending`, `name` in `names`, and
    /// `next_run_time <= now`; the winner is picked by
    /// `priority DESC, next_run_time ASC, id ASC` and atomically flipped
    /// to `running` with `start_time`, `last_active_time`, and
    /// `worker_id` set. Empty `names` yields `Ok(None)`.
    async fn claim(&self, names: &[String], worker_id: &str) -> Result<Option<Task>, StoreError>;

    /// Transition a task to `status`, validating against the matrix.
    ///
    /// When `update.parent_id` is set and `status` is `Completed`, the
    /// same transaction appends `<id>:<result>` to the parent's child
    /// log, bumps `completed_children`, and, if that reaches
    /// `total_children`, wakes the parent (`suspended -> pending`,
    /// `stage + 1`).
    async fn update_status(
        &self,
        id: u64,
        status: TaskStatus,
        update: StatusUpdate,
    ) -> Result<(), StoreError>;

    /// Best-effort bulk heartbeat: bump `last_active_time` to now.
    async fn update_active_time(&self, ids: &[u64]) -> Result<(), StoreError>;

    /// Run one maintenance sweep: total-timeout detection, heartbeat-lost
    /// detection, retry scheduling, retry exhaustion (with parent
    /// failure propagation), and, when `expire_seconds` is set, expiry
    /// GC of terminal rows. Steps run in this order; each step is its own
    /// transaction on relational stores.
    async fn handle_timeouts(
        &self,
        active_interval_ms: u64,
        expire_seconds: Option<i64>,
    ) -> Result<SweepReport, StoreError>;

    // =========================================================================
    // Read side
    // =========================================================================

    async fn get(&self, id: u64) -> Result<Task, StoreError>;

    async fn get_by_name(&self, name: &str) -> Result<Vec<Task>, StoreError>;

    async fn get_by_status(&self, statuses: &[TaskStatus]) -> Result<Vec<Task>, StoreError>;

    async fn get_by_tag(&self, tag: &str) -> Result<Vec<Task>, StoreError>;

    /// Direct children of a workflow parent.
    async fn get_children(&self, parent_id: u64) -> Result<Vec<Task>, StoreError>;

    async fn get_running(&self) -> Result<Vec<Task>, StoreError> {
        self.get_by_status(&[TaskStatus::Running]).await
    }

    /// Aggregated counts grouped by (tag, name, status), sorted
    /// lexicographically.
    async fn get_stats(
        &self,
        tag: Option<&str>,
        status: Option<TaskStatus>,
    ) -> Result<Vec<TagStat>, StoreError>;

    /// Filtered listing, newest first by creation time.
    async fn get_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>, StoreError>;

    /// Bulk delete matching tasks, returning the affected count.
    async fn delete_tasks(&self, filter: TaskFilter) -> Result<u64, StoreError>;

    /// Release backend resources. Called once by the manager on stop.
    async fn close(&self) -> Result<(), StoreError>;
}

/// Structural checks shared by both store implementations.
pub(crate) fn validate_new_task(task: &NewTask) -> Result<(), StoreError> {
    if task.name.is_empty() {
        return Err(StoreError::InvalidTask("task name is required".into()));
    }
    match task.kind {
        crate::task::TaskKind::Cron if task.cron_expr.is_none() => Err(StoreError::InvalidTask(
            "cron task requires a cron expression".into(),
        )),
        crate::task::TaskKind::Async if task.cron_expr.is_some() => Err(StoreError::InvalidTask(
            "async task must not carry a cron expression".into(),
        )),
        _ => Ok(()),
    }
}
