//! Submission options and store-facing insert rows

use serde::{Deserialize, Serialize};

use super::record::TaskKind;

/// Default total wall-clock budget per attempt, in seconds
pub const DEFAULT_TIMEOUT_SECS: i64 = 60;

/// Default retry limit
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default wait after a failure before the task is claimable again
pub const DEFAULT_RETRY_INTERVAL_SECS: i64 = 0;

/// Default claim priority
pub const DEFAULT_PRIORITY: i32 = 0;

/// Per-submission overrides
///
/// Unset fields fall back to the handler's registered defaults, or to the
/// parent task's values when spawning children.
///
/// # Example
///
/// ```
/// use taskforge::SubmitOptions;
///
/// let opts = SubmitOptions::new()
///     .with_priority(10)
///     .with_tag("imports")
///     .with_max_retries(5);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubmitOptions {
    /// Defer the first run by this many seconds (async tasks only)
    pub delay: Option<i64>,

    /// Claim priority; higher runs first
    pub priority: Option<i32>,

    /// Free-form grouping key for statistics; never inspected by the core
    pub tag: Option<String>,

    pub max_retries: Option<u32>,

    /// Seconds between a failure and the retry becoming claimable
    pub retry_interval: Option<i64>,

    /// Total wall-clock budget per attempt, in seconds
    pub timeout: Option<i64>,
}

impl SubmitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, seconds: i64) -> Self {
        self.delay = Some(seconds);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_retry_interval(mut self, seconds: i64) -> Self {
        self.retry_interval = Some(seconds);
        self
    }

    pub fn with_timeout(mut self, seconds: i64) -> Self {
        self.timeout = Some(seconds);
        self
    }
}

/// A child task a handler fans out into
///
/// Children are always async; unset options inherit from the parent task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildSpec {
    pub name: String,
    pub payload: serde_json::Value,
    pub options: SubmitOptions,
}

impl ChildSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: serde_json::Value::Null,
            options: SubmitOptions::default(),
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_options(mut self, options: SubmitOptions) -> Self {
        self.options = options;
        self
    }
}

/// A fully resolved row handed to the store for insertion
///
/// All defaults and inheritance have been applied by the caller; the
/// store only checks structural validity (name present, cron expression
/// matching the kind).
#[derive(Debug, Clone)]
pub struct NewTask {
    pub name: String,
    pub kind: TaskKind,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub tag: Option<String>,
    pub next_run_time: i64,
    pub timeout: i64,
    pub max_retries: u32,
    pub retry_interval: i64,
    pub cron_expr: Option<String>,
}

impl NewTask {
    /// A new async row with defaults, running as soon as claimed.
    pub fn run_once(name: impl Into<String>, payload: serde_json::Value, now: i64) -> Self {
        Self {
            name: name.into(),
            kind: TaskKind::Async,
            payload,
            priority: DEFAULT_PRIORITY,
            tag: None,
            next_run_time: now,
            timeout: DEFAULT_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_interval: DEFAULT_RETRY_INTERVAL_SECS,
            cron_expr: None,
        }
    }

    /// A new cron row with defaults. `next_run_time` must come from the
    /// schedule evaluator.
    pub fn recurring(
        name: impl Into<String>,
        cron_expr: impl Into<String>,
        payload: serde_json::Value,
        next_run_time: i64,
    ) -> Self {
        Self {
            name: name.into(),
            kind: TaskKind::Cron,
            payload,
            priority: DEFAULT_PRIORITY,
            tag: None,
            next_run_time,
            timeout: DEFAULT_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_interval: DEFAULT_RETRY_INTERVAL_SECS,
            cron_expr: Some(cron_expr.into()),
        }
    }
}
