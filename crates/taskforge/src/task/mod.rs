//! Task model: the persisted record, its status machine, submission
//! options, and the child-outcome log format parents accumulate.

mod options;
mod record;
mod result_log;

pub use options::{
    ChildSpec, NewTask, SubmitOptions, DEFAULT_MAX_RETRIES, DEFAULT_PRIORITY,
    DEFAULT_RETRY_INTERVAL_SECS, DEFAULT_TIMEOUT_SECS,
};
pub use record::{DecodedResult, Task, TaskKind, TaskStatus};
pub use result_log::{decode_child_log, failure_line, success_line, ChildOutcome, ResultLogError};

/// Current wall-clock time as whole seconds since the Unix epoch.
///
/// All persisted task times use this resolution.
pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
