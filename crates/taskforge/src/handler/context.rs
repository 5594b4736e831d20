//! Task execution context and handler outcome

use std::pin::Pin;
use std::sync::Arc;

use crate::task::{now_secs, ChildOutcome, ChildSpec, Task};

/// What a handler invocation produced
pub type HandlerResult = Result<HandlerOutcome, String>;

/// Boxed future returned by handlers
pub type HandlerFuture = Pin<Box<dyn std::future::Future<Output = HandlerResult> + Send>>;

/// Handler function type
pub type TaskHandler = Arc<dyn Fn(TaskContext) -> HandlerFuture + Send + Sync>;

/// Return value of a handler invocation
///
/// Returning `Spawn` is the sole way to fan out: the executor inspects
/// the value, persists the children, and suspends the parent. The parent
/// is re-invoked (with `stage` incremented and the child outcomes
/// available on its context) once every child reaches a terminal state.
#[derive(Debug, Clone)]
pub enum HandlerOutcome {
    /// Leaf completion with the handler's JSON result
    Complete(serde_json::Value),

    /// Fan out into child tasks, suspending this task until they finish
    Spawn {
        children: Vec<ChildSpec>,
        /// Replacement for the task's context blob, carried across stages
        context: Option<Vec<u8>>,
    },
}

impl HandlerOutcome {
    pub fn complete(value: serde_json::Value) -> Self {
        Self::Complete(value)
    }

    pub fn spawn(children: Vec<ChildSpec>) -> Self {
        Self::Spawn {
            children,
            context: None,
        }
    }

    pub fn spawn_with_context(children: Vec<ChildSpec>, context: Vec<u8>) -> Self {
        Self::Spawn {
            children,
            context: Some(context),
        }
    }
}

/// Context handed to a handler for one execution attempt
///
/// Carries a snapshot of the claimed task, the decoded child outcomes
/// from the previous stage (empty on stage 0), and a cooperative timeout
/// check.
///
/// # Example
///
/// ```ignore
/// manager.register("resize", HandlerRegistration::new(|ctx: TaskContext| async move {
///     if ctx.stage() == 0 {
///         let children = plan_chunks(ctx.payload());
///         return Ok(HandlerOutcome::spawn(children));
///     }
///     let merged = merge(ctx.child_outcomes());
///     Ok(HandlerOutcome::complete(merged))
/// }))?;
/// ```
pub struct TaskContext {
    task: Task,
    child_outcomes: Vec<ChildOutcome>,
    started_at: i64,
}

impl TaskContext {
    pub(crate) fn new(task: Task, child_outcomes: Vec<ChildOutcome>, started_at: i64) -> Self {
        Self {
            task,
            child_outcomes,
            started_at,
        }
    }

    /// Snapshot of the task row as claimed.
    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.task.payload
    }

    /// Re-entry counter; 0 on the first invocation, incremented on each
    /// wake from suspension. Handlers branch on this to resume work.
    pub fn stage(&self) -> u32 {
        self.task.stage
    }

    /// Outcomes of the children spawned in the previous stage, ordered by
    /// child id. Empty when the task has not fanned out.
    pub fn child_outcomes(&self) -> &[ChildOutcome] {
        &self.child_outcomes
    }

    /// The opaque blob stored by a previous stage's spawn, if any.
    pub fn context(&self) -> Option<&[u8]> {
        self.task.context.as_deref()
    }

    /// Cooperative timeout check: errs once this attempt has consumed
    /// its total wall-clock budget. The error message classifies the
    /// failure as a timeout.
    pub fn check_timeout(&self) -> Result<(), String> {
        let elapsed = now_secs() - self.started_at;
        if elapsed >= self.task.timeout {
            Err(format!(
                "task timeout: exceeded {}s budget after {}s",
                self.task.timeout, elapsed
            ))
        } else {
            Ok(())
        }
    }
}
