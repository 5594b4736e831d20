//! Task execution
//!
//! One executor fiber runs one claimed task to an outcome: invoke the
//! handler, then interpret its return as fan-out (insert children +
//! suspend parent), leaf completion, cron reschedule, or captured
//! failure. Execution errors never propagate to the dispatcher; the task
//! row is the only place an outcome lands.

use std::sync::Arc;

use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, error};

use super::RunningSet;
use crate::handler::{HandlerEntry, HandlerOutcome, TaskContext};
use crate::schedule::CronSchedule;
use crate::store::{ParentLink, StatusUpdate, StoreError, TaskStore};
use crate::task::{now_secs, ChildSpec, NewTask, Task, TaskKind, TaskStatus};

/// Releases every per-process resource a claimed task holds, even if the
/// handler's future panics.
struct ExecutionSlot {
    entry: Arc<HandlerEntry>,
    running: RunningSet,
    task_id: u64,
    _permit: OwnedSemaphorePermit,
}

impl Drop for ExecutionSlot {
    fn drop(&mut self) {
        self.entry.release();
        self.running.remove(self.task_id);
    }
}

/// Run one claimed task to completion. The dispatcher has already bumped
/// the per-type running count and inserted the id into the running set.
pub(crate) async fn run_task(
    store: Arc<dyn TaskStore>,
    entry: Arc<HandlerEntry>,
    running: RunningSet,
    task: Task,
    permit: OwnedSemaphorePermit,
) {
    let _slot = ExecutionSlot {
        entry: Arc::clone(&entry),
        running,
        task_id: task.id,
        _permit: permit,
    };

    let started_at = now_secs();
    let child_outcomes = match task.child_outcomes() {
        Ok(outcomes) => outcomes,
        Err(e) => {
            record_failure(&store, &task, format!("corrupt child log: {e}")).await;
            return;
        }
    };

    let ctx = TaskContext::new(task.clone(), child_outcomes, started_at);
    let result = (entry.handler())(ctx).await;

    match result {
        Ok(HandlerOutcome::Spawn { children, context }) => {
            spawn_children(&store, &task, children, context).await;
        }
        Ok(HandlerOutcome::Complete(value)) => {
            complete(&store, &task, value).await;
        }
        Err(message) => {
            record_failure(&store, &task, message).await;
        }
    }
}

async fn spawn_children(
    store: &Arc<dyn TaskStore>,
    task: &Task,
    children: Vec<ChildSpec>,
    context: Option<Vec<u8>>,
) {
    let now = now_secs();
    let rows: Vec<NewTask> = children
        .into_iter()
        .map(|child| inherit(child, task, now))
        .collect();
    let count = rows.len();

    let link = ParentLink {
        root_id: task.root_id.unwrap_or(task.id),
        parent_id: task.id,
        context,
    };

    match store.insert(rows, Some(link)).await {
        Ok(ids) => {
            debug!(task_id = task.id, children = count, first_child = ?ids.first(), "task fanned out");
        }
        Err(e) => {
            // Covers spawn([]) and a parent the sweep already timed out
            record_failure(store, task, format!("spawn failed: {e}")).await;
        }
    }
}

/// Children inherit unset knobs from their parent and are always async.
fn inherit(child: ChildSpec, parent: &Task, now: i64) -> NewTask {
    let opts = child.options;
    NewTask {
        name: child.name,
        kind: TaskKind::Async,
        payload: child.payload,
        priority: opts.priority.unwrap_or(parent.priority),
        tag: opts.tag.or_else(|| parent.tag.clone()),
        next_run_time: now + opts.delay.unwrap_or(0),
        timeout: opts.timeout.unwrap_or(parent.timeout),
        max_retries: opts.max_retries.unwrap_or(parent.max_retries),
        retry_interval: opts.retry_interval.unwrap_or(parent.retry_interval),
        cron_expr: None,
    }
}

async fn complete(store: &Arc<dyn TaskStore>, task: &Task, value: serde_json::Value) {
    let result = match serde_json::to_string(&value) {
        Ok(json) => json,
        Err(e) => {
            record_failure(store, task, format!("unserializable result: {e}")).await;
            return;
        }
    };

    let write = match task.kind {
        TaskKind::Async => {
            store.update_status(
                task.id,
                TaskStatus::Completed,
                StatusUpdate {
                    result: Some(result),
                    parent_id: task.parent_id,
                    ..StatusUpdate::default()
                },
            )
        }
        TaskKind::Cron => {
            let next_run_time = match next_fire(task) {
                Ok(t) => t,
                Err(message) => {
                    record_failure(store, task, message).await;
                    return;
                }
            };
            store.update_status(
                task.id,
                TaskStatus::Pending,
                StatusUpdate {
                    result: Some(result),
                    next_run_time: Some(next_run_time),
                    ..StatusUpdate::default()
                },
            )
        }
    };

    match write.await {
        Ok(()) => debug!(task_id = task.id, "task completed"),
        Err(e) => discard_superseded(task.id, e),
    }
}

fn next_fire(task: &Task) -> Result<i64, String> {
    let expr = task
        .cron_expr
        .as_deref()
        .ok_or_else(|| "cron task has no expression".to_string())?;
    let schedule = CronSchedule::parse(expr).map_err(|e| e.to_string())?;
    schedule.next_after(now_secs()).map_err(|e| e.to_string())
}

async fn record_failure(store: &Arc<dyn TaskStore>, task: &Task, message: String) {
    let status = if message.contains("timeout") {
        TaskStatus::Timeout
    } else {
        TaskStatus::Failed
    };
    debug!(task_id = task.id, %status, "task failed: {}", message);

    let write = store
        .update_status(
            task.id,
            status,
            StatusUpdate {
                error: Some(message),
                ..StatusUpdate::default()
            },
        )
        .await;
    if let Err(e) = write {
        discard_superseded(task.id, e);
    }
}

/// The maintenance sweep may have flipped the row (e.g. to `timeout`)
/// while the handler was still running; the row's state is authoritative
/// and the executor's late write is dropped.
fn discard_superseded(task_id: u64, e: StoreError) {
    match e {
        StoreError::InvalidTransition { from, to } => {
            debug!(task_id, %from, %to, "outcome discarded; row already advanced");
        }
        other => error!(task_id, "failed to record task outcome: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::SubmitOptions;

    fn parent() -> Task {
        Task {
            id: 7,
            name: "p".to_string(),
            kind: TaskKind::Async,
            status: TaskStatus::Running,
            priority: 3,
            payload: serde_json::Value::Null,
            tag: Some("batch".to_string()),
            created_at: 0,
            next_run_time: 0,
            last_active_time: None,
            start_time: None,
            timeout: 90,
            retry_count: 0,
            max_retries: 5,
            retry_interval: 11,
            cron_expr: None,
            root_id: Some(7),
            parent_id: None,
            total_children: 0,
            completed_children: 0,
            stage: 0,
            worker_id: None,
            result: None,
            error: None,
            context: None,
        }
    }

    #[test]
    fn test_children_inherit_unset_fields() {
        let child = ChildSpec::new("c");
        let row = inherit(child, &parent(), 1_000);

        assert_eq!(row.kind, TaskKind::Async);
        assert_eq!(row.priority, 3);
        assert_eq!(row.tag.as_deref(), Some("batch"));
        assert_eq!(row.timeout, 90);
        assert_eq!(row.max_retries, 5);
        assert_eq!(row.retry_interval, 11);
        assert_eq!(row.next_run_time, 1_000);
    }

    #[test]
    fn test_children_overrides_win() {
        let child = ChildSpec::new("c").with_options(
            SubmitOptions::new()
                .with_priority(0)
                .with_timeout(10)
                .with_delay(60)
                .with_tag("other"),
        );
        let row = inherit(child, &parent(), 1_000);

        assert_eq!(row.priority, 0);
        assert_eq!(row.timeout, 10);
        assert_eq!(row.tag.as_deref(), Some("other"));
        assert_eq!(row.next_run_time, 1_060);
    }
}
