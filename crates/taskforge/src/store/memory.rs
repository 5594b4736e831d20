//! In-memory implementation of TaskStore
//!
//! Every composite operation takes one exclusive lock over the whole
//! store, which gives the same serialisable semantics the PostgreSQL
//! implementation gets from transactions and status-predicate updates.
//! Secondary indices on status, name, tag, and parent keep the hot
//! lookups (claim, sweeps, workflow reads) away from full scans.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::store::{
    validate_new_task, ParentLink, StatusUpdate, StoreError, SweepReport, TagStat, TaskFilter,
    TaskStore,
};
use crate::task::{
    failure_line, now_secs, success_line, NewTask, Task, TaskKind, TaskStatus,
};

const TOTAL_TIMEOUT_ERROR: &str = "Task exceeded total timeout limit";
const HEARTBEAT_LOST_ERROR: &str = "Task heartbeat lost - worker may be dead";

#[derive(Default)]
struct StoreState {
    tasks: HashMap<u64, Task>,
    by_status: HashMap<TaskStatus, BTreeSet<u64>>,
    by_name: HashMap<String, BTreeSet<u64>>,
    by_tag: HashMap<String, BTreeSet<u64>>,
    by_parent: HashMap<u64, BTreeSet<u64>>,
    next_id: u64,
}

impl StoreState {
    fn index(&mut self, task: &Task) {
        self.by_status.entry(task.status).or_default().insert(task.id);
        self.by_name
            .entry(task.name.clone())
            .or_default()
            .insert(task.id);
        if let Some(tag) = &task.tag {
            self.by_tag.entry(tag.clone()).or_default().insert(task.id);
        }
        if let Some(parent_id) = task.parent_id {
            self.by_parent.entry(parent_id).or_default().insert(task.id);
        }
    }

    fn unindex(&mut self, task: &Task) {
        if let Some(set) = self.by_status.get_mut(&task.status) {
            set.remove(&task.id);
        }
        if let Some(set) = self.by_name.get_mut(&task.name) {
            set.remove(&task.id);
        }
        if let Some(tag) = &task.tag {
            if let Some(set) = self.by_tag.get_mut(tag) {
                set.remove(&task.id);
            }
        }
        if let Some(parent_id) = task.parent_id {
            if let Some(set) = self.by_parent.get_mut(&parent_id) {
                set.remove(&task.id);
            }
        }
    }

    fn set_status(&mut self, id: u64, status: TaskStatus) {
        let task = self.tasks.get_mut(&id).expect("status change on known id");
        let old = task.status;
        task.status = status;
        if let Some(set) = self.by_status.get_mut(&old) {
            set.remove(&id);
        }
        self.by_status.entry(status).or_default().insert(id);
    }

    fn status_ids(&self, status: TaskStatus) -> Vec<u64> {
        self.by_status
            .get(&status)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    fn insert_row(&mut self, row: NewTask, root_id: Option<u64>, parent_id: Option<u64>) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        let now = now_secs();

        let task = Task {
            id,
            name: row.name,
            kind: row.kind,
            status: TaskStatus::Pending,
            priority: row.priority,
            payload: row.payload,
            tag: row.tag,
            created_at: now,
            next_run_time: row.next_run_time,
            last_active_time: None,
            start_time: None,
            timeout: row.timeout,
            retry_count: 0,
            max_retries: row.max_retries,
            retry_interval: row.retry_interval,
            cron_expr: row.cron_expr,
            root_id: Some(root_id.unwrap_or(id)),
            parent_id,
            total_children: 0,
            completed_children: 0,
            stage: 0,
            worker_id: None,
            result: None,
            error: None,
            context: None,
        };

        self.index(&task);
        self.tasks.insert(id, task);
        id
    }

    /// Append a child outcome line to a suspended parent and wake it when
    /// the last child lands. Returns true if the parent was woken.
    fn record_child_outcome(&mut self, parent_id: u64, line: &str) -> bool {
        let Some(parent) = self.tasks.get_mut(&parent_id) else {
            return false;
        };

        parent.result.get_or_insert_with(String::new).push_str(line);
        parent.completed_children += 1;

        let wake = parent.status == TaskStatus::Suspended
            && parent.completed_children >= parent.total_children;
        if wake {
            parent.stage += 1;
            self.set_status(parent_id, TaskStatus::Pending);
        }
        wake
    }

    fn remove(&mut self, id: u64) {
        if let Some(task) = self.tasks.remove(&id) {
            self.unindex(&task);
        }
    }

}

fn filter_matches(task: &Task, filter: &TaskFilter) -> bool {
    if let Some(name) = &filter.name {
        if &task.name != name {
            return false;
        }
    }
    if let Some(tag) = &filter.tag {
        if task.tag.as_deref() != Some(tag.as_str()) {
            return false;
        }
    }
    if let Some(status) = filter.status {
        if task.status != status {
            return false;
        }
    }
    true
}

/// In-memory implementation of TaskStore
///
/// Suitable for tests and single-process deployments; shares claim,
/// workflow, and sweep semantics with [`super::PostgresTaskStore`].
///
/// # Example
///
/// ```
/// use taskforge::InMemoryTaskStore;
///
/// let store = InMemoryTaskStore::new();
/// ```
pub struct InMemoryTaskStore {
    inner: Mutex<StoreState>,
}

impl InMemoryTaskStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StoreState::default()),
        }
    }

    /// Number of stored tasks
    pub fn task_count(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    /// Number of pending tasks
    pub fn pending_count(&self) -> usize {
        self.inner
            .lock()
            .by_status
            .get(&TaskStatus::Pending)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        *self.inner.lock() = StoreState::default();
    }

    /// Rewind a task's clocks by `seconds` (for testing sweeps without
    /// waiting out real intervals).
    pub fn rewind_times(&self, id: u64, seconds: i64) {
        let mut state = self.inner.lock();
        if let Some(task) = state.tasks.get_mut(&id) {
            if let Some(t) = task.last_active_time.as_mut() {
                *t -= seconds;
            }
            if let Some(t) = task.start_time.as_mut() {
                *t -= seconds;
            }
        }
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(
        &self,
        tasks: Vec<NewTask>,
        link: Option<ParentLink>,
    ) -> Result<Vec<u64>, StoreError> {
        if tasks.is_empty() {
            return Err(StoreError::InvalidTask("no tasks to insert".into()));
        }
        for row in &tasks {
            validate_new_task(row)?;
        }

        let mut state = self.inner.lock();

        let (root_id, parent_id) = match &link {
            Some(link) => {
                let parent = state
                    .tasks
                    .get(&link.parent_id)
                    .ok_or(StoreError::NotFound(link.parent_id))?;
                if parent.kind != TaskKind::Async {
                    return Err(StoreError::InvalidTask(
                        "parent of a workflow must be an async task".into(),
                    ));
                }
                if parent.status != TaskStatus::Running {
                    return Err(StoreError::ParentNotRunning(link.parent_id));
                }

                let parent = state.tasks.get_mut(&link.parent_id).expect("checked above");
                parent.total_children += tasks.len() as u32;
                parent.result = None;
                if let Some(context) = &link.context {
                    parent.context = Some(context.clone());
                }
                state.set_status(link.parent_id, TaskStatus::Suspended);

                (Some(link.root_id), Some(link.parent_id))
            }
            None => (None, None),
        };

        let ids = tasks
            .into_iter()
            .map(|row| state.insert_row(row, root_id, parent_id))
            .collect();
        Ok(ids)
    }

    async fn claim(&self, names: &[String], worker_id: &str) -> Result<Option<Task>, StoreError> {
        if worker_id.is_empty() {
            return Err(StoreError::InvalidWorkerId);
        }
        if names.is_empty() {
            return Ok(None);
        }

        let now = now_secs();
        let mut state = self.inner.lock();

        let mut best: Option<(i32, i64, u64)> = None;
        for id in state.status_ids(TaskStatus::Pending) {
            let task = &state.tasks[&id];
            if task.next_run_time > now || !names.contains(&task.name) {
                continue;
            }
            let key = (-task.priority, task.next_run_time, task.id);
            if best.map_or(true, |b| key < b) {
                best = Some(key);
            }
        }

        let Some((_, _, id)) = best else {
            return Ok(None);
        };

        state.set_status(id, TaskStatus::Running);
        let task = state.tasks.get_mut(&id).expect("claimed id exists");
        task.start_time = Some(now);
        task.last_active_time = Some(now);
        task.worker_id = Some(worker_id.to_string());
        Ok(Some(task.clone()))
    }

    async fn update_status(
        &self,
        id: u64,
        status: TaskStatus,
        update: StatusUpdate,
    ) -> Result<(), StoreError> {
        let mut state = self.inner.lock();

        let task = state.tasks.get(&id).ok_or(StoreError::NotFound(id))?;
        let from = task.status;
        if !status.accepts_from(from) {
            return Err(StoreError::InvalidTransition { from, to: status });
        }

        let now = now_secs();
        let task = state.tasks.get_mut(&id).expect("checked above");
        task.last_active_time = Some(now);
        if let Some(result) = &update.result {
            task.result = Some(result.clone());
        }
        if let Some(error) = &update.error {
            task.error = Some(error.clone());
        }
        if let Some(next_run_time) = update.next_run_time {
            task.next_run_time = next_run_time;
        }
        if let Some(retry_count) = update.retry_count {
            task.retry_count = retry_count;
        }
        state.set_status(id, status);

        if status == TaskStatus::Completed {
            if let Some(parent_id) = update.parent_id {
                let result_json = update.result.as_deref().unwrap_or("null");
                let line = success_line(id, result_json);
                state.record_child_outcome(parent_id, &line);
            }
        }

        Ok(())
    }

    async fn update_active_time(&self, ids: &[u64]) -> Result<(), StoreError> {
        let now = now_secs();
        let mut state = self.inner.lock();
        for id in ids {
            if let Some(task) = state.tasks.get_mut(id) {
                task.last_active_time = Some(now);
            }
        }
        Ok(())
    }

    async fn handle_timeouts(
        &self,
        active_interval_ms: u64,
        expire_seconds: Option<i64>,
    ) -> Result<SweepReport, StoreError> {
        let now = now_secs();
        let mut report = SweepReport::default();
        let mut state = self.inner.lock();

        // Total-timeout detection
        for id in state.status_ids(TaskStatus::Running) {
            let task = &state.tasks[&id];
            let expired = task
                .start_time
                .map(|start| start + task.timeout < now)
                .unwrap_or(false);
            if expired {
                let task = state.tasks.get_mut(&id).expect("running id exists");
                task.error = Some(TOTAL_TIMEOUT_ERROR.to_string());
                task.last_active_time = Some(now);
                state.set_status(id, TaskStatus::Timeout);
                report.timed_out += 1;
            }
        }

        // Heartbeat-lost detection over the rows still running
        let lost_before_ms = now * 1000 - 5 * active_interval_ms as i64;
        for id in state.status_ids(TaskStatus::Running) {
            let task = &state.tasks[&id];
            let lost = task
                .last_active_time
                .map(|t| t * 1000 < lost_before_ms)
                .unwrap_or(false);
            if lost {
                let task = state.tasks.get_mut(&id).expect("running id exists");
                task.error = Some(HEARTBEAT_LOST_ERROR.to_string());
                task.last_active_time = Some(now);
                state.set_status(id, TaskStatus::Timeout);
                report.heartbeat_lost += 1;
            }
        }

        // Retry scheduling for failed/timed-out rows with attempts left
        let mut failed_ids = state.status_ids(TaskStatus::Timeout);
        failed_ids.extend(state.status_ids(TaskStatus::Failed));
        for id in &failed_ids {
            let task = &state.tasks[id];
            let eligible = task.retry_count < task.max_retries
                && task
                    .last_active_time
                    .map(|t| t + task.retry_interval < now)
                    .unwrap_or(true);
            if eligible {
                let task = state.tasks.get_mut(id).expect("failed id exists");
                task.retry_count += 1;
                task.stage = 0;
                task.result = None;
                task.context = None;
                task.last_active_time = Some(now);
                task.next_run_time = now + task.retry_interval;
                state.set_status(*id, TaskStatus::Pending);
                report.retried += 1;
            }
        }

        // Retry exhaustion; async failures cascade into suspended parents
        let mut exhausted_ids = state.status_ids(TaskStatus::Timeout);
        exhausted_ids.extend(state.status_ids(TaskStatus::Failed));
        for id in exhausted_ids {
            let task = &state.tasks[&id];
            if task.retry_count < task.max_retries {
                continue;
            }
            report.exhausted += 1;
            match task.kind {
                TaskKind::Cron => state.set_status(id, TaskStatus::Paused),
                TaskKind::Async => {
                    let parent_id = task.parent_id;
                    let error = task.error.clone().unwrap_or_else(|| "task failed".into());
                    state.set_status(id, TaskStatus::PermanentlyFailed);

                    let suspended_parent = parent_id.filter(|pid| {
                        state
                            .tasks
                            .get(pid)
                            .map(|p| p.status == TaskStatus::Suspended)
                            .unwrap_or(false)
                    });
                    if let Some(pid) = suspended_parent {
                        let line = failure_line(id, &error);
                        state.record_child_outcome(pid, &line);
                        report.cascaded += 1;
                    }
                }
            }
        }

        // Expiry GC of terminal rows
        if let Some(expire) = expire_seconds {
            let cutoff = now - expire;
            let mut expired_ids = state.status_ids(TaskStatus::Completed);
            expired_ids.extend(state.status_ids(TaskStatus::PermanentlyFailed));
            for id in expired_ids {
                let stale = state.tasks[&id]
                    .last_active_time
                    .map(|t| t < cutoff)
                    .unwrap_or(false);
                if stale {
                    state.remove(id);
                    report.expired += 1;
                }
            }
        }

        Ok(report)
    }

    async fn get(&self, id: u64) -> Result<Task, StoreError> {
        self.inner
            .lock()
            .tasks
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn get_by_name(&self, name: &str) -> Result<Vec<Task>, StoreError> {
        let state = self.inner.lock();
        Ok(state
            .by_name
            .get(name)
            .map(|ids| ids.iter().map(|id| state.tasks[id].clone()).collect())
            .unwrap_or_default())
    }

    async fn get_by_status(&self, statuses: &[TaskStatus]) -> Result<Vec<Task>, StoreError> {
        let state = self.inner.lock();
        let mut tasks = Vec::new();
        for status in statuses {
            if let Some(ids) = state.by_status.get(status) {
                tasks.extend(ids.iter().map(|id| state.tasks[id].clone()));
            }
        }
        Ok(tasks)
    }

    async fn get_by_tag(&self, tag: &str) -> Result<Vec<Task>, StoreError> {
        let state = self.inner.lock();
        Ok(state
            .by_tag
            .get(tag)
            .map(|ids| ids.iter().map(|id| state.tasks[id].clone()).collect())
            .unwrap_or_default())
    }

    async fn get_children(&self, parent_id: u64) -> Result<Vec<Task>, StoreError> {
        let state = self.inner.lock();
        Ok(state
            .by_parent
            .get(&parent_id)
            .map(|ids| ids.iter().map(|id| state.tasks[id].clone()).collect())
            .unwrap_or_default())
    }

    async fn get_stats(
        &self,
        tag: Option<&str>,
        status: Option<TaskStatus>,
    ) -> Result<Vec<TagStat>, StoreError> {
        let state = self.inner.lock();
        let mut counts: HashMap<(Option<String>, String, TaskStatus), u64> = HashMap::new();

        for task in state.tasks.values() {
            if let Some(tag) = tag {
                if task.tag.as_deref() != Some(tag) {
                    continue;
                }
            }
            if let Some(status) = status {
                if task.status != status {
                    continue;
                }
            }
            *counts
                .entry((task.tag.clone(), task.name.clone(), task.status))
                .or_default() += 1;
        }

        let mut stats: Vec<TagStat> = counts
            .into_iter()
            .map(|((tag, name, status), count)| TagStat {
                tag,
                name,
                status,
                count,
            })
            .collect();
        stats.sort_by(|a, b| {
            (a.tag.as_deref(), &a.name, a.status.as_str())
                .cmp(&(b.tag.as_deref(), &b.name, b.status.as_str()))
        });
        Ok(stats)
    }

    async fn get_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>, StoreError> {
        let state = self.inner.lock();
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| filter_matches(t, &filter))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(tasks)
    }

    async fn delete_tasks(&self, filter: TaskFilter) -> Result<u64, StoreError> {
        let mut state = self.inner.lock();
        let ids: Vec<u64> = state
            .tasks
            .values()
            .filter(|t| filter_matches(t, &filter))
            .map(|t| t.id)
            .collect();
        for id in &ids {
            state.remove(*id);
        }
        Ok(ids.len() as u64)
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    async fn submit(store: &InMemoryTaskStore, name: &str, priority: i32) -> u64 {
        let mut row = NewTask::run_once(name, json!({}), now_secs());
        row.priority = priority;
        store.insert(vec![row], None).await.unwrap()[0]
    }

    #[tokio::test]
    async fn test_insert_assigns_monotone_ids_and_self_root() {
        let store = InMemoryTaskStore::new();
        let a = submit(&store, "a", 0).await;
        let b = submit(&store, "b", 0).await;
        assert!(b > a);

        let task = store.get(a).await.unwrap();
        assert_eq!(task.root_id, Some(a));
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_claim_prefers_priority_then_id() {
        let store = InMemoryTaskStore::new();
        let low = submit(&store, "job", 0).await;
        let high = submit(&store, "job", 10).await;
        let mid = submit(&store, "job", 5).await;

        let names = names(&["job"]);
        let first = store.claim(&names, "w1").await.unwrap().unwrap();
        let second = store.claim(&names, "w1").await.unwrap().unwrap();
        let third = store.claim(&names, "w1").await.unwrap().unwrap();

        assert_eq!(first.id, high);
        assert_eq!(second.id, mid);
        assert_eq!(third.id, low);
        assert_eq!(first.worker_id.as_deref(), Some("w1"));
        assert!(first.start_time.is_some());
    }

    #[tokio::test]
    async fn test_claim_skips_future_and_unknown_names() {
        let store = InMemoryTaskStore::new();
        let mut future = NewTask::run_once("job", json!({}), now_secs() + 3600);
        future.priority = 100;
        store.insert(vec![future], None).await.unwrap();
        submit(&store, "other", 0).await;

        assert!(store.claim(&names(&["job"]), "w1").await.unwrap().is_none());
        assert!(store.claim(&[], "w1").await.unwrap().is_none());
        assert!(matches!(
            store.claim(&names(&["job"]), "").await,
            Err(StoreError::InvalidWorkerId)
        ));
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let store = std::sync::Arc::new(InMemoryTaskStore::new());
        submit(&store, "job", 0).await;

        let mut claims = 0;
        for worker in ["w1", "w2", "w3", "w4"] {
            if store
                .claim(&names(&["job"]), worker)
                .await
                .unwrap()
                .is_some()
            {
                claims += 1;
            }
        }
        assert_eq!(claims, 1);
    }

    #[tokio::test]
    async fn test_update_status_enforces_matrix() {
        let store = InMemoryTaskStore::new();
        let id = submit(&store, "job", 0).await;

        let err = store
            .update_status(id, TaskStatus::Completed, StatusUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidTransition {
                from: TaskStatus::Pending,
                to: TaskStatus::Completed,
            }
        ));

        // Row unchanged after the rejected transition
        assert_eq!(store.get(id).await.unwrap().status, TaskStatus::Pending);

        store.claim(&names(&["job"]), "w1").await.unwrap().unwrap();
        store
            .update_status(id, TaskStatus::Completed, StatusUpdate::default())
            .await
            .unwrap();
        assert_eq!(store.get(id).await.unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_spawn_suspends_parent_and_wake_on_last_child() {
        let store = InMemoryTaskStore::new();
        let parent = submit(&store, "parent", 0).await;
        store.claim(&names(&["parent"]), "w1").await.unwrap();

        let children = vec![
            NewTask::run_once("child", json!({"n": 1}), now_secs()),
            NewTask::run_once("child", json!({"n": 2}), now_secs()),
        ];
        let child_ids = store
            .insert(
                children,
                Some(ParentLink {
                    root_id: parent,
                    parent_id: parent,
                    context: Some(b"state".to_vec()),
                }),
            )
            .await
            .unwrap();

        let p = store.get(parent).await.unwrap();
        assert_eq!(p.status, TaskStatus::Suspended);
        assert_eq!(p.total_children, 2);
        assert_eq!(p.context.as_deref(), Some(b"state".as_ref()));

        for (i, child_id) in child_ids.iter().enumerate() {
            store.claim(&names(&["child"]), "w1").await.unwrap();
            store
                .update_status(
                    *child_id,
                    TaskStatus::Completed,
                    StatusUpdate {
                        result: Some(format!("{{\"n\":{i}}}")),
                        parent_id: Some(parent),
                        ..StatusUpdate::default()
                    },
                )
                .await
                .unwrap();
        }

        let p = store.get(parent).await.unwrap();
        assert_eq!(p.status, TaskStatus::Pending);
        assert_eq!(p.completed_children, 2);
        assert_eq!(p.stage, 1);

        let outcomes = p.child_outcomes().unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].child_id(), child_ids[0]);
    }

    #[tokio::test]
    async fn test_spawn_requires_running_parent() {
        let store = InMemoryTaskStore::new();
        let parent = submit(&store, "parent", 0).await;

        let err = store
            .insert(
                vec![NewTask::run_once("child", json!({}), now_secs())],
                Some(ParentLink {
                    root_id: parent,
                    parent_id: parent,
                    context: None,
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ParentNotRunning(_)));
    }

    #[tokio::test]
    async fn test_sweep_total_timeout_then_retry() {
        let store = InMemoryTaskStore::new();
        let mut row = NewTask::run_once("job", json!({}), now_secs());
        row.timeout = 1;
        row.max_retries = 1;
        let id = store.insert(vec![row], None).await.unwrap()[0];
        store.claim(&names(&["job"]), "w1").await.unwrap();

        // Not yet over budget
        let report = store.handle_timeouts(1_000, None).await.unwrap();
        assert_eq!(report.timed_out, 0);

        store.rewind_times(id, 5);
        let report = store.handle_timeouts(1_000_000, None).await.unwrap();
        assert_eq!(report.timed_out, 1);
        let task = store.get(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Timeout);
        assert!(task.error.as_deref().unwrap().contains("timeout"));

        // Next sweep reschedules the retry
        store.rewind_times(id, 5);
        let report = store.handle_timeouts(1_000_000, None).await.unwrap();
        assert_eq!(report.retried, 1);
        let task = store.get(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 1);
    }

    #[tokio::test]
    async fn test_sweep_heartbeat_lost() {
        let store = InMemoryTaskStore::new();
        let id = submit(&store, "job", 0).await;
        store.claim(&names(&["job"]), "w1").await.unwrap();

        store.rewind_times(id, 10);
        let report = store.handle_timeouts(1_000, None).await.unwrap();
        assert_eq!(report.heartbeat_lost, 1);
        assert_eq!(report.timed_out, 0);

        let task = store.get(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Timeout);
        assert!(task.error.as_deref().unwrap().contains("heartbeat lost"));
    }

    #[tokio::test]
    async fn test_sweep_exhaustion_paused_for_cron() {
        let store = InMemoryTaskStore::new();
        let mut row = NewTask::recurring("tick", "* * * * *", json!({}), now_secs());
        row.max_retries = 0;
        let id = store.insert(vec![row], None).await.unwrap()[0];

        store.claim(&names(&["tick"]), "w1").await.unwrap();
        store
            .update_status(
                id,
                TaskStatus::Failed,
                StatusUpdate {
                    error: Some("boom".into()),
                    ..StatusUpdate::default()
                },
            )
            .await
            .unwrap();

        let report = store.handle_timeouts(1_000, None).await.unwrap();
        assert_eq!(report.exhausted, 1);
        assert_eq!(store.get(id).await.unwrap().status, TaskStatus::Paused);
    }

    #[tokio::test]
    async fn test_sweep_cascades_permanent_failure_into_parent() {
        let store = InMemoryTaskStore::new();
        let parent = submit(&store, "parent", 0).await;
        store.claim(&names(&["parent"]), "w1").await.unwrap();

        let mut child = NewTask::run_once("child", json!({}), now_secs());
        child.max_retries = 0;
        let child_id = store
            .insert(
                vec![child],
                Some(ParentLink {
                    root_id: parent,
                    parent_id: parent,
                    context: None,
                }),
            )
            .await
            .unwrap()[0];

        store.claim(&names(&["child"]), "w1").await.unwrap();
        store
            .update_status(
                child_id,
                TaskStatus::Failed,
                StatusUpdate {
                    error: Some("child blew up".into()),
                    ..StatusUpdate::default()
                },
            )
            .await
            .unwrap();

        let report = store.handle_timeouts(1_000, None).await.unwrap();
        assert_eq!(report.exhausted, 1);
        assert_eq!(report.cascaded, 1);

        assert_eq!(
            store.get(child_id).await.unwrap().status,
            TaskStatus::PermanentlyFailed
        );
        let p = store.get(parent).await.unwrap();
        assert_eq!(p.status, TaskStatus::Pending);
        assert_eq!(p.stage, 1);
        let outcomes = p.child_outcomes().unwrap();
        assert!(outcomes[0].is_failure());
    }

    #[tokio::test]
    async fn test_sweep_expiry_gc() {
        let store = InMemoryTaskStore::new();
        let old = submit(&store, "job", 0).await;
        let fresh = submit(&store, "job", 0).await;

        for id in [old, fresh] {
            store.claim(&names(&["job"]), "w1").await.unwrap();
            store
                .update_status(id, TaskStatus::Completed, StatusUpdate::default())
                .await
                .unwrap();
        }
        store.rewind_times(old, 3_600);

        let report = store.handle_timeouts(1_000, Some(1_800)).await.unwrap();
        assert_eq!(report.expired, 1);
        assert!(matches!(
            store.get(old).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(store.get(fresh).await.is_ok());
    }

    #[tokio::test]
    async fn test_stats_grouped_and_sorted() {
        let store = InMemoryTaskStore::new();
        for (name, tag) in [("a", Some("t1")), ("a", Some("t1")), ("b", Some("t2")), ("c", None)] {
            let mut row = NewTask::run_once(name, json!({}), now_secs());
            row.tag = tag.map(String::from);
            store.insert(vec![row], None).await.unwrap();
        }

        let stats = store.get_stats(None, None).await.unwrap();
        assert_eq!(stats.len(), 3);
        // Untagged first, then t1 before t2
        assert_eq!(stats[0].tag, None);
        assert_eq!(stats[1].tag.as_deref(), Some("t1"));
        assert_eq!(stats[1].count, 2);
        assert_eq!(stats[2].tag.as_deref(), Some("t2"));

        let filtered = store.get_stats(Some("t1"), None).await.unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].name, "a");
    }

    #[tokio::test]
    async fn test_get_tasks_newest_first_and_delete() {
        let store = InMemoryTaskStore::new();
        let a = submit(&store, "a", 0).await;
        let b = submit(&store, "b", 0).await;

        let tasks = store.get_tasks(TaskFilter::default()).await.unwrap();
        assert_eq!(tasks[0].id, b);
        assert_eq!(tasks[1].id, a);

        let deleted = store.delete_tasks(TaskFilter::by_name("a")).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.task_count(), 1);
    }
}
