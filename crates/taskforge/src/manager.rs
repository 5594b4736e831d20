//! Public manager façade
//!
//! [`TaskManager`] ties the pieces together for one worker process:
//! handler registration, submission APIs, the dispatch and maintenance
//! loops, pause/resume controls, and the read surface. Lifecycle is
//! `init -> running -> stopped`; a stopped manager cannot be restarted.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::handler::{HandlerRegistration, HandlerRegistry, RegistryError};
use crate::runtime::{Dispatcher, MaintenanceLoop, RunningSet};
use crate::schedule::{CronSchedule, ScheduleError};
use crate::store::{StatusUpdate, StoreError, TagStat, TaskFilter, TaskStore};
use crate::task::{
    now_secs, DecodedResult, NewTask, ResultLogError, SubmitOptions, Task, TaskKind, TaskStatus,
};
use crate::validate::ValidationError;

/// Manager lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerState {
    /// Created; handlers may be registered, loops are not running
    Init,

    /// Dispatching and sweeping
    Running,

    /// Drained and closed; terminal
    Stopped,
}

impl std::fmt::Display for ManagerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Manager errors
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    /// `start()` called while already running
    #[error("manager is already running")]
    AlreadyRunning,

    /// `start()` called on a stopped manager
    #[error("a stopped manager cannot be restarted")]
    CannotRestart,

    /// Operation requires a manager that has not been stopped
    #[error("manager is not accepting work")]
    NotRunning,

    /// Registration error (late registration, bad schema)
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Cron expression rejected at submission
    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    /// Payload rejected by the handler's registered schema
    #[error(transparent)]
    Payload(#[from] ValidationError),

    /// Store error
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A stored result column failed to decode
    #[error(transparent)]
    ResultDecode(#[from] ResultLogError),
}

fn default_worker_id() -> String {
    format!("worker-{}", Uuid::now_v7())
}

/// Manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskManagerConfig {
    /// Claimer identity persisted on every task this process runs
    pub worker_id: String,

    /// Global cap on concurrently executing tasks
    pub max_concurrent_tasks: usize,

    /// How long the dispatcher sleeps when the queue is empty
    pub poll_interval_ms: u64,

    /// Heartbeat and sweep cadence
    pub active_update_interval_ms: u64,

    /// Age after which terminal tasks are garbage collected; None keeps
    /// them forever
    pub expire_seconds: Option<i64>,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            max_concurrent_tasks: 10,
            poll_interval_ms: 500,
            active_update_interval_ms: 1_000,
            expire_seconds: None,
        }
    }
}

impl TaskManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max.max(1);
        self
    }

    pub fn with_poll_interval_ms(mut self, millis: u64) -> Self {
        self.poll_interval_ms = millis.max(1);
        self
    }

    pub fn with_active_update_interval_ms(mut self, millis: u64) -> Self {
        self.active_update_interval_ms = millis.max(1);
        self
    }

    pub fn with_expire_seconds(mut self, seconds: i64) -> Self {
        self.expire_seconds = Some(seconds);
        self
    }
}

/// A task row together with its decoded result
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub task: Task,
    pub result: Option<DecodedResult>,
}

/// Durable task manager
///
/// # Example
///
/// ```ignore
/// use taskforge::prelude::*;
///
/// let store = Arc::new(InMemoryTaskStore::new());
/// let manager = TaskManager::new(store, TaskManagerConfig::default());
///
/// manager.register("greet", HandlerRegistration::new(|ctx| async move {
///     Ok(HandlerOutcome::complete(serde_json::json!({
///         "hello": ctx.payload()["name"],
///     })))
/// }))?;
///
/// manager.start().await?;
/// let id = manager
///     .submit_async("greet", serde_json::json!({"name": "ada"}), SubmitOptions::new())
///     .await?;
/// // ... later
/// manager.stop().await?;
/// ```
pub struct TaskManager {
    store: Arc<dyn TaskStore>,
    registry: Arc<HandlerRegistry>,
    config: TaskManagerConfig,
    state: RwLock<ManagerState>,
    running: RunningSet,
    semaphore: Arc<Semaphore>,
    wake: Arc<Notify>,
    pause_tx: watch::Sender<bool>,
    dispatcher_shutdown_tx: watch::Sender<bool>,
    maintenance_shutdown_tx: watch::Sender<bool>,
    dispatcher_handle: Mutex<Option<JoinHandle<()>>>,
    maintenance_handle: Mutex<Option<JoinHandle<()>>>,
}

impl TaskManager {
    /// Create a manager over a shared store
    pub fn new(store: Arc<dyn TaskStore>, config: TaskManagerConfig) -> Self {
        let (pause_tx, _) = watch::channel(false);
        let (dispatcher_shutdown_tx, _) = watch::channel(false);
        let (maintenance_shutdown_tx, _) = watch::channel(false);

        Self {
            store,
            registry: Arc::new(HandlerRegistry::new()),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_tasks)),
            config,
            state: RwLock::new(ManagerState::Init),
            running: RunningSet::new(),
            wake: Arc::new(Notify::new()),
            pause_tx,
            dispatcher_shutdown_tx,
            maintenance_shutdown_tx,
            dispatcher_handle: Mutex::new(None),
            maintenance_handle: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ManagerState {
        *self.state.read().expect("state lock poisoned")
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Tasks currently executing in this process
    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Register a handler under `name`. Allowed only before `start()`.
    pub fn register(
        &self,
        name: impl Into<String>,
        registration: HandlerRegistration,
    ) -> Result<(), ManagerError> {
        self.registry.register(name, registration)?;
        Ok(())
    }

    /// Register several handlers at once.
    pub fn register_all<I, N>(&self, entries: I) -> Result<(), ManagerError>
    where
        I: IntoIterator<Item = (N, HandlerRegistration)>,
        N: Into<String>,
    {
        for (name, registration) in entries {
            self.register(name, registration)?;
        }
        Ok(())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start the dispatch and maintenance loops.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn start(&self) -> Result<(), ManagerError> {
        {
            let mut state = self.state.write().expect("state lock poisoned");
            match *state {
                ManagerState::Running => return Err(ManagerError::AlreadyRunning),
                ManagerState::Stopped => return Err(ManagerError::CannotRestart),
                ManagerState::Init => *state = ManagerState::Running,
            }
        }

        self.registry.seal();
        info!(
            worker_id = %self.config.worker_id,
            handlers = self.registry.len(),
            max_concurrent = self.config.max_concurrent_tasks,
            "manager starting"
        );

        let dispatcher = Dispatcher {
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            running: self.running.clone(),
            semaphore: Arc::clone(&self.semaphore),
            wake: Arc::clone(&self.wake),
            pause_rx: self.pause_tx.subscribe(),
            shutdown_rx: self.dispatcher_shutdown_tx.subscribe(),
            poll_interval: Duration::from_millis(self.config.poll_interval_ms),
            worker_id: self.config.worker_id.clone(),
        };
        *self.dispatcher_handle.lock().expect("handle lock poisoned") =
            Some(tokio::spawn(dispatcher.run()));

        let maintenance = MaintenanceLoop {
            store: Arc::clone(&self.store),
            running: self.running.clone(),
            active_interval_ms: self.config.active_update_interval_ms,
            expire_seconds: self.config.expire_seconds,
            shutdown_rx: self.maintenance_shutdown_tx.subscribe(),
        };
        *self
            .maintenance_handle
            .lock()
            .expect("handle lock poisoned") = Some(tokio::spawn(maintenance.run()));

        Ok(())
    }

    /// Stop accepting work, drain in-flight tasks, and close the store.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn stop(&self) -> Result<(), ManagerError> {
        {
            let mut state = self.state.write().expect("state lock poisoned");
            match *state {
                ManagerState::Running => *state = ManagerState::Stopped,
                ManagerState::Stopped => return Ok(()),
                ManagerState::Init => return Err(ManagerError::NotRunning),
            }
        }

        // No new claims; in-flight tasks keep their heartbeats until the
        // drain completes.
        self.dispatcher_shutdown_tx.send_replace(true);
        while !self.running.is_empty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.maintenance_shutdown_tx.send_replace(true);

        let dispatcher = self
            .dispatcher_handle
            .lock()
            .expect("handle lock poisoned")
            .take();
        if let Some(handle) = dispatcher {
            let _ = handle.await;
        }
        let maintenance = self
            .maintenance_handle
            .lock()
            .expect("handle lock poisoned")
            .take();
        if let Some(handle) = maintenance {
            let _ = handle.await;
        }

        self.store.close().await?;
        info!(worker_id = %self.config.worker_id, "manager stopped");
        Ok(())
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Enqueue a one-shot task. Returns its id.
    #[instrument(skip(self, payload, options))]
    pub async fn submit_async(
        &self,
        name: &str,
        payload: serde_json::Value,
        options: SubmitOptions,
    ) -> Result<u64, ManagerError> {
        self.ensure_accepting()?;
        let defaults = self.check_payload(name, &payload)?;

        let now = now_secs();
        let row = NewTask {
            name: name.to_string(),
            kind: TaskKind::Async,
            payload,
            priority: options.priority.unwrap_or(defaults.priority),
            tag: options.tag,
            next_run_time: now + options.delay.unwrap_or(0),
            timeout: options.timeout.unwrap_or(defaults.timeout),
            max_retries: options.max_retries.unwrap_or(defaults.max_retries),
            retry_interval: options.retry_interval.unwrap_or(defaults.retry_interval),
            cron_expr: None,
        };

        let ids = self.store.insert(vec![row], None).await?;
        self.wake.notify_one();
        debug!(task_id = ids[0], name, "submitted async task");
        Ok(ids[0])
    }

    /// Enqueue a recurring task driven by `cron_expr`. Returns its id.
    #[instrument(skip(self, payload, options))]
    pub async fn submit_cron(
        &self,
        name: &str,
        cron_expr: &str,
        payload: serde_json::Value,
        options: SubmitOptions,
    ) -> Result<u64, ManagerError> {
        self.ensure_accepting()?;
        let defaults = self.check_payload(name, &payload)?;
        let schedule = CronSchedule::parse(cron_expr)?;
        let next_run_time = schedule.next_after(now_secs())?;

        let row = NewTask {
            name: name.to_string(),
            kind: TaskKind::Cron,
            payload,
            priority: options.priority.unwrap_or(defaults.priority),
            tag: options.tag,
            next_run_time,
            timeout: options.timeout.unwrap_or(defaults.timeout),
            max_retries: options.max_retries.unwrap_or(defaults.max_retries),
            retry_interval: options.retry_interval.unwrap_or(defaults.retry_interval),
            cron_expr: Some(cron_expr.to_string()),
        };

        let ids = self.store.insert(vec![row], None).await?;
        self.wake.notify_one();
        debug!(task_id = ids[0], name, cron_expr, "submitted cron task");
        Ok(ids[0])
    }

    // =========================================================================
    // Task control
    // =========================================================================

    /// Return a task to the queue with a fresh retry budget. A task that
    /// is already pending is left untouched.
    pub async fn resume(&self, id: u64) -> Result<(), ManagerError> {
        let task = self.store.get(id).await?;
        if task.status == TaskStatus::Pending {
            return Ok(());
        }

        self.store
            .update_status(
                id,
                TaskStatus::Pending,
                StatusUpdate {
                    retry_count: Some(0),
                    next_run_time: Some(now_secs()),
                    ..StatusUpdate::default()
                },
            )
            .await?;
        self.wake.notify_one();
        Ok(())
    }

    /// Pause one task. Queued, running, and failed tasks may be paused;
    /// a running one finishes its current attempt first.
    pub async fn pause(&self, id: u64) -> Result<(), ManagerError> {
        self.store
            .update_status(id, TaskStatus::Paused, StatusUpdate::default())
            .await?;
        Ok(())
    }

    /// Hold the dispatcher: in-flight tasks keep running, no new claims.
    pub fn pause_all(&self) {
        self.pause_tx.send_replace(true);
        debug!("dispatcher paused");
    }

    /// Release the dispatcher gate.
    pub fn resume_all(&self) {
        self.pause_tx.send_replace(false);
        self.wake.notify_one();
        debug!("dispatcher resumed");
    }

    // =========================================================================
    // Read side
    // =========================================================================

    pub async fn get_task(&self, id: u64) -> Result<Task, ManagerError> {
        Ok(self.store.get(id).await?)
    }

    /// A task together with its decoded result.
    pub async fn task_info(&self, id: u64) -> Result<TaskInfo, ManagerError> {
        let task = self.store.get(id).await?;
        let result = task.decoded_result()?;
        Ok(TaskInfo { task, result })
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Vec<Task>, ManagerError> {
        Ok(self.store.get_by_name(name).await?)
    }

    pub async fn get_by_status(&self, statuses: &[TaskStatus]) -> Result<Vec<Task>, ManagerError> {
        Ok(self.store.get_by_status(statuses).await?)
    }

    pub async fn get_by_tag(&self, tag: &str) -> Result<Vec<Task>, ManagerError> {
        Ok(self.store.get_by_tag(tag).await?)
    }

    pub async fn get_children(&self, parent_id: u64) -> Result<Vec<Task>, ManagerError> {
        Ok(self.store.get_children(parent_id).await?)
    }

    pub async fn get_running(&self) -> Result<Vec<Task>, ManagerError> {
        Ok(self.store.get_running().await?)
    }

    pub async fn get_stats(
        &self,
        tag: Option<&str>,
        status: Option<TaskStatus>,
    ) -> Result<Vec<TagStat>, ManagerError> {
        Ok(self.store.get_stats(tag, status).await?)
    }

    pub async fn get_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>, ManagerError> {
        Ok(self.store.get_tasks(filter).await?)
    }

    /// Bulk delete matching tasks; returns the affected count.
    pub async fn delete_tasks(&self, filter: TaskFilter) -> Result<u64, ManagerError> {
        Ok(self.store.delete_tasks(filter).await?)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn ensure_accepting(&self) -> Result<(), ManagerError> {
        match self.state() {
            ManagerState::Stopped => Err(ManagerError::NotRunning),
            _ => Ok(()),
        }
    }

    /// Validate the payload against the handler's schema (when both
    /// exist) and surface the handler's defaults.
    fn check_payload(
        &self,
        name: &str,
        payload: &serde_json::Value,
    ) -> Result<crate::handler::HandlerDefaults, ManagerError> {
        match self.registry.get(name) {
            Some(entry) => {
                if let Some(schema) = entry.payload_schema() {
                    schema.check(payload)?;
                }
                Ok(entry.defaults())
            }
            None => Ok(crate::handler::HandlerDefaults::default()),
        }
    }
}
