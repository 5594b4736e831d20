//! PostgreSQL implementation of TaskStore
//!
//! Production persistence for multi-process deployments. Composite
//! operations run inside transactions, and every racy status change
//! carries a status predicate in its UPDATE's WHERE clause, so a losing
//! writer simply affects zero rows; no `SELECT ... FOR UPDATE` is held
//! across the claim path.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, error, instrument};

use super::store::{
    validate_new_task, ParentLink, StatusUpdate, StoreError, SweepReport, TagStat, TaskFilter,
    TaskStore,
};
use crate::task::{
    failure_line, now_secs, success_line, NewTask, Task, TaskKind, TaskStatus,
};

const TOTAL_TIMEOUT_ERROR: &str = "Task exceeded total timeout limit";
const HEARTBEAT_LOST_ERROR: &str = "Task heartbeat lost - worker may be dead";

/// Connection settings for [`PostgresTaskStore`]
#[derive(Debug, Clone)]
pub struct PostgresStoreConfig {
    pub url: String,

    /// Upper bound on pooled connections
    pub max_connections: u32,

    /// How long an acquire may wait before surfacing a transient error
    pub acquire_timeout: Duration,
}

impl PostgresStoreConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 10,
            acquire_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max.max(1);
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }
}

/// PostgreSQL implementation of TaskStore
///
/// # Example
///
/// ```ignore
/// use taskforge::{PostgresStoreConfig, PostgresTaskStore};
///
/// let store = PostgresTaskStore::connect(
///     PostgresStoreConfig::new("postgres://localhost/taskforge"),
/// )
/// .await?;
/// ```
#[derive(Clone)]
pub struct PostgresTaskStore {
    pool: PgPool,
}

impl PostgresTaskStore {
    /// Wrap an existing connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a bounded pool and run pending migrations
    pub async fn connect(config: PostgresStoreConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await
            .map_err(db_err)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Append a child outcome line to a suspended parent and wake it if
    /// that was the last outstanding child. Runs on the caller's
    /// transaction. Returns true when a line was recorded.
    async fn record_child_outcome(
        tx: &mut sqlx::PgConnection,
        parent_id: u64,
        line: &str,
        now: i64,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE tasks
            SET result = COALESCE(result, '') || $2,
                completed_children = completed_children + 1
            WHERE id = $1 AND status = 'suspended'
            RETURNING total_children, completed_children
            "#,
        )
        .bind(parent_id as i64)
        .bind(line)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            return Ok(false);
        };

        let total: i32 = row.get("total_children");
        let completed: i32 = row.get("completed_children");
        if completed >= total {
            sqlx::query(
                r#"
                UPDATE tasks
                SET status = 'pending', stage = stage + 1, last_active_time = $2
                WHERE id = $1 AND status = 'suspended'
                "#,
            )
            .bind(parent_id as i64)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            debug!(parent_id, "workflow parent woke");
        }

        Ok(true)
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    #[instrument(skip(self, tasks, link))]
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

        let now = now_secs();
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        if let Some(link) = &link {
            let updated = sqlx::query(
                r#"
                UPDATE tasks
                SET status = 'suspended',
                    total_children = total_children + $2,
                    context = COALESCE($3, context),
                    result = NULL
                WHERE id = $1 AND status = 'running' AND kind = 'async'
                "#,
            )
            .bind(link.parent_id as i64)
            .bind(tasks.len() as i32)
            .bind(&link.context)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

            if updated.rows_affected() == 0 {
                let parent = sqlx::query("SELECT kind FROM tasks WHERE id = $1")
                    .bind(link.parent_id as i64)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(db_err)?;
                return Err(match parent {
                    None => StoreError::NotFound(link.parent_id),
                    Some(row) if row.get::<String, _>("kind") != "async" => {
                        StoreError::InvalidTask(
                            "parent of a workflow must be an async task".into(),
                        )
                    }
                    Some(_) => StoreError::ParentNotRunning(link.parent_id),
                });
            }
        }

        let mut ids = Vec::with_capacity(tasks.len());
        for row in tasks {
            let inserted = sqlx::query(
                r#"
                INSERT INTO tasks (
                    name, kind, status, priority, payload, tag,
                    created_at, next_run_time, timeout, max_retries,
                    retry_interval, cron_expr, root_id, parent_id
                )
                VALUES ($1, $2, 'pending', $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                RETURNING id
                "#,
            )
            .bind(&row.name)
            .bind(row.kind.as_str())
            .bind(row.priority)
            .bind(&row.payload)
            .bind(&row.tag)
            .bind(now)
            .bind(row.next_run_time)
            .bind(row.timeout)
            .bind(row.max_retries as i32)
            .bind(row.retry_interval)
            .bind(&row.cron_expr)
            .bind(link.as_ref().map(|l| l.root_id as i64))
            .bind(link.as_ref().map(|l| l.parent_id as i64))
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;

            let id: i64 = inserted.get("id");
            if link.is_none() {
                // Root tasks reference themselves
                sqlx::query("UPDATE tasks SET root_id = id WHERE id = $1")
                    .bind(id)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;
            }
            ids.push(id as u64);
        }

        tx.commit().await.map_err(db_err)?;
        debug!(count = ids.len(), parented = link.is_some(), "inserted tasks");
        Ok(ids)
    }

    #[instrument(skip(self, names))]
    async fn claim(&self, names: &[String], worker_id: &str) -> Result<Option<Task>, StoreError> {
        if worker_id.is_empty() {
            return Err(StoreError::InvalidWorkerId);
        }
        if names.is_empty() {
            return Ok(None);
        }

        // Candidate select + conditional update form the compare-and-set;
        // a lost race re-selects until a claim lands or nothing is left.
        loop {
            let now = now_secs();
            let candidate = sqlx::query(
                r#"
                SELECT id FROM tasks
                WHERE status = 'pending' AND name = ANY($1) AND next_run_time <= $2
                ORDER BY priority DESC, next_run_time ASC, id ASC
                LIMIT 1
                "#,
            )
            .bind(names)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

            let Some(candidate) = candidate else {
                return Ok(None);
            };
            let id: i64 = candidate.get("id");

            let claimed = sqlx::query(
                r#"
                UPDATE tasks
                SET status = 'running',
                    start_time = $2,
                    last_active_time = $2,
                    worker_id = $3
                WHERE id = $1 AND status = 'pending'
                RETURNING *
                "#,
            )
            .bind(id)
            .bind(now)
            .bind(worker_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

            if let Some(row) = claimed {
                let task = task_from_row(&row)?;
                debug!(task_id = task.id, worker_id, "claimed task");
                return Ok(Some(task));
            }
            // Another worker won this row; try the next candidate.
        }
    }

    #[instrument(skip(self, update))]
    async fn update_status(
        &self,
        id: u64,
        status: TaskStatus,
        update: StatusUpdate,
    ) -> Result<(), StoreError> {
        let now = now_secs();
        let predecessors: Vec<&str> = status
            .allowed_predecessors()
            .iter()
            .map(TaskStatus::as_str)
            .collect();

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let updated = sqlx::query(
            r#"
            UPDATE tasks
            SET status = $2,
                last_active_time = $3,
                result = COALESCE($4, result),
                error = COALESCE($5, error),
                next_run_time = COALESCE($6, next_run_time),
                retry_count = COALESCE($7, retry_count)
            WHERE id = $1 AND status = ANY($8)
            "#,
        )
        .bind(id as i64)
        .bind(status.as_str())
        .bind(now)
        .bind(&update.result)
        .bind(&update.error)
        .bind(update.next_run_time)
        .bind(update.retry_count.map(|c| c as i32))
        .bind(&predecessors)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if updated.rows_affected() == 0 {
            let row = sqlx::query("SELECT status FROM tasks WHERE id = $1")
                .bind(id as i64)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?;
            let Some(row) = row else {
                return Err(StoreError::NotFound(id));
            };
            let raw: String = row.get("status");
            let from = TaskStatus::parse(&raw).ok_or_else(|| StoreError::InvalidStatus(raw))?;
            return Err(StoreError::InvalidTransition { from, to: status });
        }

        if status == TaskStatus::Completed {
            if let Some(parent_id) = update.parent_id {
                let result_json = update.result.as_deref().unwrap_or("null");
                let line = success_line(id, result_json);
                Self::record_child_outcome(&mut tx, parent_id, &line, now).await?;
            }
        }

        tx.commit().await.map_err(db_err)?;
        debug!(task_id = id, status = %status, "updated task status");
        Ok(())
    }

    #[instrument(skip(self, ids))]
    async fn update_active_time(&self, ids: &[u64]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let ids: Vec<i64> = ids.iter().map(|id| *id as i64).collect();
        sqlx::query("UPDATE tasks SET last_active_time = $1 WHERE id = ANY($2)")
            .bind(now_secs())
            .bind(&ids)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn handle_timeouts(
        &self,
        active_interval_ms: u64,
        expire_seconds: Option<i64>,
    ) -> Result<SweepReport, StoreError> {
        let now = now_secs();
        let mut report = SweepReport::default();

        // Total-timeout detection
        let timed_out = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'timeout', error = $2, last_active_time = $1
            WHERE status = 'running'
              AND start_time IS NOT NULL
              AND start_time + timeout < $1
            "#,
        )
        .bind(now)
        .bind(TOTAL_TIMEOUT_ERROR)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        report.timed_out = timed_out.rows_affected();

        // Heartbeat-lost detection over the rows still running; compared
        // in milliseconds so sub-second sweep intervals survive the
        // whole-second storage resolution
        let lost = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'timeout', error = $3, last_active_time = $1
            WHERE status = 'running'
              AND last_active_time IS NOT NULL
              AND last_active_time * 1000 < $1 * 1000 - $2
            "#,
        )
        .bind(now)
        .bind(5 * active_interval_ms as i64)
        .bind(HEARTBEAT_LOST_ERROR)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        report.heartbeat_lost = lost.rows_affected();

        // Retry scheduling
        let retried = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'pending',
                stage = 0,
                result = NULL,
                context = NULL,
                retry_count = retry_count + 1,
                last_active_time = $1,
                next_run_time = $1 + retry_interval
            WHERE status IN ('timeout', 'failed')
              AND retry_count < max_retries
              AND last_active_time + retry_interval < $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        report.retried = retried.rows_affected();

        // Retry exhaustion: cron pauses in bulk
        let paused = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'paused', last_active_time = $1
            WHERE status IN ('timeout', 'failed')
              AND kind = 'cron'
              AND retry_count >= max_retries
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        report.exhausted += paused.rows_affected();

        // Async exhaustion flips one row at a time so the permanent
        // failure and its parent propagation share a transaction
        let exhausted = sqlx::query(
            r#"
            SELECT id, parent_id, error FROM tasks
            WHERE status IN ('timeout', 'failed')
              AND kind = 'async'
              AND retry_count >= max_retries
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        for row in exhausted {
            let id: i64 = row.get("id");
            let parent_id: Option<i64> = row.get("parent_id");
            let error: Option<String> = row.get("error");

            let mut tx = self.pool.begin().await.map_err(db_err)?;
            let flipped = sqlx::query(
                r#"
                UPDATE tasks
                SET status = 'permanently_failed', last_active_time = $2
                WHERE id = $1 AND status IN ('timeout', 'failed')
                "#,
            )
            .bind(id)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

            if flipped.rows_affected() == 0 {
                continue;
            }
            report.exhausted += 1;

            if let Some(parent_id) = parent_id {
                let error = error.unwrap_or_else(|| "task failed".into());
                let line = failure_line(id as u64, &error);
                if Self::record_child_outcome(&mut tx, parent_id as u64, &line, now).await? {
                    report.cascaded += 1;
                }
            }
            tx.commit().await.map_err(db_err)?;
        }

        // Expiry GC
        if let Some(expire) = expire_seconds {
            let expired = sqlx::query(
                r#"
                DELETE FROM tasks
                WHERE status IN ('completed', 'permanently_failed')
                  AND last_active_time IS NOT NULL
                  AND last_active_time < $1
                "#,
            )
            .bind(now - expire)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
            report.expired = expired.rows_affected();
        }

        if !report.is_empty() {
            debug!(?report, "maintenance sweep touched rows");
        }
        Ok(report)
    }

    #[instrument(skip(self))]
    async fn get(&self, id: u64) -> Result<Task, StoreError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = $1")
            .bind(id as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or(StoreError::NotFound(id))?;
        task_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn get_by_name(&self, name: &str) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE name = $1 ORDER BY id")
            .bind(name)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(task_from_row).collect()
    }

    #[instrument(skip(self, statuses))]
    async fn get_by_status(&self, statuses: &[TaskStatus]) -> Result<Vec<Task>, StoreError> {
        let statuses: Vec<&str> = statuses.iter().map(TaskStatus::as_str).collect();
        let rows = sqlx::query("SELECT * FROM tasks WHERE status = ANY($1) ORDER BY id")
            .bind(&statuses)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(task_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn get_by_tag(&self, tag: &str) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE tag = $1 ORDER BY id")
            .bind(tag)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(task_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn get_children(&self, parent_id: u64) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE parent_id = $1 ORDER BY id")
            .bind(parent_id as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(task_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn get_stats(
        &self,
        tag: Option<&str>,
        status: Option<TaskStatus>,
    ) -> Result<Vec<TagStat>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT tag, name, status, COUNT(*) AS count
            FROM tasks
            WHERE ($1::text IS NULL OR tag = $1)
              AND ($2::text IS NULL OR status = $2)
            GROUP BY tag, name, status
            ORDER BY tag ASC NULLS FIRST, name ASC, status ASC
            "#,
        )
        .bind(tag)
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                let raw: String = row.get("status");
                let status =
                    TaskStatus::parse(&raw).ok_or_else(|| StoreError::InvalidStatus(raw))?;
                Ok(TagStat {
                    tag: row.get("tag"),
                    name: row.get("name"),
                    status,
                    count: row.get::<i64, _>("count") as u64,
                })
            })
            .collect()
    }

    #[instrument(skip(self, filter))]
    async fn get_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM tasks
            WHERE ($1::text IS NULL OR name = $1)
              AND ($2::text IS NULL OR tag = $2)
              AND ($3::text IS NULL OR status = $3)
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .bind(&filter.name)
        .bind(&filter.tag)
        .bind(filter.status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(task_from_row).collect()
    }

    #[instrument(skip(self, filter))]
    async fn delete_tasks(&self, filter: TaskFilter) -> Result<u64, StoreError> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM tasks
            WHERE ($1::text IS NULL OR name = $1)
              AND ($2::text IS NULL OR tag = $2)
              AND ($3::text IS NULL OR status = $3)
            "#,
        )
        .bind(&filter.name)
        .bind(&filter.tag)
        .bind(filter.status.map(|s| s.as_str()))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(deleted.rows_affected())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.pool.close().await;
        Ok(())
    }
}

// Helper functions

fn db_err(e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            error!("transient database error: {}", e);
            StoreError::Unavailable(e.to_string())
        }
        other => {
            error!("database error: {}", other);
            StoreError::Database(other.to_string())
        }
    }
}

fn task_from_row(row: &PgRow) -> Result<Task, StoreError> {
    let kind_raw: String = row.get("kind");
    let kind =
        TaskKind::parse(&kind_raw).ok_or_else(|| StoreError::InvalidStatus(kind_raw.clone()))?;
    let status_raw: String = row.get("status");
    let status =
        TaskStatus::parse(&status_raw).ok_or_else(|| StoreError::InvalidStatus(status_raw))?;

    Ok(Task {
        id: row.get::<i64, _>("id") as u64,
        name: row.get("name"),
        kind,
        status,
        priority: row.get("priority"),
        payload: row.get("payload"),
        tag: row.get("tag"),
        created_at: row.get("created_at"),
        next_run_time: row.get("next_run_time"),
        last_active_time: row.get("last_active_time"),
        start_time: row.get("start_time"),
        timeout: row.get("timeout"),
        retry_count: row.get::<i32, _>("retry_count") as u32,
        max_retries: row.get::<i32, _>("max_retries") as u32,
        retry_interval: row.get("retry_interval"),
        cron_expr: row.get("cron_expr"),
        root_id: row.get::<Option<i64>, _>("root_id").map(|v| v as u64),
        parent_id: row.get::<Option<i64>, _>("parent_id").map(|v| v as u64),
        total_children: row.get::<i32, _>("total_children") as u32,
        completed_children: row.get::<i32, _>("completed_children") as u32,
        stage: row.get::<i32, _>("stage") as u32,
        worker_id: row.get("worker_id"),
        result: row.get("result"),
        error: row.get("error"),
        context: row.get("context"),
    })
}

#[cfg(test)]
mod tests {
    // Contract tests against a live database live in
    // tests/postgres_integration_test.rs and require DATABASE_URL.
}
