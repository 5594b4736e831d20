//! # Taskforge
//!
//! A durable, distributed task scheduler and workflow engine backed by
//! shared storage.
//!
//! ## Features
//!
//! - **Cooperative claiming**: any number of worker processes share one
//!   store; claims are atomic and ordered by priority
//! - **One-shot and cron tasks**: `submit_async` with an earliest-run
//!   time, or `submit_cron` with a 5/6-field cron expression
//! - **Nested workflows**: handlers fan out into child tasks, suspending
//!   the parent until every child finishes; outcomes propagate back up
//! - **At-least-once with recovery**: total-timeout and heartbeat-lost
//!   detection, bounded retries, permanent-failure cascades, expiry GC
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        TaskManager                           │
//! │  (lifecycle, registration, submit/pause/resume, read APIs)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         TaskStore                            │
//! │  (PostgreSQL or in-memory: claim, transitions, sweeps)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Dispatcher + Executor fibers                 │
//! │  (claims under concurrency caps, runs handlers, records     │
//! │   outcomes; maintenance loop sweeps timeouts and retries)   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use taskforge::prelude::*;
//!
//! let store = Arc::new(InMemoryTaskStore::new());
//! let manager = TaskManager::new(store, TaskManagerConfig::default());
//!
//! manager.register("resize_image", HandlerRegistration::new(|ctx| async move {
//!     if ctx.stage() == 0 {
//!         // Fan out one child per chunk; re-entered when they finish
//!         let children = vec![
//!             ChildSpec::new("resize_chunk").with_payload(serde_json::json!({"part": 1})),
//!             ChildSpec::new("resize_chunk").with_payload(serde_json::json!({"part": 2})),
//!         ];
//!         return Ok(HandlerOutcome::spawn(children));
//!     }
//!     let done = ctx.child_outcomes().len();
//!     Ok(HandlerOutcome::complete(serde_json::json!({"parts": done})))
//! }))?;
//!
//! manager.start().await?;
//! ```

pub mod handler;
pub mod manager;
pub mod runtime;
pub mod schedule;
pub mod store;
pub mod task;
pub mod validate;

/// Prelude for common imports
pub mod prelude {
    pub use crate::handler::{
        HandlerOutcome, HandlerRegistration, HandlerRegistry, TaskContext,
    };
    pub use crate::manager::{
        ManagerError, ManagerState, TaskInfo, TaskManager, TaskManagerConfig,
    };
    pub use crate::schedule::CronSchedule;
    pub use crate::store::{
        InMemoryTaskStore, PostgresStoreConfig, PostgresTaskStore, StoreError, TaskFilter,
        TaskStore,
    };
    pub use crate::task::{
        ChildOutcome, ChildSpec, SubmitOptions, Task, TaskKind, TaskStatus,
    };
}

// Re-export key types at crate root
pub use handler::{
    HandlerDefaults, HandlerEntry, HandlerOutcome, HandlerRegistration, HandlerRegistry,
    RegistryError, TaskContext, TaskHandler,
};
pub use manager::{ManagerError, ManagerState, TaskInfo, TaskManager, TaskManagerConfig};
pub use schedule::{CronSchedule, ScheduleError};
pub use store::{
    InMemoryTaskStore, ParentLink, PostgresStoreConfig, PostgresTaskStore, StatusUpdate,
    StoreError, SweepReport, TagStat, TaskFilter, TaskStore,
};
pub use task::{
    ChildOutcome, ChildSpec, DecodedResult, NewTask, SubmitOptions, Task, TaskKind, TaskStatus,
};
pub use validate::{PayloadSchema, ValidationError};
