//! Handler contract and registry
//!
//! A handler is an async function from a [`TaskContext`] to a
//! [`HandlerOutcome`]: either a JSON value (leaf completion) or a spawn
//! of child tasks that suspends the parent until they all finish.
//! Handlers for a manager are collected in a [`HandlerRegistry`] that is
//! sealed when the manager starts.

mod context;
mod registry;

pub use context::{HandlerFuture, HandlerOutcome, HandlerResult, TaskContext, TaskHandler};
pub use registry::{
    HandlerDefaults, HandlerEntry, HandlerRegistration, HandlerRegistry, RegistryError,
};
