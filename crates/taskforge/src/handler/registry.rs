//! Handler registry
//!
//! Maps task names to handler functions plus their per-type defaults and
//! concurrency caps. The registry is mutable only while the owning
//! manager is initializing; `seal()` freezes it before dispatch begins.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use crate::handler::context::{HandlerResult, TaskContext, TaskHandler};
use crate::task::{
    DEFAULT_MAX_RETRIES, DEFAULT_PRIORITY, DEFAULT_RETRY_INTERVAL_SECS, DEFAULT_TIMEOUT_SECS,
};
use crate::validate::{PayloadSchema, ValidationError};

/// Errors from registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Registration attempted after the manager started
    #[error("handlers cannot be registered after the manager has started")]
    Sealed,

    /// The registered payload schema is not a valid schema document
    #[error(transparent)]
    Schema(#[from] ValidationError),
}

/// Per-type defaults applied to submissions that leave options unset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerDefaults {
    /// Total wall-clock budget per attempt, in seconds
    pub timeout: i64,
    pub max_retries: u32,
    pub retry_interval: i64,
    pub priority: i32,
}

impl Default for HandlerDefaults {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_interval: DEFAULT_RETRY_INTERVAL_SECS,
            priority: DEFAULT_PRIORITY,
        }
    }
}

/// A handler plus metadata, as passed to registration
///
/// # Example
///
/// ```ignore
/// let registration = HandlerRegistration::new(|ctx| async move {
///     Ok(HandlerOutcome::complete(serde_json::json!({"ok": true})))
/// })
/// .with_description("send one email")
/// .with_payload_schema(serde_json::json!({"type": "object"}))?
/// .with_timeout(120)
/// .with_max_concurrent(4);
/// ```
pub struct HandlerRegistration {
    handler: TaskHandler,
    description: Option<String>,
    payload_schema: Option<PayloadSchema>,
    defaults: HandlerDefaults,
    max_concurrent: Option<usize>,
}

impl HandlerRegistration {
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: TaskHandler = Arc::new(move |ctx| Box::pin(handler(ctx)));
        Self {
            handler,
            description: None,
            payload_schema: None,
            defaults: HandlerDefaults::default(),
            max_concurrent: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Attach a JSON-Schema for submission payloads. The schema document
    /// is validated here, at registration.
    pub fn with_payload_schema(
        mut self,
        schema: serde_json::Value,
    ) -> Result<Self, RegistryError> {
        self.payload_schema = Some(PayloadSchema::compile(schema)?);
        Ok(self)
    }

    pub fn with_timeout(mut self, seconds: i64) -> Self {
        self.defaults.timeout = seconds;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.defaults.max_retries = max_retries;
        self
    }

    pub fn with_retry_interval(mut self, seconds: i64) -> Self {
        self.defaults.retry_interval = seconds;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.defaults.priority = priority;
        self
    }

    /// Cap concurrent executions of this task type within the process.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = Some(max.max(1));
        self
    }
}

/// A registered handler with its live running count
pub struct HandlerEntry {
    handler: TaskHandler,
    description: Option<String>,
    payload_schema: Option<PayloadSchema>,
    defaults: HandlerDefaults,
    max_concurrent: Option<usize>,
    running: AtomicUsize,
}

impl HandlerEntry {
    pub fn handler(&self) -> TaskHandler {
        Arc::clone(&self.handler)
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn payload_schema(&self) -> Option<&PayloadSchema> {
        self.payload_schema.as_ref()
    }

    pub fn defaults(&self) -> HandlerDefaults {
        self.defaults
    }

    pub fn max_concurrent(&self) -> Option<usize> {
        self.max_concurrent
    }

    /// Executions of this type currently in flight in this process.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::Relaxed)
    }

    pub fn has_capacity(&self) -> bool {
        match self.max_concurrent {
            Some(cap) => self.running() < cap,
            None => true,
        }
    }

    pub(crate) fn acquire(&self) {
        self.running.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn release(&self) {
        self.running.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Registry of task handlers for one manager
pub struct HandlerRegistry {
    entries: RwLock<HashMap<String, Arc<HandlerEntry>>>,
    sealed: AtomicBool,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            sealed: AtomicBool::new(false),
        }
    }

    /// Register a handler under `name`. Re-registering a name replaces
    /// the previous entry.
    pub fn register(
        &self,
        name: impl Into<String>,
        registration: HandlerRegistration,
    ) -> Result<(), RegistryError> {
        if self.is_sealed() {
            return Err(RegistryError::Sealed);
        }

        let entry = HandlerEntry {
            handler: registration.handler,
            description: registration.description,
            payload_schema: registration.payload_schema,
            defaults: registration.defaults,
            max_concurrent: registration.max_concurrent,
            running: AtomicUsize::new(0),
        };
        self.entries
            .write()
            .expect("registry lock poisoned")
            .insert(name.into(), Arc::new(entry));
        Ok(())
    }

    /// Freeze the registry; called once when the manager starts.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::SeqCst);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    pub fn get(&self, name: &str) -> Option<Arc<HandlerEntry>> {
        self.entries
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries
            .read()
            .expect("registry lock poisoned")
            .contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All registered names.
    pub fn names(&self) -> Vec<String> {
        self.entries
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Names whose running count is below their concurrency cap; the set
    /// the dispatcher may claim for.
    pub fn eligible_names(&self) -> Vec<String> {
        self.entries
            .read()
            .expect("registry lock poisoned")
            .iter()
            .filter(|(_, entry)| entry.has_capacity())
            .map(|(name, _)| name.clone())
            .collect()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("names", &self.names())
            .field("sealed", &self.is_sealed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerOutcome;

    fn noop() -> HandlerRegistration {
        HandlerRegistration::new(|_ctx| async move {
            Ok(HandlerOutcome::complete(serde_json::Value::Null))
        })
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = HandlerRegistry::new();
        registry
            .register("send_email", noop().with_description("send one email"))
            .unwrap();

        assert!(registry.contains("send_email"));
        assert!(!registry.contains("other"));
        assert_eq!(registry.len(), 1);

        let entry = registry.get("send_email").unwrap();
        assert_eq!(entry.description(), Some("send one email"));
        assert_eq!(entry.defaults(), HandlerDefaults::default());
    }

    #[test]
    fn test_sealed_rejects_registration() {
        let registry = HandlerRegistry::new();
        registry.seal();
        assert!(matches!(
            registry.register("late", noop()),
            Err(RegistryError::Sealed)
        ));
    }

    #[test]
    fn test_defaults_override() {
        let registry = HandlerRegistry::new();
        registry
            .register(
                "slow",
                noop()
                    .with_timeout(300)
                    .with_max_retries(1)
                    .with_retry_interval(30)
                    .with_priority(-5),
            )
            .unwrap();

        let defaults = registry.get("slow").unwrap().defaults();
        assert_eq!(defaults.timeout, 300);
        assert_eq!(defaults.max_retries, 1);
        assert_eq!(defaults.retry_interval, 30);
        assert_eq!(defaults.priority, -5);
    }

    #[test]
    fn test_schema_validated_at_registration() {
        let bad = noop().with_payload_schema(serde_json::json!({"type": "no-such-type"}));
        assert!(matches!(bad, Err(RegistryError::Schema(_))));

        let good = noop()
            .with_payload_schema(serde_json::json!({"type": "object"}))
            .unwrap();
        let registry = HandlerRegistry::new();
        registry.register("checked", good).unwrap();
        assert!(registry.get("checked").unwrap().payload_schema().is_some());
    }

    #[test]
    fn test_eligible_names_respects_cap() {
        let registry = HandlerRegistry::new();
        registry
            .register("capped", noop().with_max_concurrent(1))
            .unwrap();
        registry.register("open", noop()).unwrap();

        let mut eligible = registry.eligible_names();
        eligible.sort();
        assert_eq!(eligible, vec!["capped", "open"]);

        let entry = registry.get("capped").unwrap();
        entry.acquire();
        assert!(!entry.has_capacity());
        assert_eq!(registry.eligible_names(), vec!["open"]);

        entry.release();
        assert_eq!(registry.eligible_names().len(), 2);
    }
}
