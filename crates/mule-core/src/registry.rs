//! Task registry -- the in-process table mapping task names to handlers
//! and their default options.
//!
//! Handlers are registered with typed params/results and stored erased
//! over `serde_json::Value`, so the engine can invoke any of them from a
//! claimed run's raw payload.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::context::TaskContext;
use crate::error::{HandlerError, HandlerResult};

/// Erased handler: raw params in, raw result out.
pub(crate) type BoxedHandler =
    Arc<dyn Fn(Value, TaskContext) -> BoxFuture<'static, HandlerResult<Value>> + Send + Sync>;

/// Registration options for a task.
#[derive(Debug, Clone)]
pub struct TaskConfig {
    /// Name producers spawn the task by.
    pub name: String,
    /// Queue the task is bound to, if any.
    pub queue: Option<String>,
    /// Default attempt budget applied when `spawn` does not override it.
    pub default_max_attempts: Option<i32>,
}

impl TaskConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue: None,
            default_max_attempts: None,
        }
    }

    /// Bind the task to a queue; spawns to other queues are rejected.
    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Set the default attempt budget.
    pub fn default_max_attempts(mut self, attempts: i32) -> Self {
        self.default_max_attempts = Some(attempts);
        self
    }
}

/// A registered task: its handler and defaults.
#[derive(Clone)]
pub struct RegisteredTask {
    pub(crate) handler: BoxedHandler,
    pub queue: Option<String>,
    pub default_max_attempts: Option<i32>,
}

/// A collection of registered tasks, keyed by name.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, RegisteredTask>,
}

impl TaskRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task handler.
    ///
    /// If a task with the same name is already registered, it is replaced
    /// and the old entry is returned. Handlers already running keep their
    /// reference to the replaced entry.
    pub fn register<P, R, F, Fut>(&mut self, config: TaskConfig, handler: F) -> Option<RegisteredTask>
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(P, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<R>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: BoxedHandler = Arc::new(move |params: Value, ctx: TaskContext| {
            let handler = Arc::clone(&handler);
            let fut: BoxFuture<'static, HandlerResult<Value>> = Box::pin(async move {
                let params: P = serde_json::from_value(params).map_err(|e| {
                    HandlerError::Failed(anyhow::anyhow!("failed to deserialize task params: {e}"))
                })?;
                let result = handler(params, ctx).await?;
                let value = serde_json::to_value(result).map_err(|e| {
                    HandlerError::Failed(anyhow::anyhow!("failed to serialize task result: {e}"))
                })?;
                Ok(value)
            });
            fut
        });

        self.tasks.insert(
            config.name,
            RegisteredTask {
                handler: erased,
                queue: config.queue,
                default_max_attempts: config.default_max_attempts,
            },
        )
    }

    /// Look up a task by name.
    pub fn get(&self, name: &str) -> Option<&RegisteredTask> {
        self.tasks.get(name)
    }

    /// List the names of all registered tasks.
    ///
    /// The order is not guaranteed (HashMap iteration order).
    pub fn list(&self) -> Vec<&str> {
        self.tasks.keys().map(|s| s.as_str()).collect()
    }

    /// Return the number of registered tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Return `true` if no tasks are registered.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.tasks.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_config(name: &str) -> TaskConfig {
        TaskConfig::new(name)
    }

    fn register_noop(registry: &mut TaskRegistry, name: &str) -> Option<RegisteredTask> {
        registry.register(noop_config(name), |_params: (), _ctx| async move { Ok(()) })
    }

    #[test]
    fn registry_starts_empty() {
        let registry = TaskRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
        assert!(registry.list().is_empty());
    }

    #[test]
    fn register_and_get() {
        let mut registry = TaskRegistry::new();
        let old = register_noop(&mut registry, "alpha");
        assert!(old.is_none());

        let registered = registry.get("alpha");
        assert!(registered.is_some());
    }

    #[test]
    fn register_replaces_existing() {
        let mut registry = TaskRegistry::new();
        register_noop(&mut registry, "alpha");
        let old = registry.register(
            noop_config("alpha").default_max_attempts(3),
            |_params: (), _ctx| async move { Ok(()) },
        );
        assert!(old.is_some());
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.get("alpha").and_then(|r| r.default_max_attempts),
            Some(3)
        );
    }

    #[test]
    fn get_missing_returns_none() {
        let registry = TaskRegistry::new();
        assert!(registry.get("nonexistent").is_none());
    }

    #[test]
    fn list_returns_all_names() {
        let mut registry = TaskRegistry::new();
        register_noop(&mut registry, "alpha");
        register_noop(&mut registry, "beta");
        register_noop(&mut registry, "gamma");

        let mut names = registry.list();
        names.sort();
        assert_eq!(names, vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn config_builder_sets_fields() {
        let config = TaskConfig::new("billing")
            .on_queue("payments")
            .default_max_attempts(5);
        assert_eq!(config.name, "billing");
        assert_eq!(config.queue.as_deref(), Some("payments"));
        assert_eq!(config.default_max_attempts, Some(5));
    }

    #[test]
    fn registry_debug_shows_names() {
        let mut registry = TaskRegistry::new();
        register_noop(&mut registry, "debug-me");
        let debug = format!("{registry:?}");
        assert!(debug.contains("debug-me"));
    }
}
