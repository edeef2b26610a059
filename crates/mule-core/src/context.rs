//! Per-run step context: the handle handlers use for durable effects.
//!
//! All replay bookkeeping lives here. Step names are made canonical per
//! run (`name`, `name#2`, ...) with an occurrence counter, so a handler
//! with a deterministic step order maps onto the same checkpoint names on
//! every attempt. Suspension points (`await_event`, `sleep`) get reserved
//! `$`-prefixed markers in the same namespace, which is what makes their
//! replays terminate.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use mule_store::{EventWait, SpawnedTask, TaskStore};

use crate::client::SpawnOptions;
use crate::error::{HandlerError, HandlerResult, Suspension};

struct ContextInner {
    store: Arc<dyn TaskStore>,
    queue: String,
    task_id: Uuid,
    run_id: Uuid,
    attempt: i32,
    worker_id: String,
    name_counts: Mutex<HashMap<String, u32>>,
}

/// Handle passed to task handlers. Cheap to clone.
#[derive(Clone)]
pub struct TaskContext {
    inner: Arc<ContextInner>,
}

impl TaskContext {
    pub(crate) fn new(
        store: Arc<dyn TaskStore>,
        queue: impl Into<String>,
        task_id: Uuid,
        run_id: Uuid,
        attempt: i32,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                store,
                queue: queue.into(),
                task_id,
                run_id,
                attempt,
                worker_id: worker_id.into(),
                name_counts: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The queue this run executes on.
    pub fn queue(&self) -> &str {
        &self.inner.queue
    }

    pub fn task_id(&self) -> Uuid {
        self.inner.task_id
    }

    pub fn run_id(&self) -> Uuid {
        self.inner.run_id
    }

    /// 1-based attempt number of this run.
    pub fn attempt(&self) -> i32 {
        self.inner.attempt
    }

    /// Canonical per-run name for the k-th occurrence of `name`:
    /// `name` for the first, `name#k` after that.
    fn canonical_name(&self, name: &str) -> String {
        let mut counts = self
            .inner
            .name_counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let count = counts.entry(name.to_owned()).or_insert(0);
        *count += 1;
        if *count == 1 {
            name.to_owned()
        } else {
            format!("{name}#{count}")
        }
    }

    async fn read_checkpoint(&self, name: &str) -> HandlerResult<Option<Value>> {
        self.inner
            .store
            .read_checkpoint(&self.inner.queue, self.inner.task_id, name)
            .await
            .map_err(HandlerError::Adapter)
    }

    /// Run a named step at most once per task.
    ///
    /// On a checkpoint hit the stored state is returned and `body` is not
    /// executed. On a miss `body` runs; its value is checkpointed on
    /// success and returned. A failing body writes nothing and its error
    /// is re-raised unchanged.
    pub async fn step<T, F, Fut>(&self, name: &str, body: F) -> HandlerResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = HandlerResult<T>>,
    {
        if name.starts_with('$') {
            return Err(HandlerError::msg(format!(
                "step name {name:?} is invalid: the '$' prefix is reserved"
            )));
        }
        let canonical = self.canonical_name(name);

        if let Some(cached) = self.read_checkpoint(&canonical).await? {
            debug!(
                task_id = %self.inner.task_id,
                step = %canonical,
                "step checkpoint hit, skipping body"
            );
            let value = serde_json::from_value(cached).map_err(|e| {
                HandlerError::Failed(anyhow::anyhow!(
                    "checkpoint {canonical:?} does not deserialize into the step's type: {e}"
                ))
            })?;
            return Ok(value);
        }

        let value = body().await?;

        let state = serde_json::to_value(&value).map_err(|e| {
            HandlerError::Failed(anyhow::anyhow!("failed to serialize step state: {e}"))
        })?;
        self.inner
            .store
            .write_checkpoint(
                &self.inner.queue,
                self.inner.task_id,
                &canonical,
                &state,
                self.inner.run_id,
            )
            .await
            .map_err(HandlerError::Adapter)?;

        Ok(value)
    }

    /// Wait for an event, suspending the run when none is available.
    ///
    /// Returns the payload synchronously when a matching emission is
    /// cached (or was already consumed by an earlier attempt); otherwise
    /// parks the run and raises the suspension signal.
    pub async fn await_event(&self, name: &str) -> HandlerResult<Value> {
        let marker = self.canonical_name(&format!("$event:{name}"));

        if let Some(payload) = self.read_checkpoint(&marker).await? {
            return Ok(payload);
        }

        let wait = self
            .inner
            .store
            .suspend_for_event(
                &self.inner.queue,
                self.inner.task_id,
                self.inner.run_id,
                &self.inner.worker_id,
                name,
                &marker,
            )
            .await
            .map_err(HandlerError::Adapter)?;

        match wait {
            EventWait::Cached(payload) => Ok(payload),
            EventWait::Suspended => Err(HandlerError::Suspended(Suspension::Event {
                name: name.to_owned(),
            })),
        }
    }

    /// Suspend the run until `delay` elapses on the datastore clock.
    ///
    /// Returns immediately on replay once the sleep has been recorded.
    pub async fn sleep(&self, delay: Duration) -> HandlerResult<()> {
        let marker = self.canonical_name("$sleep");

        if self.read_checkpoint(&marker).await?.is_some() {
            return Ok(());
        }

        self.inner
            .store
            .suspend_for_sleep(
                &self.inner.queue,
                self.inner.task_id,
                self.inner.run_id,
                &self.inner.worker_id,
                delay,
                &marker,
            )
            .await
            .map_err(HandlerError::Adapter)?;

        Err(HandlerError::Suspended(Suspension::Sleep { delay }))
    }

    /// Spawn a child task, defaulting to this run's queue.
    ///
    /// Not awaited; wrap the call in a `step` to record the child's IDs
    /// if the handler needs them across retries.
    pub async fn spawn_child(
        &self,
        name: &str,
        params: impl Serialize,
        opts: SpawnOptions,
    ) -> HandlerResult<SpawnedTask> {
        let params = serde_json::to_value(params).map_err(|e| {
            HandlerError::Failed(anyhow::anyhow!("failed to serialize child params: {e}"))
        })?;
        let queue = opts
            .queue
            .clone()
            .unwrap_or_else(|| self.inner.queue.clone());
        let new = opts.into_new_task(name.to_owned(), params, 1);

        self.inner
            .store
            .spawn_task(&queue, &new)
            .await
            .map_err(HandlerError::Adapter)
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("queue", &self.inner.queue)
            .field("task_id", &self.inner.task_id)
            .field("run_id", &self.inner.run_id)
            .field("attempt", &self.inner.attempt)
            .finish()
    }
}
