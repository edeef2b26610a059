//! The public façade: queue administration, task registration, spawning,
//! events, one-shot execution, and workers, wired over one [`TaskStore`].

use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

use mule_store::{
    ClaimedTask, DbConfig, NewTask, PgTaskStore, RetryStrategy, Run, SpawnedTask, StartTime, Task,
    TaskStore, pool,
};

use crate::engine::{RunOutcome, execute_claimed};
use crate::error::{Error, HandlerResult, Result};
use crate::registry::{TaskConfig, TaskRegistry};
use crate::worker::{Worker, WorkerConfig, start};

/// Options accepted by [`Mule::spawn`] and
/// [`TaskContext::spawn_child`](crate::TaskContext::spawn_child).
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// Target queue. Required for unregistered tasks; must match the
    /// task's bound queue when it has one.
    pub queue: Option<String>,
    /// Attempt budget override.
    pub max_attempts: Option<i32>,
    /// Absolute time the first run becomes claimable. Takes precedence
    /// over `run_after`.
    pub run_at: Option<DateTime<Utc>>,
    /// Delay before the first run becomes claimable.
    pub run_after: Option<Duration>,
    /// Backoff policy override.
    pub retry_strategy: Option<RetryStrategy>,
    /// Opaque cancellation policy stored on the task.
    pub cancellation: Option<Value>,
    /// Opaque metadata returned with every claim.
    pub headers: Option<Value>,
}

impl SpawnOptions {
    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn max_attempts(mut self, attempts: i32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn run_at(mut self, at: DateTime<Utc>) -> Self {
        self.run_at = Some(at);
        self
    }

    pub fn run_after(mut self, delay: Duration) -> Self {
        self.run_after = Some(delay);
        self
    }

    pub fn retry_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.retry_strategy = Some(strategy);
        self
    }

    pub fn headers(mut self, headers: Value) -> Self {
        self.headers = Some(headers);
        self
    }

    pub(crate) fn into_new_task(
        self,
        name: String,
        params: Value,
        fallback_max_attempts: i32,
    ) -> NewTask {
        let start = if let Some(at) = self.run_at {
            StartTime::At(at)
        } else if let Some(delay) = self.run_after {
            StartTime::After(delay)
        } else {
            StartTime::Immediate
        };
        NewTask {
            name,
            params,
            headers: self.headers,
            retry_strategy: self.retry_strategy,
            max_attempts: self.max_attempts.unwrap_or(fallback_max_attempts),
            cancellation: self.cancellation,
            start,
        }
    }
}

/// Options for a one-shot claim.
#[derive(Debug, Clone)]
pub struct ClaimOptions {
    pub batch_size: u32,
    pub claim_timeout: Duration,
    pub worker_id: String,
}

impl ClaimOptions {
    pub fn new(batch_size: u32, claim_timeout: Duration, worker_id: impl Into<String>) -> Self {
        Self {
            batch_size,
            claim_timeout,
            worker_id: worker_id.into(),
        }
    }
}

/// Client for one queue of durable tasks.
///
/// Holds the datastore handle, the process-wide task registry, and the
/// default queue name. Cheap to clone; clones share the registry.
#[derive(Clone)]
pub struct Mule {
    store: Arc<dyn TaskStore>,
    registry: Arc<RwLock<TaskRegistry>>,
    default_queue: String,
}

impl Mule {
    /// Build a client over any store implementation.
    pub fn new(store: Arc<dyn TaskStore>, default_queue: impl Into<String>) -> Self {
        Self {
            store,
            registry: Arc::new(RwLock::new(TaskRegistry::new())),
            default_queue: default_queue.into(),
        }
    }

    /// Connect to PostgreSQL and build a client.
    pub async fn connect(config: &DbConfig, default_queue: impl Into<String>) -> Result<Self> {
        let pg_pool = pool::create_pool(config).await?;
        Ok(Self::new(
            Arc::new(PgTaskStore::new(pg_pool)),
            default_queue,
        ))
    }

    pub fn default_queue(&self) -> &str {
        &self.default_queue
    }

    /// The underlying store handle.
    pub fn store(&self) -> Arc<dyn TaskStore> {
        Arc::clone(&self.store)
    }

    // -----------------------------------------------------------------
    // Queue administration
    // -----------------------------------------------------------------

    /// Create a queue's table group. Idempotent.
    pub async fn create_queue(&self, name: &str) -> Result<()> {
        Ok(self.store.create_queue(name).await?)
    }

    /// Drop a queue's table group. Tolerates a missing queue.
    pub async fn drop_queue(&self, name: &str) -> Result<()> {
        Ok(self.store.drop_queue(name).await?)
    }

    /// Names of all queues in the datastore.
    pub async fn list_queues(&self) -> Result<Vec<String>> {
        Ok(self.store.list_queues().await?)
    }

    // -----------------------------------------------------------------
    // Registration and spawning
    // -----------------------------------------------------------------

    /// Register a task handler. Overwrites any existing registration for
    /// the same name; handlers already running keep their reference.
    pub fn register_task<P, R, F, Fut>(&self, config: TaskConfig, handler: F)
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(P, crate::context::TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<R>> + Send + 'static,
    {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        registry.register(config, handler);
    }

    /// Spawn a task.
    ///
    /// The effective queue is `opts.queue`, else the task's bound queue,
    /// else this client's default. Spawning an unregistered task requires
    /// an explicit queue; a queue that contradicts the task's binding is
    /// rejected.
    pub async fn spawn(
        &self,
        name: &str,
        params: impl Serialize,
        opts: SpawnOptions,
    ) -> Result<SpawnedTask> {
        let registered = {
            let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
            registry
                .get(name)
                .map(|r| (r.queue.clone(), r.default_max_attempts))
        };

        let queue = match (&registered, opts.queue.as_deref()) {
            (None, None) => {
                return Err(Error::UnregisteredTask {
                    name: name.to_owned(),
                });
            }
            (Some((Some(bound), _)), Some(requested)) if bound != requested => {
                return Err(Error::QueueMismatch {
                    name: name.to_owned(),
                    bound: bound.clone(),
                    requested: requested.to_owned(),
                });
            }
            _ => opts
                .queue
                .clone()
                .or_else(|| registered.as_ref().and_then(|(queue, _)| queue.clone()))
                .unwrap_or_else(|| self.default_queue.clone()),
        };

        if let Some(max_attempts) = opts.max_attempts {
            if max_attempts < 1 {
                return Err(Error::InvalidOptions(format!(
                    "max_attempts must be at least 1, got {max_attempts}"
                )));
            }
        }

        let fallback_max_attempts = registered
            .as_ref()
            .and_then(|(_, max_attempts)| *max_attempts)
            .unwrap_or(1);

        let params = serde_json::to_value(params)
            .map_err(|e| Error::InvalidOptions(format!("params are not serializable: {e}")))?;
        let new = opts.into_new_task(name.to_owned(), params, fallback_max_attempts);

        Ok(self.store.spawn_task(&queue, &new).await?)
    }

    /// Emit an event into this client's queue.
    pub async fn emit_event(&self, name: &str, payload: impl Serialize) -> Result<()> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| Error::InvalidOptions(format!("payload is not serializable: {e}")))?;
        Ok(self
            .store
            .emit_event(&self.default_queue, name, &payload)
            .await?)
    }

    // -----------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------

    /// Fetch a task by ID. `None` when unknown.
    pub async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>> {
        Ok(self.store.get_task(&self.default_queue, task_id).await?)
    }

    /// Fetch a run by ID. `None` when unknown.
    pub async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>> {
        Ok(self.store.get_run(&self.default_queue, run_id).await?)
    }

    /// Cancel a non-terminal task. Returns `true` if it was cancelled.
    pub async fn cancel_task(&self, task_id: Uuid) -> Result<bool> {
        Ok(self.store.cancel_task(&self.default_queue, task_id).await?)
    }

    // -----------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------

    /// Claim up to `batch_size` runs without executing them.
    pub async fn claim_tasks(&self, opts: &ClaimOptions) -> Result<Vec<ClaimedTask>> {
        Ok(self
            .store
            .claim_tasks(
                &self.default_queue,
                opts.batch_size,
                opts.claim_timeout,
                &opts.worker_id,
            )
            .await?)
    }

    /// Execute one previously claimed run with lease heartbeating.
    ///
    /// Handler errors are caught and persisted; only datastore failures
    /// that prevented recording an outcome are returned.
    pub async fn execute_task(
        &self,
        claimed: &ClaimedTask,
        worker_id: &str,
        claim_timeout: Duration,
    ) -> Result<()> {
        let outcome = execute_claimed(
            &self.store,
            &self.registry,
            &self.default_queue,
            claimed,
            worker_id,
            claim_timeout,
            true,
        )
        .await;
        match outcome {
            RunOutcome::Abandoned(e) => Err(Error::Store(e)),
            _ => Ok(()),
        }
    }

    /// Claim and execute up to `batch_size` runs sequentially, without
    /// lease heartbeating. Returns the number of claims processed.
    pub async fn work_batch(
        &self,
        worker_id: &str,
        claim_timeout: Duration,
        batch_size: u32,
    ) -> Result<u32> {
        let claims = self
            .store
            .claim_tasks(&self.default_queue, batch_size, claim_timeout, worker_id)
            .await?;

        let mut processed = 0;
        for claimed in &claims {
            let outcome = execute_claimed(
                &self.store,
                &self.registry,
                &self.default_queue,
                claimed,
                worker_id,
                claim_timeout,
                false,
            )
            .await;
            if let RunOutcome::Abandoned(e) = outcome {
                return Err(Error::Store(e.context(format!(
                    "failed to record outcome for run {}",
                    claimed.run_id
                ))));
            }
            processed += 1;
        }

        Ok(processed)
    }

    /// Start a background worker polling this client's queue.
    pub fn start_worker(&self, config: WorkerConfig) -> Worker {
        start(
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            self.default_queue.clone(),
            config,
        )
    }
}

impl std::fmt::Debug for Mule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mule")
            .field("default_queue", &self.default_queue)
            .finish()
    }
}
