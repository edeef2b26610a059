//! PostgreSQL implementation of [`TaskStore`].

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{ClaimedTask, FailureReason, NewTask, Run, SpawnedTask, Task};
use crate::queries;
use crate::store::{CompleteOutcome, EventWait, ExtendOutcome, FailOutcome, TaskStore};

/// Postgres-backed task store.
///
/// Cheap to clone; all state lives in the connection pool.
#[derive(Clone)]
pub struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn create_queue(&self, queue: &str) -> Result<()> {
        queries::queues::create_queue(&self.pool, queue).await
    }

    async fn drop_queue(&self, queue: &str) -> Result<()> {
        queries::queues::drop_queue(&self.pool, queue).await
    }

    async fn list_queues(&self) -> Result<Vec<String>> {
        queries::queues::list_queues(&self.pool).await
    }

    async fn spawn_task(&self, queue: &str, new: &NewTask) -> Result<SpawnedTask> {
        queries::tasks::spawn_task(&self.pool, queue, new).await
    }

    async fn emit_event(&self, queue: &str, event_name: &str, payload: &Value) -> Result<()> {
        queries::events::emit_event(&self.pool, queue, event_name, payload).await
    }

    async fn claim_tasks(
        &self,
        queue: &str,
        batch_size: u32,
        claim_timeout: Duration,
        worker_id: &str,
    ) -> Result<Vec<ClaimedTask>> {
        queries::claims::claim_tasks(&self.pool, queue, batch_size, claim_timeout, worker_id).await
    }

    async fn extend_claim(
        &self,
        queue: &str,
        run_id: Uuid,
        worker_id: &str,
        claim_timeout: Duration,
    ) -> Result<ExtendOutcome> {
        queries::claims::extend_claim(&self.pool, queue, run_id, worker_id, claim_timeout).await
    }

    async fn complete_run(
        &self,
        queue: &str,
        run_id: Uuid,
        worker_id: &str,
        result: &Value,
    ) -> Result<CompleteOutcome> {
        queries::runs::complete_run(&self.pool, queue, run_id, worker_id, result).await
    }

    async fn fail_run(
        &self,
        queue: &str,
        run_id: Uuid,
        worker_id: &str,
        reason: &FailureReason,
    ) -> Result<FailOutcome> {
        queries::runs::fail_run(&self.pool, queue, run_id, worker_id, reason).await
    }

    async fn suspend_for_event(
        &self,
        queue: &str,
        task_id: Uuid,
        run_id: Uuid,
        worker_id: &str,
        event_name: &str,
        checkpoint_name: &str,
    ) -> Result<EventWait> {
        queries::runs::suspend_for_event(
            &self.pool,
            queue,
            task_id,
            run_id,
            worker_id,
            event_name,
            checkpoint_name,
        )
        .await
    }

    async fn suspend_for_sleep(
        &self,
        queue: &str,
        task_id: Uuid,
        run_id: Uuid,
        worker_id: &str,
        delay: Duration,
        checkpoint_name: &str,
    ) -> Result<()> {
        queries::runs::suspend_for_sleep(
            &self.pool,
            queue,
            task_id,
            run_id,
            worker_id,
            delay,
            checkpoint_name,
        )
        .await
    }

    async fn read_checkpoint(
        &self,
        queue: &str,
        task_id: Uuid,
        name: &str,
    ) -> Result<Option<Value>> {
        queries::checkpoints::read_checkpoint(&self.pool, queue, task_id, name).await
    }

    async fn write_checkpoint(
        &self,
        queue: &str,
        task_id: Uuid,
        name: &str,
        state: &Value,
        owner_run_id: Uuid,
    ) -> Result<bool> {
        queries::checkpoints::write_checkpoint(&self.pool, queue, task_id, name, state, owner_run_id)
            .await
    }

    async fn get_task(&self, queue: &str, task_id: Uuid) -> Result<Option<Task>> {
        queries::tasks::get_task(&self.pool, queue, task_id).await
    }

    async fn get_run(&self, queue: &str, run_id: Uuid) -> Result<Option<Run>> {
        queries::tasks::get_run(&self.pool, queue, run_id).await
    }

    async fn cancel_task(&self, queue: &str, task_id: Uuid) -> Result<bool> {
        queries::tasks::cancel_task(&self.pool, queue, task_id).await
    }
}
