//! The datastore boundary: everything the execution engine needs from the
//! backing store, behind one object-safe trait.
//!
//! `NotOwner` outcomes are data rather than errors so callers can treat a
//! lost claim as a recoverable abandon instead of a failure.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::models::{ClaimedTask, FailureReason, NewTask, Run, SpawnedTask, Task};

/// Result of a claim-lease extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendOutcome {
    /// The expiry was pushed forward.
    Extended,
    /// The run is no longer owned by this worker.
    NotOwner,
}

/// Result of completing a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteOutcome {
    Completed,
    NotOwner,
}

/// Result of failing a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// A new run was enqueued for a later attempt.
    Retrying { run_id: Uuid, attempt: i32 },
    /// Attempts are exhausted; the task is now failed.
    Exhausted,
    NotOwner,
}

/// Result of `suspend_for_event`.
#[derive(Debug, Clone, PartialEq)]
pub enum EventWait {
    /// A cached emission was consumed; the run keeps executing.
    Cached(Value),
    /// The run was parked; the caller must raise the suspension signal.
    Suspended,
}

/// Operations the SDK requires from a backing datastore.
///
/// The Postgres implementation is [`PgTaskStore`](crate::PgTaskStore); an
/// in-memory one, [`MemTaskStore`](crate::MemTaskStore), backs fast tests.
/// All time arithmetic (availability, claim expiry, backoff) happens on the
/// store's clock, never the caller's.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Create a queue's table group. Idempotent.
    async fn create_queue(&self, queue: &str) -> Result<()>;

    /// Drop a queue's table group. Tolerates a missing queue.
    async fn drop_queue(&self, queue: &str) -> Result<()>;

    /// Names of all existing queues.
    async fn list_queues(&self) -> Result<Vec<String>>;

    /// Create a task and its first pending run.
    async fn spawn_task(&self, queue: &str, new: &NewTask) -> Result<SpawnedTask>;

    /// Emit an event: wake parked waiters or cache the payload.
    async fn emit_event(&self, queue: &str, event_name: &str, payload: &Value) -> Result<()>;

    /// Claim up to `batch_size` eligible runs, FIFO by availability.
    async fn claim_tasks(
        &self,
        queue: &str,
        batch_size: u32,
        claim_timeout: Duration,
        worker_id: &str,
    ) -> Result<Vec<ClaimedTask>>;

    /// Extend a held claim's expiry.
    async fn extend_claim(
        &self,
        queue: &str,
        run_id: Uuid,
        worker_id: &str,
        claim_timeout: Duration,
    ) -> Result<ExtendOutcome>;

    /// Record a successful run and complete its task.
    async fn complete_run(
        &self,
        queue: &str,
        run_id: Uuid,
        worker_id: &str,
        result: &Value,
    ) -> Result<CompleteOutcome>;

    /// Record a failed run; re-enqueues or finishes the task per its
    /// retry policy.
    async fn fail_run(
        &self,
        queue: &str,
        run_id: Uuid,
        worker_id: &str,
        reason: &FailureReason,
    ) -> Result<FailOutcome>;

    /// Consume a cached event or park the run as a waiter.
    ///
    /// `checkpoint_name` is the replay marker the payload is recorded
    /// under when the event is (eventually) consumed.
    async fn suspend_for_event(
        &self,
        queue: &str,
        task_id: Uuid,
        run_id: Uuid,
        worker_id: &str,
        event_name: &str,
        checkpoint_name: &str,
    ) -> Result<EventWait>;

    /// Park the run until `delay` elapses on the store clock, recording
    /// the `checkpoint_name` marker so replays skip the sleep.
    async fn suspend_for_sleep(
        &self,
        queue: &str,
        task_id: Uuid,
        run_id: Uuid,
        worker_id: &str,
        delay: Duration,
        checkpoint_name: &str,
    ) -> Result<()>;

    /// Read a checkpoint's stored state.
    async fn read_checkpoint(
        &self,
        queue: &str,
        task_id: Uuid,
        name: &str,
    ) -> Result<Option<Value>>;

    /// Write a checkpoint; first write wins. Returns `true` on insert.
    async fn write_checkpoint(
        &self,
        queue: &str,
        task_id: Uuid,
        name: &str,
        state: &Value,
        owner_run_id: Uuid,
    ) -> Result<bool>;

    /// Fetch a task by ID.
    async fn get_task(&self, queue: &str, task_id: Uuid) -> Result<Option<Task>>;

    /// Fetch a run by ID.
    async fn get_run(&self, queue: &str, run_id: Uuid) -> Result<Option<Run>>;

    /// Cancel a non-terminal task. Returns `true` if it was cancelled.
    async fn cancel_task(&self, queue: &str, task_id: Uuid) -> Result<bool>;
}
