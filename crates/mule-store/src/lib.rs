//! Datastore adapter for the mule task-execution SDK.
//!
//! The store owns all durable state: tasks, runs, checkpoints, cached
//! events, and waiters, grouped per queue. [`TaskStore`] is the boundary
//! the execution engine talks to; [`PgTaskStore`] implements it over
//! PostgreSQL and [`MemTaskStore`] in memory for tests.

pub mod config;
pub mod mem;
pub mod models;
pub mod pg;
pub mod pool;
pub mod queries;
pub mod store;

pub use config::DbConfig;
pub use mem::MemTaskStore;
pub use models::{
    Checkpoint, ClaimedTask, FailureReason, NewTask, RetryStrategy, Run, RunState, SpawnedTask,
    StartTime, Task, TaskState,
};
pub use pg::PgTaskStore;
pub use store::{CompleteOutcome, EventWait, ExtendOutcome, FailOutcome, TaskStore};
