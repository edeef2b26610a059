//! Durable task-execution SDK.
//!
//! Producers spawn named tasks with structured params; workers claim runs,
//! execute registered handlers, checkpoint step results, suspend on events
//! or timers, and resume -- with the datastore as the single source of
//! truth for every durable decision.
//!
//! ```ignore
//! let mule = Mule::connect(&DbConfig::from_env(), "billing").await?;
//! mule.create_queue("billing").await?;
//!
//! mule.register_task(TaskConfig::new("double"), |params: Params, ctx| async move {
//!     let doubled = ctx.step("double", || async move { Ok(params.value * 2) }).await?;
//!     Ok(serde_json::json!({ "doubled": doubled }))
//! });
//!
//! mule.spawn("double", serde_json::json!({ "value": 21 }), SpawnOptions::default()).await?;
//! let worker = mule.start_worker(WorkerConfig::default());
//! ```

pub mod client;
pub mod context;
pub mod engine;
pub mod error;
pub mod lease;
pub mod registry;
pub mod worker;

pub use client::{ClaimOptions, Mule, SpawnOptions};
pub use context::TaskContext;
pub use engine::RunOutcome;
pub use error::{Error, ErrorContext, HandlerError, HandlerResult, Result, Suspension};
pub use lease::ClaimLease;
pub use registry::{TaskConfig, TaskRegistry};
pub use worker::{ErrorHook, Worker, WorkerConfig};

pub use mule_store::{
    ClaimedTask, DbConfig, FailureReason, MemTaskStore, PgTaskStore, RetryStrategy, Run, RunState,
    SpawnedTask, Task, TaskState, TaskStore,
};
