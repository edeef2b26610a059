//! Error taxonomy: configuration errors raised synchronously by the
//! façade, the in-process suspension signal, and the handler-facing error
//! type the engine translates into durable outcomes.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by façade operations.
#[derive(Debug, Error)]
pub enum Error {
    /// `spawn` was called for an unregistered task without an explicit
    /// queue, so there is nowhere safe to route it.
    #[error("task {name:?} is not registered and no queue was given")]
    UnregisteredTask { name: String },

    /// The task is bound to one queue but the spawn asked for another.
    #[error("task {name:?} is bound to queue {bound:?}, cannot spawn on {requested:?}")]
    QueueMismatch {
        name: String,
        bound: String,
        requested: String,
    },

    /// Spawn options that cannot be honoured.
    #[error("invalid spawn options: {0}")]
    InvalidOptions(String),

    /// Datastore failure, bubbled from the adapter.
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// What a suspended run is waiting for.
///
/// Raised from inside `await_event`/`sleep` *after* the sleeping state has
/// been persisted; the engine catches it and leaves the run parked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Suspension {
    /// Waiting for an emission of the named event.
    Event { name: String },
    /// Waiting for a delay to elapse on the datastore clock.
    Sleep { delay: Duration },
}

/// Error type handlers return.
///
/// `Failed` is an ordinary handler error and consumes an attempt;
/// `Suspended` is control flow, not a failure; `Adapter` is a datastore
/// problem, which abandons the run without consuming an attempt.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("run suspended")]
    Suspended(Suspension),

    #[error(transparent)]
    Failed(#[from] anyhow::Error),

    #[error("datastore error: {0}")]
    Adapter(#[source] anyhow::Error),
}

pub type HandlerResult<T> = std::result::Result<T, HandlerError>;

impl HandlerError {
    /// Build a `Failed` from any displayable error.
    pub fn msg(message: impl std::fmt::Display) -> Self {
        Self::Failed(anyhow::anyhow!("{message}"))
    }
}

/// Identifies the run an `on_error` report came from.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub task_id: Uuid,
    pub run_id: Uuid,
    pub task_name: String,
    pub attempt: i32,
}
