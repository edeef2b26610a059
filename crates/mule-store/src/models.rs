use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use sqlx::types::Json;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// State of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Sleeping,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    /// Whether the task can make no further progress.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Sleeping => "sleeping",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskState {
    type Err = TaskStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "sleeping" => Ok(Self::Sleeping),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(TaskStateParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskState`] string.
#[derive(Debug, Clone)]
pub struct TaskStateParseError(pub String);

impl fmt::Display for TaskStateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task state: {:?}", self.0)
    }
}

impl std::error::Error for TaskStateParseError {}

// ---------------------------------------------------------------------------

/// State of a single run (one attempt at a task).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    Sleeping,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    /// Whether the run can make no further progress.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Sleeping => "sleeping",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for RunState {
    type Err = RunStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "sleeping" => Ok(Self::Sleeping),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(RunStateParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`RunState`] string.
#[derive(Debug, Clone)]
pub struct RunStateParseError(pub String);

impl fmt::Display for RunStateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid run state: {:?}", self.0)
    }
}

impl std::error::Error for RunStateParseError {}

// ---------------------------------------------------------------------------
// Retry strategy
// ---------------------------------------------------------------------------

fn default_base() -> f64 {
    1.0
}

fn default_max() -> f64 {
    60.0
}

/// Backoff policy applied when a failed run is re-enqueued.
///
/// Stored as JSONB on the task row; absent means the default exponential
/// strategy (base 1s, cap 60s, no jitter).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Constant delay between attempts.
    Fixed { seconds: f64 },
    /// `min(max, base * 2^(attempt-1))`, plus up to `jitter` extra seconds.
    Exponential {
        #[serde(default = "default_base")]
        base: f64,
        #[serde(default = "default_max")]
        max: f64,
        #[serde(default)]
        jitter: f64,
    },
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::Exponential {
            base: default_base(),
            max: default_max(),
            jitter: 0.0,
        }
    }
}

impl RetryStrategy {
    /// Delay in seconds before the run after the given failed attempt
    /// (1-based) becomes claimable.
    pub fn backoff_seconds(&self, attempt: i32) -> f64 {
        let attempt = attempt.max(1);
        match self {
            Self::Fixed { seconds } => seconds.max(0.0),
            Self::Exponential { base, max, jitter } => {
                let exp = base * 2f64.powi(attempt - 1);
                let capped = exp.min(*max).max(0.0);
                if *jitter > 0.0 {
                    capped + rand::random::<f64>() * jitter
                } else {
                    capped
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A task -- the logical unit of work, spanning one or more runs.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub name: String,
    pub params: Value,
    pub headers: Option<Value>,
    pub retry_strategy: Option<Json<RetryStrategy>>,
    pub max_attempts: i32,
    pub cancellation: Option<Value>,
    pub state: TaskState,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
    pub first_started_at: Option<DateTime<Utc>>,
    pub last_run_id: Option<Uuid>,
    pub completed_payload: Option<Value>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Task {
    /// The effective retry strategy for this task.
    pub fn retry_strategy(&self) -> RetryStrategy {
        self.retry_strategy
            .as_ref()
            .map(|j| j.0.clone())
            .unwrap_or_default()
    }
}

/// One attempt at executing a task.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Run {
    pub id: Uuid,
    pub task_id: Uuid,
    pub attempt: i32,
    pub state: RunState,
    pub claimed_by: Option<String>,
    pub claim_expires_at: Option<DateTime<Utc>>,
    pub available_at: Option<DateTime<Utc>>,
    pub wake_event: Option<String>,
    pub event_payload: Option<Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub failure_reason: Option<Json<FailureReason>>,
    pub created_at: DateTime<Utc>,
}

/// The persisted record of a completed step.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Checkpoint {
    pub task_id: Uuid,
    pub name: String,
    pub state: Value,
    pub owner_run_id: Uuid,
    pub updated_at: DateTime<Utc>,
}

/// Why a run failed. `stack` carries the debug rendering of the error
/// chain when one is available.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReason {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl FailureReason {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }
}

/// A run handed to a worker by `claim_tasks`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ClaimedTask {
    pub task_id: Uuid,
    pub run_id: Uuid,
    pub attempt: i32,
    pub task_name: String,
    pub params: Value,
    pub headers: Option<Value>,
}

/// Identifiers returned by a successful spawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnedTask {
    pub task_id: Uuid,
    pub run_id: Uuid,
    pub attempt: i32,
}

// ---------------------------------------------------------------------------
// Spawn input
// ---------------------------------------------------------------------------

/// When the first run of a task becomes claimable.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum StartTime {
    /// Claimable as soon as a worker polls.
    #[default]
    Immediate,
    /// Claimable at an absolute datastore timestamp.
    At(DateTime<Utc>),
    /// Claimable after a delay, measured on the datastore clock.
    After(Duration),
}

/// Everything the adapter needs to create a task and its first run.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub name: String,
    pub params: Value,
    pub headers: Option<Value>,
    pub retry_strategy: Option<RetryStrategy>,
    pub max_attempts: i32,
    pub cancellation: Option<Value>,
    pub start: StartTime,
}

impl NewTask {
    pub fn new(name: impl Into<String>, params: Value) -> Self {
        Self {
            name: name.into(),
            params,
            headers: None,
            retry_strategy: None,
            max_attempts: 1,
            cancellation: None,
            start: StartTime::Immediate,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
