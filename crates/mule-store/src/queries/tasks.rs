//! Task-level queries: spawning, lookups, and cancellation.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use crate::models::{NewTask, Run, SpawnedTask, StartTime, Task};

use super::{NOW, queue_tables};

/// Create a task and its first run in one transaction.
///
/// `available_at` is computed on the datastore clock: an absolute
/// timestamp, a delay from now, or now itself.
pub async fn spawn_task(pool: &PgPool, queue: &str, new: &NewTask) -> Result<SpawnedTask> {
    let t = queue_tables(queue)?;

    let (run_at, run_after_secs) = match new.start {
        StartTime::Immediate => (None, None),
        StartTime::At(ts) => (Some(ts), None),
        StartTime::After(delay) => (None, Some(delay.as_secs_f64())),
    };

    let mut tx = pool
        .begin()
        .await
        .context("failed to begin spawn_task transaction")?;

    let insert_task = format!(
        "INSERT INTO {tasks} \
             (name, params, headers, retry_strategy, max_attempts, cancellation, attempts) \
         VALUES ($1, $2, $3, $4, $5, $6, 1) \
         RETURNING id",
        tasks = t.tasks,
    );
    let (task_id,): (Uuid,) = sqlx::query_as(&insert_task)
        .bind(&new.name)
        .bind(&new.params)
        .bind(&new.headers)
        .bind(new.retry_strategy.clone().map(Json))
        .bind(new.max_attempts)
        .bind(&new.cancellation)
        .fetch_one(&mut *tx)
        .await
        .with_context(|| format!("failed to insert task {}", new.name))?;

    let insert_run = format!(
        "INSERT INTO {runs} (task_id, attempt, state, available_at) \
         VALUES ($1, 1, 'pending', \
                 COALESCE($2, {NOW} + make_interval(secs => $3), {NOW})) \
         RETURNING id",
        runs = t.runs,
    );
    let (run_id,): (Uuid,) = sqlx::query_as(&insert_run)
        .bind(task_id)
        .bind(run_at)
        .bind(run_after_secs)
        .fetch_one(&mut *tx)
        .await
        .with_context(|| format!("failed to insert first run for task {task_id}"))?;

    let link_run = format!(
        "UPDATE {tasks} SET last_run_id = $1 WHERE id = $2",
        tasks = t.tasks,
    );
    sqlx::query(&link_run)
        .bind(run_id)
        .bind(task_id)
        .execute(&mut *tx)
        .await
        .context("failed to link first run to task")?;

    tx.commit()
        .await
        .context("failed to commit spawn_task transaction")?;

    Ok(SpawnedTask {
        task_id,
        run_id,
        attempt: 1,
    })
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &PgPool, queue: &str, task_id: Uuid) -> Result<Option<Task>> {
    let t = queue_tables(queue)?;
    let query = format!("SELECT * FROM {tasks} WHERE id = $1", tasks = t.tasks);
    let task = sqlx::query_as::<_, Task>(&query)
        .bind(task_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// Fetch a single run by ID.
pub async fn get_run(pool: &PgPool, queue: &str, run_id: Uuid) -> Result<Option<Run>> {
    let t = queue_tables(queue)?;
    let query = format!("SELECT * FROM {runs} WHERE id = $1", runs = t.runs);
    let run = sqlx::query_as::<_, Run>(&query)
        .bind(run_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch run")?;

    Ok(run)
}

/// List all runs for a task, oldest attempt first.
pub async fn list_runs_for_task(pool: &PgPool, queue: &str, task_id: Uuid) -> Result<Vec<Run>> {
    let t = queue_tables(queue)?;
    let query = format!(
        "SELECT * FROM {runs} WHERE task_id = $1 ORDER BY attempt ASC",
        runs = t.runs,
    );
    let runs = sqlx::query_as::<_, Run>(&query)
        .bind(task_id)
        .fetch_all(pool)
        .await
        .context("failed to list runs for task")?;

    Ok(runs)
}

/// Cancel a task that has not yet reached a terminal state.
///
/// Pending and sleeping runs are cancelled and any waiter is removed; a
/// currently-running attempt is left to finish, but no further runs will
/// be created once the task is terminal.
///
/// Returns `true` if the task was cancelled, `false` if it was missing or
/// already terminal.
pub async fn cancel_task(pool: &PgPool, queue: &str, task_id: Uuid) -> Result<bool> {
    let t = queue_tables(queue)?;

    let mut tx = pool
        .begin()
        .await
        .context("failed to begin cancel_task transaction")?;

    let cancel = format!(
        "UPDATE {tasks} \
         SET state = 'cancelled', cancelled_at = {NOW} \
         WHERE id = $1 AND state NOT IN ('completed', 'failed', 'cancelled') \
         RETURNING id",
        tasks = t.tasks,
    );
    let cancelled: Option<(Uuid,)> = sqlx::query_as(&cancel)
        .bind(task_id)
        .fetch_optional(&mut *tx)
        .await
        .context("failed to cancel task")?;

    if cancelled.is_none() {
        return Ok(false);
    }

    let cancel_runs = format!(
        "UPDATE {runs} \
         SET state = 'cancelled', claimed_by = NULL, claim_expires_at = NULL, \
             available_at = NULL, wake_event = NULL \
         WHERE task_id = $1 AND state IN ('pending', 'sleeping')",
        runs = t.runs,
    );
    sqlx::query(&cancel_runs)
        .bind(task_id)
        .execute(&mut *tx)
        .await
        .context("failed to cancel pending runs")?;

    let drop_waiters = format!(
        "DELETE FROM {waiters} WHERE task_id = $1",
        waiters = t.waiters,
    );
    sqlx::query(&drop_waiters)
        .bind(task_id)
        .execute(&mut *tx)
        .await
        .context("failed to remove waiters for cancelled task")?;

    tx.commit()
        .await
        .context("failed to commit cancel_task transaction")?;

    Ok(true)
}

/// Timestamp helper for tests: the datastore's current notion of "now".
pub async fn current_time(pool: &PgPool) -> Result<DateTime<Utc>> {
    let (now,): (DateTime<Utc>,) = sqlx::query_as(&format!("SELECT {NOW}"))
        .fetch_one(pool)
        .await
        .context("failed to read datastore time")?;
    Ok(now)
}
