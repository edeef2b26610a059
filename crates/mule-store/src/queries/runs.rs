//! Run completion, failure (with retry re-enqueue), and suspension.

use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use crate::models::{FailureReason, RetryStrategy};
use crate::store::{CompleteOutcome, EventWait, FailOutcome};

use super::{NOW, queue_tables};

/// Mark a run completed and store the result on run and task.
pub async fn complete_run(
    pool: &PgPool,
    queue: &str,
    run_id: Uuid,
    worker_id: &str,
    result: &Value,
) -> Result<CompleteOutcome> {
    let t = queue_tables(queue)?;

    let mut tx = pool
        .begin()
        .await
        .context("failed to begin complete_run transaction")?;

    let complete = format!(
        "UPDATE {runs} \
         SET state = 'completed', result = $1, completed_at = {NOW}, \
             claimed_by = NULL, claim_expires_at = NULL \
         WHERE id = $2 AND claimed_by = $3 AND state = 'running' \
         RETURNING task_id",
        runs = t.runs,
    );
    let row: Option<(Uuid,)> = sqlx::query_as(&complete)
        .bind(result)
        .bind(run_id)
        .bind(worker_id)
        .fetch_optional(&mut *tx)
        .await
        .with_context(|| format!("failed to complete run {run_id}"))?;

    let Some((task_id,)) = row else {
        return Ok(CompleteOutcome::NotOwner);
    };

    let finish_task = format!(
        "UPDATE {tasks} SET state = 'completed', completed_payload = $1 WHERE id = $2",
        tasks = t.tasks,
    );
    sqlx::query(&finish_task)
        .bind(result)
        .bind(task_id)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("failed to mark task {task_id} completed"))?;

    tx.commit()
        .await
        .context("failed to commit complete_run transaction")?;

    Ok(CompleteOutcome::Completed)
}

/// Mark a run failed. When attempts remain, the next run is enqueued with
/// the retry strategy's backoff; otherwise the task goes terminal.
pub async fn fail_run(
    pool: &PgPool,
    queue: &str,
    run_id: Uuid,
    worker_id: &str,
    reason: &FailureReason,
) -> Result<FailOutcome> {
    let t = queue_tables(queue)?;

    let mut tx = pool
        .begin()
        .await
        .context("failed to begin fail_run transaction")?;

    let fail = format!(
        "UPDATE {runs} \
         SET state = 'failed', failure_reason = $1, failed_at = {NOW}, \
             claimed_by = NULL, claim_expires_at = NULL \
         WHERE id = $2 AND claimed_by = $3 AND state = 'running' \
         RETURNING task_id, attempt",
        runs = t.runs,
    );
    let row: Option<(Uuid, i32)> = sqlx::query_as(&fail)
        .bind(Json(reason))
        .bind(run_id)
        .bind(worker_id)
        .fetch_optional(&mut *tx)
        .await
        .with_context(|| format!("failed to fail run {run_id}"))?;

    let Some((task_id, attempt)) = row else {
        return Ok(FailOutcome::NotOwner);
    };

    let lock_task = format!(
        "SELECT attempts, max_attempts, retry_strategy FROM {tasks} WHERE id = $1 FOR UPDATE",
        tasks = t.tasks,
    );
    let (attempts, max_attempts, strategy): (i32, i32, Option<Json<RetryStrategy>>) =
        sqlx::query_as(&lock_task)
            .bind(task_id)
            .fetch_one(&mut *tx)
            .await
            .with_context(|| format!("failed to lock task {task_id} for retry decision"))?;

    let outcome = if attempts < max_attempts {
        let backoff = strategy
            .map(|j| j.0)
            .unwrap_or_default()
            .backoff_seconds(attempt);

        let insert_run = format!(
            "INSERT INTO {runs} (task_id, attempt, state, available_at) \
             VALUES ($1, $2, 'pending', {NOW} + make_interval(secs => $3)) \
             RETURNING id",
            runs = t.runs,
        );
        let (next_run_id,): (Uuid,) = sqlx::query_as(&insert_run)
            .bind(task_id)
            .bind(attempts + 1)
            .bind(backoff)
            .fetch_one(&mut *tx)
            .await
            .with_context(|| format!("failed to enqueue retry run for task {task_id}"))?;

        let bump_task = format!(
            "UPDATE {tasks} \
             SET attempts = attempts + 1, state = 'pending', last_run_id = $1 \
             WHERE id = $2",
            tasks = t.tasks,
        );
        sqlx::query(&bump_task)
            .bind(next_run_id)
            .bind(task_id)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to bump attempts on task {task_id}"))?;

        FailOutcome::Retrying {
            run_id: next_run_id,
            attempt: attempts + 1,
        }
    } else {
        let finish_task = format!(
            "UPDATE {tasks} SET state = 'failed' WHERE id = $1",
            tasks = t.tasks,
        );
        sqlx::query(&finish_task)
            .bind(task_id)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to mark task {task_id} failed"))?;

        FailOutcome::Exhausted
    };

    tx.commit()
        .await
        .context("failed to commit fail_run transaction")?;

    Ok(outcome)
}

/// Consume a cached event or park the run waiting for one.
///
/// When an emission is cached, the oldest one is consumed and its payload
/// is also written as the `checkpoint_name` checkpoint so replays observe
/// the same payload. Otherwise the run goes to sleep with a waiter row and
/// the claim is released.
pub async fn suspend_for_event(
    pool: &PgPool,
    queue: &str,
    task_id: Uuid,
    run_id: Uuid,
    worker_id: &str,
    event_name: &str,
    checkpoint_name: &str,
) -> Result<EventWait> {
    let t = queue_tables(queue)?;

    let mut tx = pool
        .begin()
        .await
        .context("failed to begin suspend_for_event transaction")?;

    let consume = format!(
        "DELETE FROM {events} \
         WHERE id = ( \
             SELECT id FROM {events} WHERE name = $1 \
             ORDER BY id ASC LIMIT 1 \
             FOR UPDATE SKIP LOCKED \
         ) \
         RETURNING payload",
        events = t.events,
    );
    let cached: Option<(Option<Value>,)> = sqlx::query_as(&consume)
        .bind(event_name)
        .fetch_optional(&mut *tx)
        .await
        .with_context(|| format!("failed to consume cached event {event_name}"))?;

    if let Some((payload,)) = cached {
        let payload = payload.unwrap_or(Value::Null);

        let record = format!(
            "INSERT INTO {checkpoints} (task_id, name, state, owner_run_id) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (task_id, name) DO NOTHING",
            checkpoints = t.checkpoints,
        );
        sqlx::query(&record)
            .bind(task_id)
            .bind(checkpoint_name)
            .bind(&payload)
            .bind(run_id)
            .execute(&mut *tx)
            .await
            .context("failed to record consumed event checkpoint")?;

        tx.commit()
            .await
            .context("failed to commit suspend_for_event transaction")?;

        return Ok(EventWait::Cached(payload));
    }

    let park = format!(
        "UPDATE {runs} \
         SET state = 'sleeping', wake_event = $1, available_at = NULL, \
             claimed_by = NULL, claim_expires_at = NULL \
         WHERE id = $2 AND claimed_by = $3 AND state = 'running'",
        runs = t.runs,
    );
    let parked = sqlx::query(&park)
        .bind(event_name)
        .bind(run_id)
        .bind(worker_id)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("failed to park run {run_id}"))?;

    if parked.rows_affected() == 0 {
        // Claim was lost in the meantime; the run belongs to someone else
        // now, so leave their state alone.
        return Ok(EventWait::Suspended);
    }

    let wait = format!(
        "INSERT INTO {waiters} (task_id, run_id, event_name, checkpoint_name) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT (task_id, run_id) DO UPDATE \
             SET event_name = EXCLUDED.event_name, \
                 checkpoint_name = EXCLUDED.checkpoint_name",
        waiters = t.waiters,
    );
    sqlx::query(&wait)
        .bind(task_id)
        .bind(run_id)
        .bind(event_name)
        .bind(checkpoint_name)
        .execute(&mut *tx)
        .await
        .context("failed to register waiter")?;

    let park_task = format!(
        "UPDATE {tasks} SET state = 'sleeping' WHERE id = $1 AND state = 'running'",
        tasks = t.tasks,
    );
    sqlx::query(&park_task)
        .bind(task_id)
        .execute(&mut *tx)
        .await
        .context("failed to mark task sleeping")?;

    tx.commit()
        .await
        .context("failed to commit suspend_for_event transaction")?;

    Ok(EventWait::Suspended)
}

/// Park a run until a delay elapses on the datastore clock.
///
/// The `checkpoint_name` marker is written in the same transaction so the
/// replay after waking skips straight past the sleep.
pub async fn suspend_for_sleep(
    pool: &PgPool,
    queue: &str,
    task_id: Uuid,
    run_id: Uuid,
    worker_id: &str,
    delay: Duration,
    checkpoint_name: &str,
) -> Result<()> {
    let t = queue_tables(queue)?;
    let seconds = delay.as_secs_f64();

    let mut tx = pool
        .begin()
        .await
        .context("failed to begin suspend_for_sleep transaction")?;

    let park = format!(
        "UPDATE {runs} \
         SET state = 'sleeping', wake_event = NULL, \
             available_at = {NOW} + make_interval(secs => $1), \
             claimed_by = NULL, claim_expires_at = NULL \
         WHERE id = $2 AND claimed_by = $3 AND state = 'running'",
        runs = t.runs,
    );
    let parked = sqlx::query(&park)
        .bind(seconds)
        .bind(run_id)
        .bind(worker_id)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("failed to park run {run_id} for sleep"))?;

    if parked.rows_affected() == 0 {
        return Ok(());
    }

    let record = format!(
        "INSERT INTO {checkpoints} (task_id, name, state, owner_run_id) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT (task_id, name) DO NOTHING",
        checkpoints = t.checkpoints,
    );
    sqlx::query(&record)
        .bind(task_id)
        .bind(checkpoint_name)
        .bind(serde_json::json!({ "seconds": seconds }))
        .bind(run_id)
        .execute(&mut *tx)
        .await
        .context("failed to record sleep checkpoint")?;

    let park_task = format!(
        "UPDATE {tasks} SET state = 'sleeping' WHERE id = $1 AND state = 'running'",
        tasks = t.tasks,
    );
    sqlx::query(&park_task)
        .bind(task_id)
        .execute(&mut *tx)
        .await
        .context("failed to mark task sleeping")?;

    tx.commit()
        .await
        .context("failed to commit suspend_for_sleep transaction")?;

    Ok(())
}
