//! Event emission: wake parked waiters or cache the payload.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use super::{NOW, queue_tables};

/// Emit an event into a queue.
///
/// Every currently-parked waiter for the event is woken: the payload is
/// checkpointed under the waiter's replay marker, the run becomes claimable
/// again, and the waiter row is removed. When nobody is waiting, the
/// emission is cached for a later `awaitEvent` to consume.
pub async fn emit_event(
    pool: &PgPool,
    queue: &str,
    event_name: &str,
    payload: &Value,
) -> Result<()> {
    let t = queue_tables(queue)?;

    let mut tx = pool
        .begin()
        .await
        .context("failed to begin emit_event transaction")?;

    let take_waiters = format!(
        "DELETE FROM {waiters} WHERE event_name = $1 \
         RETURNING task_id, run_id, checkpoint_name",
        waiters = t.waiters,
    );
    let waiters: Vec<(Uuid, Uuid, String)> = sqlx::query_as(&take_waiters)
        .bind(event_name)
        .fetch_all(&mut *tx)
        .await
        .with_context(|| format!("failed to collect waiters for event {event_name}"))?;

    if waiters.is_empty() {
        let cache = format!(
            "INSERT INTO {events} (name, payload) VALUES ($1, $2)",
            events = t.events,
        );
        sqlx::query(&cache)
            .bind(event_name)
            .bind(payload)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to cache event {event_name}"))?;

        tx.commit()
            .await
            .context("failed to commit emit_event transaction")?;
        return Ok(());
    }

    let record = format!(
        "INSERT INTO {checkpoints} (task_id, name, state, owner_run_id) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT (task_id, name) DO NOTHING",
        checkpoints = t.checkpoints,
    );
    let wake_run = format!(
        "UPDATE {runs} \
         SET state = 'pending', event_payload = $1, available_at = {NOW} \
         WHERE id = $2 AND state = 'sleeping'",
        runs = t.runs,
    );
    let wake_task = format!(
        "UPDATE {tasks} SET state = 'pending' WHERE id = $1 AND state = 'sleeping'",
        tasks = t.tasks,
    );

    for (task_id, run_id, checkpoint_name) in &waiters {
        sqlx::query(&record)
            .bind(task_id)
            .bind(checkpoint_name)
            .bind(payload)
            .bind(run_id)
            .execute(&mut *tx)
            .await
            .context("failed to checkpoint delivered event")?;

        sqlx::query(&wake_run)
            .bind(payload)
            .bind(run_id)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to wake run {run_id}"))?;

        sqlx::query(&wake_task)
            .bind(task_id)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to wake task {task_id}"))?;
    }

    tx.commit()
        .await
        .context("failed to commit emit_event transaction")?;

    Ok(())
}

/// Count cached (unconsumed) emissions of an event. Test helper.
pub async fn cached_event_count(pool: &PgPool, queue: &str, event_name: &str) -> Result<i64> {
    let t = queue_tables(queue)?;
    let query = format!(
        "SELECT COUNT(*) FROM {events} WHERE name = $1",
        events = t.events,
    );
    let (count,): (i64,) = sqlx::query_as(&query)
        .bind(event_name)
        .fetch_one(pool)
        .await
        .with_context(|| format!("failed to count cached events named {event_name}"))?;

    Ok(count)
}
