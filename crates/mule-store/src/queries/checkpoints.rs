//! Checkpoint reads and write-once writes.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::Checkpoint;

use super::queue_tables;

/// Fetch the stored state of a checkpoint, if it exists.
pub async fn read_checkpoint(
    pool: &PgPool,
    queue: &str,
    task_id: Uuid,
    name: &str,
) -> Result<Option<Value>> {
    let t = queue_tables(queue)?;
    let query = format!(
        "SELECT state FROM {checkpoints} WHERE task_id = $1 AND name = $2",
        checkpoints = t.checkpoints,
    );
    let row: Option<(Value,)> = sqlx::query_as(&query)
        .bind(task_id)
        .bind(name)
        .fetch_optional(pool)
        .await
        .with_context(|| format!("failed to read checkpoint {name} for task {task_id}"))?;

    Ok(row.map(|(state,)| state))
}

/// Write a checkpoint. The first write wins; later writes for the same
/// `(task_id, name)` are ignored, keeping checkpoints immutable.
///
/// Returns `true` when this call inserted the row.
pub async fn write_checkpoint(
    pool: &PgPool,
    queue: &str,
    task_id: Uuid,
    name: &str,
    state: &Value,
    owner_run_id: Uuid,
) -> Result<bool> {
    let t = queue_tables(queue)?;
    let insert = format!(
        "INSERT INTO {checkpoints} (task_id, name, state, owner_run_id) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT (task_id, name) DO NOTHING",
        checkpoints = t.checkpoints,
    );
    let result = sqlx::query(&insert)
        .bind(task_id)
        .bind(name)
        .bind(state)
        .bind(owner_run_id)
        .execute(pool)
        .await
        .with_context(|| format!("failed to write checkpoint {name} for task {task_id}"))?;

    Ok(result.rows_affected() == 1)
}

/// List all checkpoints for a task in write order.
pub async fn list_checkpoints(
    pool: &PgPool,
    queue: &str,
    task_id: Uuid,
) -> Result<Vec<Checkpoint>> {
    let t = queue_tables(queue)?;
    let query = format!(
        "SELECT * FROM {checkpoints} WHERE task_id = $1 ORDER BY updated_at ASC, name ASC",
        checkpoints = t.checkpoints,
    );
    let checkpoints = sqlx::query_as::<_, Checkpoint>(&query)
        .bind(task_id)
        .fetch_all(pool)
        .await
        .with_context(|| format!("failed to list checkpoints for task {task_id}"))?;

    Ok(checkpoints)
}
