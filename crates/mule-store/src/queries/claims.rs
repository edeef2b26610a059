//! Claiming runs for execution and extending claim leases.

use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::ClaimedTask;
use crate::store::ExtendOutcome;

use super::{NOW, queue_tables};

/// Claim up to `batch_size` eligible runs for a worker.
///
/// Eligible runs are pending or sleeping with `available_at` due, plus
/// running ones whose claim has expired (crashed-worker takeover), in FIFO
/// order by `available_at`. Row locks with `SKIP LOCKED` keep concurrent
/// workers from claiming the same run.
pub async fn claim_tasks(
    pool: &PgPool,
    queue: &str,
    batch_size: u32,
    claim_timeout: Duration,
    worker_id: &str,
) -> Result<Vec<ClaimedTask>> {
    if batch_size == 0 {
        return Ok(Vec::new());
    }
    let t = queue_tables(queue)?;

    let mut tx = pool
        .begin()
        .await
        .context("failed to begin claim_tasks transaction")?;

    let select = format!(
        "SELECT r.id \
         FROM {runs} r \
         JOIN {tasks} t ON t.id = r.task_id \
         WHERE t.state NOT IN ('completed', 'failed', 'cancelled') \
           AND ( \
               (r.state IN ('pending', 'sleeping') \
                    AND r.available_at IS NOT NULL AND r.available_at <= {NOW}) \
               OR (r.state = 'running' \
                    AND r.claim_expires_at IS NOT NULL AND r.claim_expires_at <= {NOW}) \
           ) \
         ORDER BY r.available_at ASC, r.created_at ASC \
         LIMIT $1 \
         FOR UPDATE OF r SKIP LOCKED",
        runs = t.runs,
        tasks = t.tasks,
    );
    let eligible: Vec<(Uuid,)> = sqlx::query_as(&select)
        .bind(i64::from(batch_size))
        .fetch_all(&mut *tx)
        .await
        .context("failed to select claimable runs")?;

    let claim_run = format!(
        "UPDATE {runs} \
         SET state = 'running', \
             claimed_by = $1, \
             claim_expires_at = {NOW} + make_interval(secs => $2), \
             started_at = COALESCE(started_at, {NOW}) \
         WHERE id = $3 \
         RETURNING task_id, attempt",
        runs = t.runs,
    );
    let claim_task = format!(
        "UPDATE {tasks} \
         SET state = 'running', \
             first_started_at = COALESCE(first_started_at, {NOW}), \
             last_run_id = $1 \
         WHERE id = $2 \
         RETURNING name, params, headers",
        tasks = t.tasks,
    );

    let mut claimed = Vec::with_capacity(eligible.len());
    for (run_id,) in eligible {
        let (task_id, attempt): (Uuid, i32) = sqlx::query_as(&claim_run)
            .bind(worker_id)
            .bind(claim_timeout.as_secs_f64())
            .bind(run_id)
            .fetch_one(&mut *tx)
            .await
            .with_context(|| format!("failed to claim run {run_id}"))?;

        let (task_name, params, headers): (String, Value, Option<Value>) =
            sqlx::query_as(&claim_task)
                .bind(run_id)
                .bind(task_id)
                .fetch_one(&mut *tx)
                .await
                .with_context(|| format!("failed to mark task {task_id} running"))?;

        claimed.push(ClaimedTask {
            task_id,
            run_id,
            attempt,
            task_name,
            params,
            headers,
        });
    }

    tx.commit()
        .await
        .context("failed to commit claim_tasks transaction")?;

    Ok(claimed)
}

/// Push a claim's expiry forward.
///
/// Only succeeds while the run is still running, owned by this worker,
/// and the current claim has not lapsed.
pub async fn extend_claim(
    pool: &PgPool,
    queue: &str,
    run_id: Uuid,
    worker_id: &str,
    claim_timeout: Duration,
) -> Result<ExtendOutcome> {
    let t = queue_tables(queue)?;

    let extend = format!(
        "UPDATE {runs} \
         SET claim_expires_at = {NOW} + make_interval(secs => $1) \
         WHERE id = $2 AND claimed_by = $3 AND state = 'running' \
           AND claim_expires_at > {NOW}",
        runs = t.runs,
    );
    let result = sqlx::query(&extend)
        .bind(claim_timeout.as_secs_f64())
        .bind(run_id)
        .bind(worker_id)
        .execute(pool)
        .await
        .context("failed to extend claim")?;

    if result.rows_affected() == 0 {
        Ok(ExtendOutcome::NotOwner)
    } else {
        Ok(ExtendOutcome::Extended)
    }
}
