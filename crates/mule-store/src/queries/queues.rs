//! Queue administration: create, drop, and list per-queue table groups.

use anyhow::{Context, Result};
use sqlx::PgPool;

use super::{SCHEMA, queue_tables};

/// Create the table group for a queue. Idempotent.
///
/// Creates the `mule` schema on first use, then the five tables: tasks,
/// runs, checkpoints, cached events, and waiters.
pub async fn create_queue(pool: &PgPool, queue: &str) -> Result<()> {
    let t = queue_tables(queue)?;

    let mut tx = pool
        .begin()
        .await
        .context("failed to begin create_queue transaction")?;

    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {SCHEMA}"))
        .execute(&mut *tx)
        .await
        .context("failed to create schema")?;

    let tasks_ddl = format!(
        "CREATE TABLE IF NOT EXISTS {tasks} ( \
             id UUID PRIMARY KEY DEFAULT gen_random_uuid(), \
             name TEXT NOT NULL, \
             params JSONB NOT NULL, \
             headers JSONB, \
             retry_strategy JSONB, \
             max_attempts INTEGER NOT NULL DEFAULT 1 CHECK (max_attempts >= 1), \
             cancellation JSONB, \
             state TEXT NOT NULL DEFAULT 'pending' CHECK \
                 (state IN ('pending', 'running', 'sleeping', 'completed', 'failed', 'cancelled')), \
             attempts INTEGER NOT NULL DEFAULT 0 CHECK (attempts <= max_attempts), \
             created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(), \
             first_started_at TIMESTAMPTZ, \
             last_run_id UUID, \
             completed_payload JSONB, \
             cancelled_at TIMESTAMPTZ \
         )",
        tasks = t.tasks,
    );

    let runs_ddl = format!(
        "CREATE TABLE IF NOT EXISTS {runs} ( \
             id UUID PRIMARY KEY DEFAULT gen_random_uuid(), \
             task_id UUID NOT NULL REFERENCES {tasks}(id) ON DELETE CASCADE, \
             attempt INTEGER NOT NULL CHECK (attempt >= 1), \
             state TEXT NOT NULL DEFAULT 'pending' CHECK \
                 (state IN ('pending', 'running', 'sleeping', 'completed', 'failed', 'cancelled')), \
             claimed_by TEXT, \
             claim_expires_at TIMESTAMPTZ, \
             available_at TIMESTAMPTZ, \
             wake_event TEXT, \
             event_payload JSONB, \
             started_at TIMESTAMPTZ, \
             completed_at TIMESTAMPTZ, \
             failed_at TIMESTAMPTZ, \
             result JSONB, \
             failure_reason JSONB, \
             created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(), \
             CHECK (state != 'sleeping' OR wake_event IS NOT NULL OR available_at IS NOT NULL) \
         )",
        runs = t.runs,
        tasks = t.tasks,
    );

    let runs_ready_idx = format!(
        "CREATE INDEX IF NOT EXISTS r_{queue}_ready_idx \
         ON {runs} (available_at, created_at) \
         WHERE state IN ('pending', 'sleeping')",
        runs = t.runs,
    );

    let checkpoints_ddl = format!(
        "CREATE TABLE IF NOT EXISTS {checkpoints} ( \
             task_id UUID NOT NULL REFERENCES {tasks}(id) ON DELETE CASCADE, \
             name TEXT NOT NULL, \
             state JSONB NOT NULL, \
             owner_run_id UUID NOT NULL, \
             updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(), \
             PRIMARY KEY (task_id, name) \
         )",
        checkpoints = t.checkpoints,
        tasks = t.tasks,
    );

    let events_ddl = format!(
        "CREATE TABLE IF NOT EXISTS {events} ( \
             id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY, \
             name TEXT NOT NULL, \
             payload JSONB, \
             emitted_at TIMESTAMPTZ NOT NULL DEFAULT NOW() \
         )",
        events = t.events,
    );

    let events_name_idx = format!(
        "CREATE INDEX IF NOT EXISTS e_{queue}_name_idx ON {events} (name, id)",
        events = t.events,
    );

    let waiters_ddl = format!(
        "CREATE TABLE IF NOT EXISTS {waiters} ( \
             task_id UUID NOT NULL REFERENCES {tasks}(id) ON DELETE CASCADE, \
             run_id UUID NOT NULL, \
             event_name TEXT NOT NULL, \
             checkpoint_name TEXT NOT NULL, \
             created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(), \
             PRIMARY KEY (task_id, run_id) \
         )",
        waiters = t.waiters,
        tasks = t.tasks,
    );

    let waiters_event_idx = format!(
        "CREATE INDEX IF NOT EXISTS w_{queue}_event_idx ON {waiters} (event_name)",
        waiters = t.waiters,
    );

    for ddl in [
        tasks_ddl,
        runs_ddl,
        runs_ready_idx,
        checkpoints_ddl,
        events_ddl,
        events_name_idx,
        waiters_ddl,
        waiters_event_idx,
    ] {
        sqlx::query(&ddl)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to create tables for queue {queue}"))?;
    }

    tx.commit()
        .await
        .context("failed to commit create_queue transaction")?;

    Ok(())
}

/// Drop the table group for a queue. Tolerates a queue that never existed.
pub async fn drop_queue(pool: &PgPool, queue: &str) -> Result<()> {
    let t = queue_tables(queue)?;

    let mut tx = pool
        .begin()
        .await
        .context("failed to begin drop_queue transaction")?;

    // Referencing tables first, tasks last.
    for table in [&t.waiters, &t.events, &t.checkpoints, &t.runs, &t.tasks] {
        let stmt = format!("DROP TABLE IF EXISTS {table}");
        sqlx::query(&stmt)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to drop table {table}"))?;
    }

    tx.commit()
        .await
        .context("failed to commit drop_queue transaction")?;

    Ok(())
}

/// List the names of all queues in the schema.
///
/// A queue is identified by the presence of its task table.
pub async fn list_queues(pool: &PgPool) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT tablename::text \
         FROM pg_tables \
         WHERE schemaname = $1 AND tablename LIKE 't\\_%' \
         ORDER BY tablename",
    )
    .bind(SCHEMA)
    .fetch_all(pool)
    .await
    .context("failed to list queues")?;

    Ok(rows
        .into_iter()
        .filter_map(|(name,)| name.strip_prefix("t_").map(str::to_owned))
        .collect())
}
