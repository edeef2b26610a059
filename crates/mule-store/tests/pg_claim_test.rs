//! Integration tests for the claim protocol: FIFO ordering, batch
//! boundaries, lease extension, and crashed-worker takeover.
//!
//! Requires Docker (testcontainers) unless `MULE_TEST_PG_URL` points at a
//! running PostgreSQL instance.

use std::time::Duration;

use serde_json::json;

use mule_store::{
    ExtendOutcome, NewTask, PgTaskStore, RunState, StartTime, TaskState, TaskStore,
};

const LONG_TIMEOUT: Duration = Duration::from_secs(60);

async fn pg_store(queue: &str) -> (PgTaskStore, mule_test_utils::TestDb) {
    mule_test_utils::init_tracing();
    let db = mule_test_utils::TestDb::create().await;
    let store = PgTaskStore::new(db.pool.clone());
    store.create_queue(queue).await.expect("create_queue");
    (store, db)
}

fn new_task(name: &str) -> NewTask {
    NewTask::new(name, json!({ "n": 1 }))
}

#[tokio::test]
async fn claim_respects_batch_boundaries() {
    let (store, db) = pg_store("jobs").await;

    store.spawn_task("jobs", &new_task("a")).await.expect("spawn");
    store.spawn_task("jobs", &new_task("b")).await.expect("spawn");

    // Zero batch claims nothing.
    let none = store
        .claim_tasks("jobs", 0, LONG_TIMEOUT, "w1")
        .await
        .expect("claim");
    assert!(none.is_empty());

    // Asking for more than available returns exactly what exists.
    let all = store
        .claim_tasks("jobs", 10, LONG_TIMEOUT, "w1")
        .await
        .expect("claim");
    assert_eq!(all.len(), 2);

    db.teardown().await;
}

#[tokio::test]
async fn claim_returns_fifo_by_availability() {
    let (store, db) = pg_store("jobs").await;

    let first = store.spawn_task("jobs", &new_task("first")).await.expect("spawn");
    let second = store
        .spawn_task("jobs", &new_task("second"))
        .await
        .expect("spawn");

    let claimed = store
        .claim_tasks("jobs", 2, LONG_TIMEOUT, "w1")
        .await
        .expect("claim");
    assert_eq!(claimed.len(), 2);
    assert_eq!(claimed[0].run_id, first.run_id);
    assert_eq!(claimed[1].run_id, second.run_id);
    assert_eq!(claimed[0].task_name, "first");
    assert_eq!(claimed[0].params, json!({ "n": 1 }));

    // Claimed runs carry claim metadata and the task went running.
    let run = store
        .get_run("jobs", first.run_id)
        .await
        .expect("get_run")
        .expect("run exists");
    assert_eq!(run.state, RunState::Running);
    assert_eq!(run.claimed_by.as_deref(), Some("w1"));
    assert!(run.claim_expires_at.is_some());
    assert!(run.started_at.is_some());

    let task = store
        .get_task("jobs", first.task_id)
        .await
        .expect("get_task")
        .expect("task exists");
    assert_eq!(task.state, TaskState::Running);
    assert!(task.first_started_at.is_some());

    db.teardown().await;
}

#[tokio::test]
async fn run_after_is_not_claimable_early() {
    let (store, db) = pg_store("jobs").await;

    let mut delayed = new_task("delayed");
    delayed.start = StartTime::After(Duration::from_secs(1));
    store.spawn_task("jobs", &delayed).await.expect("spawn");

    let early = store
        .claim_tasks("jobs", 1, LONG_TIMEOUT, "w1")
        .await
        .expect("claim");
    assert!(early.is_empty(), "delayed run must not be claimable yet");

    tokio::time::sleep(Duration::from_millis(1300)).await;

    let due = store
        .claim_tasks("jobs", 1, LONG_TIMEOUT, "w1")
        .await
        .expect("claim");
    assert_eq!(due.len(), 1);

    db.teardown().await;
}

#[tokio::test]
async fn clock_override_controls_eligibility() {
    mule_test_utils::init_tracing();
    let db = mule_test_utils::TestDb::create().await;

    // The `mule.now` override is session-scoped, so run everything on a
    // single connection.
    let single = db.single_connection().await;
    let store = PgTaskStore::new(single.clone());
    store.create_queue("jobs").await.expect("create_queue");

    let mut delayed = new_task("delayed");
    delayed.start = StartTime::After(Duration::from_secs(3600));
    store.spawn_task("jobs", &delayed).await.expect("spawn");

    let early = store
        .claim_tasks("jobs", 1, LONG_TIMEOUT, "w1")
        .await
        .expect("claim");
    assert!(early.is_empty());

    // Jump the datastore clock two hours ahead.
    mule_store::pool::override_now(&single, Some(chrono::Utc::now() + chrono::Duration::hours(2)))
        .await
        .expect("override");

    let due = store
        .claim_tasks("jobs", 1, LONG_TIMEOUT, "w1")
        .await
        .expect("claim");
    assert_eq!(due.len(), 1);

    mule_store::pool::override_now(&single, None)
        .await
        .expect("clear override");

    db.teardown().await;
}

#[tokio::test]
async fn extend_claim_keeps_ownership() {
    let (store, db) = pg_store("jobs").await;

    let spawned = store.spawn_task("jobs", &new_task("t")).await.expect("spawn");
    let claimed = store
        .claim_tasks("jobs", 1, LONG_TIMEOUT, "w1")
        .await
        .expect("claim");
    assert_eq!(claimed.len(), 1);

    let outcome = store
        .extend_claim("jobs", spawned.run_id, "w1", LONG_TIMEOUT)
        .await
        .expect("extend");
    assert_eq!(outcome, ExtendOutcome::Extended);

    // A different worker cannot extend someone else's claim.
    let outcome = store
        .extend_claim("jobs", spawned.run_id, "w2", LONG_TIMEOUT)
        .await
        .expect("extend");
    assert_eq!(outcome, ExtendOutcome::NotOwner);

    db.teardown().await;
}

#[tokio::test]
async fn expired_claim_is_taken_over() {
    let (store, db) = pg_store("jobs").await;

    let spawned = store.spawn_task("jobs", &new_task("t")).await.expect("spawn");

    let short = Duration::from_secs(1);
    let claimed = store
        .claim_tasks("jobs", 1, short, "w1")
        .await
        .expect("claim");
    assert_eq!(claimed.len(), 1);

    // While the claim is live, other workers see nothing.
    let contended = store
        .claim_tasks("jobs", 1, short, "w2")
        .await
        .expect("claim");
    assert!(contended.is_empty());

    tokio::time::sleep(Duration::from_millis(1300)).await;

    let taken_over = store
        .claim_tasks("jobs", 1, LONG_TIMEOUT, "w2")
        .await
        .expect("claim");
    assert_eq!(taken_over.len(), 1);
    assert_eq!(taken_over[0].run_id, spawned.run_id);

    // The original worker has lost the claim.
    let outcome = store
        .extend_claim("jobs", spawned.run_id, "w1", short)
        .await
        .expect("extend");
    assert_eq!(outcome, ExtendOutcome::NotOwner);

    // And cannot record outcomes for it either.
    let completed = store
        .complete_run("jobs", spawned.run_id, "w1", &json!("stale"))
        .await
        .expect("complete");
    assert_eq!(completed, mule_store::CompleteOutcome::NotOwner);

    db.teardown().await;
}
