//! Engine integration tests over the in-memory store: step checkpointing,
//! retries, suspension on events and timers, and spawn validation.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde_json::{Value, json};

use mule_core::{
    Error, HandlerError, Mule, RunState, SpawnOptions, TaskConfig, TaskState,
};
use mule_store::{MemTaskStore, RetryStrategy};

const CLAIM_TIMEOUT: Duration = Duration::from_secs(60);

async fn mem_client() -> (Mule, Arc<MemTaskStore>) {
    let store = Arc::new(MemTaskStore::new());
    let mule = Mule::new(store.clone(), "q");
    mule.create_queue("q").await.expect("create_queue");
    (mule, store)
}

#[derive(serde::Deserialize)]
struct ValueParams {
    value: i64,
}

#[tokio::test]
async fn double_step_completes_with_checkpoint() {
    let (mule, store) = mem_client().await;

    mule.register_task(TaskConfig::new("double"), |params: ValueParams, ctx| async move {
        let value = params.value;
        let doubled: i64 = ctx.step("double", || async move { Ok(value * 2) }).await?;
        Ok(json!({ "doubled": doubled }))
    });

    let spawned = mule
        .spawn("double", json!({ "value": 21 }), SpawnOptions::default())
        .await
        .expect("spawn");

    let processed = mule
        .work_batch("w1", CLAIM_TIMEOUT, 1)
        .await
        .expect("work_batch");
    assert_eq!(processed, 1);

    let task = mule
        .get_task(spawned.task_id)
        .await
        .expect("get_task")
        .expect("task exists");
    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(task.completed_payload, Some(json!({ "doubled": 42 })));
    assert_eq!(task.attempts, 1);

    let checkpoints = store.checkpoints("q", spawned.task_id);
    assert_eq!(checkpoints.len(), 1);
    assert_eq!(checkpoints[0].name, "double");
    assert_eq!(checkpoints[0].state, json!(42));
}

#[tokio::test]
async fn retry_reuses_cached_step() {
    let (mule, store) = mem_client().await;

    let executions = Arc::new(AtomicU32::new(0));
    let body_count = Arc::clone(&executions);
    mule.register_task(
        TaskConfig::new("flaky").default_max_attempts(2),
        move |_params: Value, ctx| {
            let body_count = Arc::clone(&body_count);
            async move {
                let generated: u32 = ctx
                    .step("gen", || async move {
                        Ok(body_count.fetch_add(1, Ordering::SeqCst) + 1)
                    })
                    .await?;
                if ctx.attempt() == 1 {
                    return Err(HandlerError::msg("first attempt goes down"));
                }
                Ok(json!({ "generated": generated }))
            }
        },
    );

    let spawned = mule
        .spawn("flaky", json!({}), SpawnOptions::default())
        .await
        .expect("spawn");

    assert_eq!(mule.work_batch("w1", CLAIM_TIMEOUT, 1).await.expect("batch 1"), 1);

    // The retry run is backed off; move the store clock past it.
    store.advance(Duration::from_secs(2));
    assert_eq!(mule.work_batch("w1", CLAIM_TIMEOUT, 1).await.expect("batch 2"), 1);

    let task = mule
        .get_task(spawned.task_id)
        .await
        .expect("get_task")
        .expect("task exists");
    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(task.attempts, 2);
    assert_eq!(task.completed_payload, Some(json!({ "generated": 1 })));

    // The step body ran exactly once across both attempts.
    assert_eq!(executions.load(Ordering::SeqCst), 1);
    assert_eq!(store.checkpoints("q", spawned.task_id).len(), 1);
}

#[tokio::test]
async fn partial_retry_skips_completed_steps() {
    let (mule, store) = mem_client().await;

    let executed: Arc<std::sync::Mutex<Vec<String>>> = Arc::default();
    let log = Arc::clone(&executed);
    mule.register_task(
        TaskConfig::new("three-steps").default_max_attempts(2),
        move |_params: Value, ctx| {
            let log = Arc::clone(&log);
            async move {
                let record = |name: &'static str| {
                    let log = Arc::clone(&log);
                    async move {
                        log.lock().expect("lock").push(name.to_owned());
                        Ok(name.to_owned())
                    }
                };
                let s1: String = ctx.step("s1", || record("s1")).await?;
                let s2: String = ctx.step("s2", || record("s2")).await?;
                if ctx.attempt() == 1 {
                    return Err(HandlerError::msg("crash between s2 and s3"));
                }
                let s3: String = ctx.step("s3", || record("s3")).await?;
                Ok(json!({ "combined": format!("{s1}+{s2}+{s3}") }))
            }
        },
    );

    let spawned = mule
        .spawn("three-steps", json!({}), SpawnOptions::default())
        .await
        .expect("spawn");

    mule.work_batch("w1", CLAIM_TIMEOUT, 1).await.expect("batch 1");
    store.advance(Duration::from_secs(2));
    mule.work_batch("w1", CLAIM_TIMEOUT, 1).await.expect("batch 2");

    // s1 and s2 ran on attempt 1 only; the retry hit their checkpoints and
    // executed just s3.
    assert_eq!(
        *executed.lock().expect("lock"),
        vec!["s1".to_owned(), "s2".to_owned(), "s3".to_owned()]
    );

    let names: Vec<String> = store
        .checkpoints("q", spawned.task_id)
        .into_iter()
        .map(|c| c.name)
        .collect();
    assert_eq!(names, vec!["s1", "s2", "s3"]);

    let task = mule
        .get_task(spawned.task_id)
        .await
        .expect("get_task")
        .expect("task exists");
    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(
        task.completed_payload,
        Some(json!({ "combined": "s1+s2+s3" }))
    );
}

#[tokio::test]
async fn repeated_step_names_get_suffixes() {
    let (mule, store) = mem_client().await;

    mule.register_task(TaskConfig::new("looper"), |_params: Value, ctx| async move {
        let mut results = Vec::new();
        for i in 0..3i64 {
            let value: i64 = ctx.step("loop", || async move { Ok(i * 10) }).await?;
            results.push(value);
        }
        Ok(json!({ "results": results }))
    });

    let spawned = mule
        .spawn("looper", json!({}), SpawnOptions::default())
        .await
        .expect("spawn");
    mule.work_batch("w1", CLAIM_TIMEOUT, 1).await.expect("batch");

    let checkpoints = store.checkpoints("q", spawned.task_id);
    let names: Vec<&str> = checkpoints.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["loop", "loop#2", "loop#3"]);
    let states: Vec<&Value> = checkpoints.iter().map(|c| &c.state).collect();
    assert_eq!(states, vec![&json!(0), &json!(10), &json!(20)]);

    let task = mule
        .get_task(spawned.task_id)
        .await
        .expect("get_task")
        .expect("task exists");
    assert_eq!(
        task.completed_payload,
        Some(json!({ "results": [0, 10, 20] }))
    );
}

#[tokio::test]
async fn event_cached_before_await_is_consumed() {
    let (mule, _store) = mem_client().await;

    mule.register_task(TaskConfig::new("receiver"), |_params: Value, ctx| async move {
        let payload = ctx.await_event("e").await?;
        Ok(json!({ "received": payload }))
    });

    mule.emit_event("e", json!({ "data": "cached" }))
        .await
        .expect("emit");

    let spawned = mule
        .spawn("receiver", json!({}), SpawnOptions::default())
        .await
        .expect("spawn");
    mule.work_batch("w1", CLAIM_TIMEOUT, 1).await.expect("batch");

    let task = mule
        .get_task(spawned.task_id)
        .await
        .expect("get_task")
        .expect("task exists");
    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(
        task.completed_payload,
        Some(json!({ "received": { "data": "cached" } }))
    );
}

#[tokio::test]
async fn event_after_suspension_resumes_run() {
    let (mule, _store) = mem_client().await;

    mule.register_task(TaskConfig::new("receiver"), |_params: Value, ctx| async move {
        let payload = ctx.await_event("e").await?;
        Ok(json!({ "received": payload }))
    });

    let spawned = mule
        .spawn("receiver", json!({}), SpawnOptions::default())
        .await
        .expect("spawn");

    mule.work_batch("w1", CLAIM_TIMEOUT, 1).await.expect("batch 1");

    let task = mule
        .get_task(spawned.task_id)
        .await
        .expect("get_task")
        .expect("task exists");
    assert_eq!(task.state, TaskState::Sleeping);
    let run = mule
        .get_run(spawned.run_id)
        .await
        .expect("get_run")
        .expect("run exists");
    assert_eq!(run.state, RunState::Sleeping);
    assert_eq!(run.wake_event.as_deref(), Some("e"));

    mule.emit_event("e", json!({ "eventInput": 0.42 }))
        .await
        .expect("emit");

    mule.work_batch("w1", CLAIM_TIMEOUT, 1).await.expect("batch 2");

    let task = mule
        .get_task(spawned.task_id)
        .await
        .expect("get_task")
        .expect("task exists");
    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(
        task.completed_payload,
        Some(json!({ "received": { "eventInput": 0.42 } }))
    );
    // Still a single run: suspension and resume reuse it.
    assert_eq!(task.attempts, 1);
}

#[tokio::test]
async fn sleep_parks_and_resumes_once_elapsed() {
    let (mule, store) = mem_client().await;

    let body_runs = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&body_runs);
    mule.register_task(TaskConfig::new("napper"), move |_params: Value, ctx| {
        let counter = Arc::clone(&counter);
        async move {
            let before: u32 = ctx
                .step("before", || async move {
                    Ok(counter.fetch_add(1, Ordering::SeqCst) + 1)
                })
                .await?;
            ctx.sleep(Duration::from_secs(30)).await?;
            Ok(json!({ "before": before }))
        }
    });

    let spawned = mule
        .spawn("napper", json!({}), SpawnOptions::default())
        .await
        .expect("spawn");

    mule.work_batch("w1", CLAIM_TIMEOUT, 1).await.expect("batch 1");
    let task = mule
        .get_task(spawned.task_id)
        .await
        .expect("get_task")
        .expect("task exists");
    assert_eq!(task.state, TaskState::Sleeping);

    // Not claimable until the delay elapses.
    assert_eq!(mule.work_batch("w1", CLAIM_TIMEOUT, 1).await.expect("batch"), 0);

    store.advance(Duration::from_secs(31));
    assert_eq!(mule.work_batch("w1", CLAIM_TIMEOUT, 1).await.expect("batch"), 1);

    let task = mule
        .get_task(spawned.task_id)
        .await
        .expect("get_task")
        .expect("task exists");
    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(task.attempts, 1);
    // The step before the sleep was not re-executed on resume.
    assert_eq!(body_runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn terminal_failure_records_reason() {
    let (mule, _store) = mem_client().await;

    mule.register_task(TaskConfig::new("doomed"), |_params: Value, _ctx| async move {
        Err::<Value, _>(HandlerError::msg("boom"))
    });

    let spawned = mule
        .spawn("doomed", json!({}), SpawnOptions::default())
        .await
        .expect("spawn");
    mule.work_batch("w1", CLAIM_TIMEOUT, 1).await.expect("batch");

    let task = mule
        .get_task(spawned.task_id)
        .await
        .expect("get_task")
        .expect("task exists");
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.attempts, 1);

    let run = mule
        .get_run(spawned.run_id)
        .await
        .expect("get_run")
        .expect("run exists");
    assert_eq!(run.state, RunState::Failed);
    let reason = run.failure_reason.expect("failure reason recorded");
    assert_eq!(reason.0.message, "boom");
}

#[tokio::test]
async fn run_after_delays_execution() {
    let (mule, store) = mem_client().await;

    mule.register_task(TaskConfig::new("later"), |_params: Value, _ctx| async move {
        Ok(json!("done"))
    });

    mule.spawn(
        "later",
        json!({}),
        SpawnOptions::default().run_after(Duration::from_secs(60)),
    )
    .await
    .expect("spawn");

    assert_eq!(mule.work_batch("w1", CLAIM_TIMEOUT, 1).await.expect("batch"), 0);

    store.advance(Duration::from_secs(61));
    assert_eq!(mule.work_batch("w1", CLAIM_TIMEOUT, 1).await.expect("batch"), 1);
}

#[tokio::test]
async fn run_at_takes_precedence_over_run_after() {
    let (mule, _store) = mem_client().await;

    mule.register_task(TaskConfig::new("timed"), |_params: Value, _ctx| async move {
        Ok(json!("done"))
    });

    // run_at in the past wins over a huge run_after.
    mule.spawn(
        "timed",
        json!({}),
        SpawnOptions::default()
            .run_at(chrono::Utc::now() - chrono::Duration::seconds(1))
            .run_after(Duration::from_secs(3600)),
    )
    .await
    .expect("spawn");

    assert_eq!(mule.work_batch("w1", CLAIM_TIMEOUT, 1).await.expect("batch"), 1);
}

#[tokio::test]
async fn retry_backoff_respects_fixed_strategy() {
    let (mule, store) = mem_client().await;

    mule.register_task(
        TaskConfig::new("flaky").default_max_attempts(2),
        |_params: Value, ctx| async move {
            if ctx.attempt() == 1 {
                return Err(HandlerError::msg("transient"));
            }
            Ok(json!("recovered"))
        },
    );

    let spawned = mule
        .spawn(
            "flaky",
            json!({}),
            SpawnOptions::default().retry_strategy(RetryStrategy::Fixed { seconds: 120.0 }),
        )
        .await
        .expect("spawn");

    mule.work_batch("w1", CLAIM_TIMEOUT, 1).await.expect("batch 1");

    // The retry is parked two minutes out.
    assert_eq!(mule.work_batch("w1", CLAIM_TIMEOUT, 1).await.expect("batch"), 0);
    store.advance(Duration::from_secs(121));
    assert_eq!(mule.work_batch("w1", CLAIM_TIMEOUT, 1).await.expect("batch"), 1);

    let task = mule
        .get_task(spawned.task_id)
        .await
        .expect("get_task")
        .expect("task exists");
    assert_eq!(task.state, TaskState::Completed);
}

#[tokio::test]
async fn spawn_child_is_recorded_through_a_step() {
    let (mule, _store) = mem_client().await;

    mule.register_task(TaskConfig::new("child"), |params: ValueParams, _ctx| async move {
        Ok(json!({ "echo": params.value }))
    });
    mule.register_task(TaskConfig::new("parent"), |_params: Value, ctx| async move {
        let child_ctx = ctx.clone();
        let child = ctx
            .step("spawn-child", || async move {
                child_ctx
                    .spawn_child("child", json!({ "value": 7 }), SpawnOptions::default())
                    .await
            })
            .await?;
        Ok(json!({ "child_task_id": child.task_id }))
    });

    let spawned = mule
        .spawn("parent", json!({}), SpawnOptions::default())
        .await
        .expect("spawn");

    // Parent first, child on the next poll.
    assert_eq!(mule.work_batch("w1", CLAIM_TIMEOUT, 4).await.expect("batch"), 1);
    assert_eq!(mule.work_batch("w1", CLAIM_TIMEOUT, 4).await.expect("batch"), 1);

    let parent = mule
        .get_task(spawned.task_id)
        .await
        .expect("get_task")
        .expect("task exists");
    assert_eq!(parent.state, TaskState::Completed);

    let child_id: uuid::Uuid = serde_json::from_value(
        parent.completed_payload.expect("payload")["child_task_id"].clone(),
    )
    .expect("child id");
    let child = mule
        .get_task(child_id)
        .await
        .expect("get_task")
        .expect("child exists");
    assert_eq!(child.state, TaskState::Completed);
    assert_eq!(child.completed_payload, Some(json!({ "echo": 7 })));
}

#[tokio::test]
async fn cancel_prevents_execution() {
    let (mule, _store) = mem_client().await;

    mule.register_task(TaskConfig::new("cancellable"), |_params: Value, _ctx| async move {
        Ok(json!("ran"))
    });

    let spawned = mule
        .spawn(
            "cancellable",
            json!({}),
            SpawnOptions::default().run_after(Duration::from_secs(60)),
        )
        .await
        .expect("spawn");

    assert!(mule.cancel_task(spawned.task_id).await.expect("cancel"));

    let task = mule
        .get_task(spawned.task_id)
        .await
        .expect("get_task")
        .expect("task exists");
    assert_eq!(task.state, TaskState::Cancelled);
    assert!(task.cancelled_at.is_some());

    // Cancelling again is a no-op.
    assert!(!mule.cancel_task(spawned.task_id).await.expect("cancel"));
    assert_eq!(mule.work_batch("w1", CLAIM_TIMEOUT, 1).await.expect("batch"), 0);
}

#[tokio::test]
async fn spawn_validation() {
    let (mule, _store) = mem_client().await;

    // Unregistered without a queue is rejected.
    let err = mule
        .spawn("mystery", json!({}), SpawnOptions::default())
        .await
        .expect_err("should fail");
    assert!(matches!(err, Error::UnregisteredTask { .. }));

    // Unregistered with an explicit queue is allowed (producer-only process).
    mule.spawn("mystery", json!({}), SpawnOptions::default().on_queue("q"))
        .await
        .expect("explicit queue spawn");

    // A bound task cannot be spawned onto a different queue.
    mule.register_task(
        TaskConfig::new("bound").on_queue("q"),
        |_params: Value, _ctx| async move { Ok(json!(())) },
    );
    let err = mule
        .spawn("bound", json!({}), SpawnOptions::default().on_queue("other"))
        .await
        .expect_err("should fail");
    assert!(matches!(err, Error::QueueMismatch { .. }));

    // max_attempts below 1 is invalid.
    mule.register_task(TaskConfig::new("ok"), |_params: Value, _ctx| async move {
        Ok(json!(()))
    });
    let err = mule
        .spawn("ok", json!({}), SpawnOptions::default().max_attempts(0))
        .await
        .expect_err("should fail");
    assert!(matches!(err, Error::InvalidOptions(_)));
}

#[tokio::test]
async fn claim_then_execute_one_shot() {
    let (mule, _store) = mem_client().await;

    mule.register_task(TaskConfig::new("double"), |params: ValueParams, ctx| async move {
        let value = params.value;
        let doubled: i64 = ctx.step("double", || async move { Ok(value * 2) }).await?;
        Ok(json!({ "doubled": doubled }))
    });

    let spawned = mule
        .spawn("double", json!({ "value": 5 }), SpawnOptions::default())
        .await
        .expect("spawn");

    let claimed = mule
        .claim_tasks(&mule_core::ClaimOptions::new(5, CLAIM_TIMEOUT, "w1"))
        .await
        .expect("claim");
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].task_id, spawned.task_id);
    assert_eq!(claimed[0].task_name, "double");
    assert_eq!(claimed[0].params, json!({ "value": 5 }));

    mule.execute_task(&claimed[0], "w1", CLAIM_TIMEOUT)
        .await
        .expect("execute");

    let task = mule
        .get_task(spawned.task_id)
        .await
        .expect("get_task")
        .expect("task exists");
    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(task.completed_payload, Some(json!({ "doubled": 10 })));
}

#[tokio::test]
async fn unknown_ids_return_none() {
    let (mule, _store) = mem_client().await;
    assert!(mule.get_task(uuid::Uuid::new_v4()).await.expect("get").is_none());
    assert!(mule.get_run(uuid::Uuid::new_v4()).await.expect("get").is_none());
}

#[tokio::test]
async fn unregistered_claimed_task_fails() {
    let (mule, _store) = mem_client().await;

    // Spawned with an explicit queue, never registered on this worker.
    let spawned = mule
        .spawn("ghost", json!({}), SpawnOptions::default().on_queue("q"))
        .await
        .expect("spawn");

    assert_eq!(mule.work_batch("w1", CLAIM_TIMEOUT, 1).await.expect("batch"), 1);

    let task = mule
        .get_task(spawned.task_id)
        .await
        .expect("get_task")
        .expect("task exists");
    assert_eq!(task.state, TaskState::Failed);

    let run = mule
        .get_run(spawned.run_id)
        .await
        .expect("get_run")
        .expect("run exists");
    let reason = run.failure_reason.expect("failure reason");
    assert!(reason.0.message.contains("not registered"));
}
