//! Execution engine: runs one claimed task through its handler and
//! translates the handler's outcome into durable state.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tracing::{debug, info, warn};

use mule_store::{ClaimedTask, CompleteOutcome, FailOutcome, FailureReason, TaskStore};

use crate::context::TaskContext;
use crate::error::HandlerError;
use crate::lease::ClaimLease;
use crate::registry::TaskRegistry;

/// How many times durable outcome writes (complete/fail) are attempted
/// before the run is abandoned.
const WRITE_ATTEMPTS: u32 = 3;
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(200);

/// What happened to a claimed run.
#[derive(Debug)]
pub enum RunOutcome {
    /// Handler returned; result persisted, task completed.
    Completed,
    /// Handler suspended; the run is parked in the datastore.
    Suspended,
    /// Handler failed and a retry run was enqueued.
    FailedWillRetry(FailureReason),
    /// Handler failed and the task is now terminally failed.
    FailedExhausted(FailureReason),
    /// The claim was lost; nothing was written and another worker owns
    /// the run now.
    LeaseLost,
    /// A datastore error prevented recording the outcome; the run is left
    /// to lease expiry.
    Abandoned(anyhow::Error),
}

/// Execute one claimed run.
///
/// `heartbeat` controls whether a [`ClaimLease`] extends the claim while
/// the handler runs; one-shot batch execution passes `false`.
pub async fn execute_claimed(
    store: &Arc<dyn TaskStore>,
    registry: &Arc<RwLock<TaskRegistry>>,
    queue: &str,
    claimed: &ClaimedTask,
    worker_id: &str,
    claim_timeout: Duration,
    heartbeat: bool,
) -> RunOutcome {
    debug!(
        task_id = %claimed.task_id,
        run_id = %claimed.run_id,
        task_name = %claimed.task_name,
        attempt = claimed.attempt,
        "executing claimed run"
    );

    let registered = {
        let registry = registry.read().unwrap_or_else(PoisonError::into_inner);
        registry.get(&claimed.task_name).cloned()
    };
    let Some(registered) = registered else {
        warn!(
            task_id = %claimed.task_id,
            task_name = %claimed.task_name,
            "claimed task is not registered on this worker"
        );
        let reason = FailureReason::new(format!(
            "task {:?} is not registered",
            claimed.task_name
        ));
        return record_failure(store, queue, claimed, worker_id, reason).await;
    };

    let lease = heartbeat.then(|| {
        ClaimLease::spawn(
            Arc::clone(store),
            queue.to_owned(),
            claimed.run_id,
            worker_id.to_owned(),
            claim_timeout,
        )
    });

    let ctx = TaskContext::new(
        Arc::clone(store),
        queue,
        claimed.task_id,
        claimed.run_id,
        claimed.attempt,
        worker_id,
    );
    let handler_fut = (registered.handler)(claimed.params.clone(), ctx);

    let handler_result = match &lease {
        Some(lease) => {
            tokio::select! {
                result = handler_fut => Some(result),
                _ = lease.lost() => None,
            }
        }
        None => Some(handler_fut.await),
    };

    let outcome = match handler_result {
        None => {
            warn!(
                run_id = %claimed.run_id,
                task_name = %claimed.task_name,
                "abandoning run after fatal lease loss"
            );
            RunOutcome::LeaseLost
        }
        Some(Ok(value)) => {
            let written = with_write_retries("complete_run", || {
                store.complete_run(queue, claimed.run_id, worker_id, &value)
            })
            .await;
            match written {
                Ok(CompleteOutcome::Completed) => {
                    info!(
                        task_id = %claimed.task_id,
                        task_name = %claimed.task_name,
                        attempt = claimed.attempt,
                        "task completed"
                    );
                    RunOutcome::Completed
                }
                Ok(CompleteOutcome::NotOwner) => RunOutcome::LeaseLost,
                Err(e) => RunOutcome::Abandoned(e),
            }
        }
        Some(Err(HandlerError::Suspended(suspension))) => {
            debug!(
                task_id = %claimed.task_id,
                run_id = %claimed.run_id,
                suspension = ?suspension,
                "run suspended"
            );
            RunOutcome::Suspended
        }
        Some(Err(HandlerError::Adapter(e))) => {
            warn!(
                run_id = %claimed.run_id,
                error = %e,
                "datastore error during execution, abandoning run"
            );
            RunOutcome::Abandoned(e)
        }
        Some(Err(HandlerError::Failed(e))) => {
            let reason = FailureReason {
                message: format!("{e:#}"),
                stack: Some(format!("{e:?}")),
            };
            record_failure(store, queue, claimed, worker_id, reason).await
        }
    };

    if let Some(lease) = lease {
        lease.stop().await;
    }

    outcome
}

/// Persist a run failure and classify the result.
async fn record_failure(
    store: &Arc<dyn TaskStore>,
    queue: &str,
    claimed: &ClaimedTask,
    worker_id: &str,
    reason: FailureReason,
) -> RunOutcome {
    let written = with_write_retries("fail_run", || {
        store.fail_run(queue, claimed.run_id, worker_id, &reason)
    })
    .await;

    match written {
        Ok(FailOutcome::Retrying { attempt, .. }) => {
            info!(
                task_id = %claimed.task_id,
                task_name = %claimed.task_name,
                failed_attempt = claimed.attempt,
                next_attempt = attempt,
                "run failed, retry enqueued"
            );
            RunOutcome::FailedWillRetry(reason)
        }
        Ok(FailOutcome::Exhausted) => {
            warn!(
                task_id = %claimed.task_id,
                task_name = %claimed.task_name,
                attempt = claimed.attempt,
                "run failed with no attempts left, task failed"
            );
            RunOutcome::FailedExhausted(reason)
        }
        Ok(FailOutcome::NotOwner) => RunOutcome::LeaseLost,
        Err(e) => RunOutcome::Abandoned(e),
    }
}

/// Retry a durable outcome write a few times before giving up.
async fn with_write_retries<T, F, Fut>(op: &str, mut write: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<T>>,
{
    for attempt in 1..WRITE_ATTEMPTS {
        match write().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                warn!(op, attempt, error = %e, "outcome write failed, retrying");
                tokio::time::sleep(WRITE_RETRY_DELAY).await;
            }
        }
    }
    write().await
}
