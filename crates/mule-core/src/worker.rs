//! Worker loop: polls for claims, dispatches them to the engine with
//! bounded concurrency, and coordinates graceful shutdown.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use mule_store::{ClaimedTask, TaskStore};

use crate::engine::{RunOutcome, execute_claimed};
use crate::error::ErrorContext;
use crate::registry::TaskRegistry;

/// Hook invoked with every error the worker surfaces.
pub type ErrorHook = Arc<dyn Fn(anyhow::Error, Option<ErrorContext>) + Send + Sync>;

/// Worker configuration.
#[derive(Clone)]
pub struct WorkerConfig {
    /// Maximum number of runs executing at once.
    pub concurrency: usize,
    /// How long to sleep when a poll returns nothing.
    pub poll_interval: Duration,
    /// Claim duration requested on every claim and lease extension.
    pub claim_timeout: Duration,
    /// Shut the worker down after a fatal lease loss.
    pub fatal_on_lease_timeout: bool,
    /// Worker identity; generated when absent.
    pub worker_id: Option<String>,
    /// Error sink. Errors are logged when no hook is installed.
    pub on_error: Option<ErrorHook>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            poll_interval: Duration::from_secs(1),
            claim_timeout: Duration::from_secs(60),
            fatal_on_lease_timeout: true,
            worker_id: None,
            on_error: None,
        }
    }
}

impl std::fmt::Debug for WorkerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerConfig")
            .field("concurrency", &self.concurrency)
            .field("poll_interval", &self.poll_interval)
            .field("claim_timeout", &self.claim_timeout)
            .field("fatal_on_lease_timeout", &self.fatal_on_lease_timeout)
            .field("worker_id", &self.worker_id)
            .field("on_error", &self.on_error.as_ref().map(|_| "..."))
            .finish()
    }
}

/// Handle to a running worker.
pub struct Worker {
    worker_id: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Worker {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Stop polling, wait for in-flight runs to reach a terminal or
    /// suspended state, and return.
    pub async fn close(self) -> anyhow::Result<()> {
        self.cancel.cancel();
        self.handle
            .await
            .map_err(|e| anyhow::anyhow!("worker task panicked: {e}"))?;
        Ok(())
    }
}

/// Start the worker loop on a background task.
pub(crate) fn start(
    store: Arc<dyn TaskStore>,
    registry: Arc<RwLock<TaskRegistry>>,
    queue: String,
    config: WorkerConfig,
) -> Worker {
    let worker_id = config
        .worker_id
        .clone()
        .unwrap_or_else(|| format!("worker-{}", Uuid::new_v4().simple()));
    let cancel = CancellationToken::new();

    let handle = tokio::spawn(run_loop(
        store,
        registry,
        queue,
        worker_id.clone(),
        config,
        cancel.clone(),
    ));

    Worker {
        worker_id,
        cancel,
        handle,
    }
}

/// Message sent from spawned run executions back to the loop.
struct RunDone {
    claimed: ClaimedTask,
    outcome: RunOutcome,
}

async fn run_loop(
    store: Arc<dyn TaskStore>,
    registry: Arc<RwLock<TaskRegistry>>,
    queue: String,
    worker_id: String,
    config: WorkerConfig,
    cancel: CancellationToken,
) {
    info!(
        worker_id = %worker_id,
        queue = %queue,
        concurrency = config.concurrency,
        "worker started"
    );

    let concurrency = config.concurrency.max(1);
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let (tx, mut rx) = mpsc::channel::<RunDone>(concurrency * 2);
    let mut in_flight: usize = 0;

    while !cancel.is_cancelled() {
        // Drain finished runs without blocking.
        while let Ok(done) = rx.try_recv() {
            in_flight -= 1;
            handle_done(done, &config, &cancel, &worker_id);
        }
        if cancel.is_cancelled() {
            break;
        }

        // Poll for new work when there is capacity.
        let free = concurrency.saturating_sub(in_flight);
        let mut claimed_any = false;
        if free > 0 {
            match store
                .claim_tasks(&queue, free as u32, config.claim_timeout, &worker_id)
                .await
            {
                Ok(claims) => {
                    claimed_any = !claims.is_empty();
                    for claimed in claims {
                        let Ok(permit) = semaphore.clone().acquire_owned().await else {
                            break;
                        };
                        in_flight += 1;

                        let store = Arc::clone(&store);
                        let registry = Arc::clone(&registry);
                        let queue = queue.clone();
                        let worker_id = worker_id.clone();
                        let claim_timeout = config.claim_timeout;
                        let tx = tx.clone();

                        tokio::spawn(async move {
                            let outcome = execute_claimed(
                                &store,
                                &registry,
                                &queue,
                                &claimed,
                                &worker_id,
                                claim_timeout,
                                true,
                            )
                            .await;
                            drop(permit);
                            let _ = tx.send(RunDone { claimed, outcome }).await;
                        });
                    }
                }
                Err(e) => {
                    report(
                        &config,
                        e.context("failed to claim tasks"),
                        None,
                    );
                }
            }
        }

        // Wait for something to happen: a result, the next poll, or close.
        if in_flight > 0 {
            tokio::select! {
                done = rx.recv() => {
                    if let Some(done) = done {
                        in_flight -= 1;
                        handle_done(done, &config, &cancel, &worker_id);
                    }
                }
                _ = tokio::time::sleep(config.poll_interval), if in_flight < concurrency => {}
                _ = cancel.cancelled() => {}
            }
        } else if !claimed_any {
            tokio::select! {
                _ = tokio::time::sleep(config.poll_interval) => {}
                _ = cancel.cancelled() => {}
            }
        }
    }

    // Drain: wait for in-flight runs to finish before returning.
    debug!(worker_id = %worker_id, in_flight, "worker draining");
    while in_flight > 0 {
        match rx.recv().await {
            Some(done) => {
                in_flight -= 1;
                handle_done(done, &config, &cancel, &worker_id);
            }
            None => break,
        }
    }

    info!(worker_id = %worker_id, "worker closed");
}

/// Route a finished run's outcome to logging, the error hook, and the
/// fatal-lease shutdown path.
fn handle_done(done: RunDone, config: &WorkerConfig, cancel: &CancellationToken, worker_id: &str) {
    let ctx = ErrorContext {
        task_id: done.claimed.task_id,
        run_id: done.claimed.run_id,
        task_name: done.claimed.task_name.clone(),
        attempt: done.claimed.attempt,
    };

    match done.outcome {
        RunOutcome::Completed | RunOutcome::Suspended => {}
        RunOutcome::FailedWillRetry(reason) | RunOutcome::FailedExhausted(reason) => {
            report(config, anyhow::anyhow!("{}", reason.message), Some(ctx));
        }
        RunOutcome::LeaseLost => {
            report(
                config,
                anyhow::anyhow!(
                    "claim lease lost for run {} (worker {worker_id})",
                    done.claimed.run_id
                ),
                Some(ctx),
            );
            if config.fatal_on_lease_timeout {
                error!(
                    worker_id = %worker_id,
                    run_id = %done.claimed.run_id,
                    "lease loss is fatal, shutting worker down"
                );
                cancel.cancel();
            }
        }
        RunOutcome::Abandoned(e) => {
            report(config, e.context("run abandoned"), Some(ctx));
        }
    }
}

fn report(config: &WorkerConfig, error: anyhow::Error, ctx: Option<ErrorContext>) {
    match &config.on_error {
        Some(hook) => hook(error, ctx),
        None => match &ctx {
            Some(ctx) => warn!(
                task_id = %ctx.task_id,
                run_id = %ctx.run_id,
                task_name = %ctx.task_name,
                attempt = ctx.attempt,
                error = %error,
                "worker error"
            ),
            None => warn!(error = %error, "worker error"),
        },
    }
}
