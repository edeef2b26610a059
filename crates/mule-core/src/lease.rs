//! Claim lease manager: keeps an in-flight run's claim alive and signals
//! the engine when the lease is fatally lost.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{trace, warn};
use uuid::Uuid;

use mule_store::{ExtendOutcome, TaskStore};

/// Periodic lease extension for one claimed run.
///
/// Extends at `claim_timeout / 3`. A `NotOwner` reply is an immediate
/// fatal loss; transient extend errors become fatal once the time since
/// the last successful extension leaves less than one interval of margin
/// before the claim lapses.
pub struct ClaimLease {
    stop: CancellationToken,
    lost: CancellationToken,
    handle: JoinHandle<()>,
}

impl ClaimLease {
    pub fn spawn(
        store: Arc<dyn TaskStore>,
        queue: String,
        run_id: Uuid,
        worker_id: String,
        claim_timeout: Duration,
    ) -> Self {
        let stop = CancellationToken::new();
        let lost = CancellationToken::new();

        let extend_interval = claim_timeout / 3;
        let safety_margin = extend_interval;

        let handle = tokio::spawn({
            let stop = stop.clone();
            let lost = lost.clone();
            async move {
                let mut ticker = tokio::time::interval(extend_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // The first tick fires immediately; the claim is fresh, so
                // skip it.
                ticker.tick().await;

                let mut last_extended = Instant::now();
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = ticker.tick() => {}
                    }

                    match store
                        .extend_claim(&queue, run_id, &worker_id, claim_timeout)
                        .await
                    {
                        Ok(ExtendOutcome::Extended) => {
                            last_extended = Instant::now();
                            trace!(run_id = %run_id, "claim extended");
                        }
                        Ok(ExtendOutcome::NotOwner) => {
                            warn!(
                                run_id = %run_id,
                                worker_id = %worker_id,
                                "claim no longer owned, lease lost"
                            );
                            lost.cancel();
                            break;
                        }
                        Err(e) => {
                            let since_success = last_extended.elapsed();
                            warn!(
                                run_id = %run_id,
                                error = %e,
                                since_success_ms = since_success.as_millis() as u64,
                                "claim extension failed"
                            );
                            if since_success >= claim_timeout.saturating_sub(safety_margin) {
                                warn!(
                                    run_id = %run_id,
                                    "claim presumed expired after repeated extension failures"
                                );
                                lost.cancel();
                                break;
                            }
                        }
                    }
                }
            }
        });

        Self { stop, lost, handle }
    }

    /// Resolves when the lease is fatally lost.
    pub fn lost(&self) -> WaitForCancellationFuture<'_> {
        self.lost.cancelled()
    }

    /// Whether the lease has been fatally lost.
    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }

    /// Stop extending and wait for the background task to finish.
    pub async fn stop(self) {
        self.stop.cancel();
        let _ = self.handle.await;
    }
}
