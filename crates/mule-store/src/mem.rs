//! In-memory implementation of [`TaskStore`].
//!
//! Mirrors the Postgres adapter's semantics closely enough to back engine
//! and worker tests without a database. Time is virtual: [`MemTaskStore::advance`]
//! moves the store clock forward, which is how tests exercise `run_after`,
//! sleeps, and retry backoff without waiting.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;
use sqlx::types::Json;
use uuid::Uuid;

use crate::models::{
    Checkpoint, ClaimedTask, FailureReason, NewTask, Run, RunState, SpawnedTask, StartTime, Task,
    TaskState,
};
use crate::queries::validate_queue_name;
use crate::store::{CompleteOutcome, EventWait, ExtendOutcome, FailOutcome, TaskStore};

#[derive(Debug, Clone)]
struct CachedEvent {
    id: u64,
    name: String,
    payload: Value,
}

#[derive(Debug, Clone)]
struct Waiter {
    run_id: Uuid,
    event_name: String,
    checkpoint_name: String,
}

#[derive(Debug, Default)]
struct MemQueue {
    tasks: HashMap<Uuid, Task>,
    runs: HashMap<Uuid, Run>,
    /// Insertion order of runs, for FIFO tie-breaking.
    run_seq: HashMap<Uuid, u64>,
    checkpoints: Vec<Checkpoint>,
    events: Vec<CachedEvent>,
    waiters: HashMap<Uuid, Waiter>,
    next_seq: u64,
    next_event_id: u64,
}

#[derive(Debug)]
struct Inner {
    queues: BTreeMap<String, MemQueue>,
    clock_offset: TimeDelta,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            queues: BTreeMap::new(),
            clock_offset: TimeDelta::zero(),
        }
    }
}

/// In-memory task store with a virtual clock.
#[derive(Debug, Default)]
pub struct MemTaskStore {
    inner: Mutex<Inner>,
}

impl MemTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the store clock. Affects availability, claim expiry, and
    /// backoff checks on subsequent calls.
    pub fn advance(&self, delta: Duration) {
        let mut inner = self.lock();
        inner.clock_offset += TimeDelta::from_std(delta).unwrap_or(TimeDelta::zero());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn now_of(inner: &Inner) -> DateTime<Utc> {
    Utc::now() + inner.clock_offset
}

fn queue_of<'a>(inner: &'a mut Inner, queue: &str) -> Result<&'a mut MemQueue> {
    inner
        .queues
        .get_mut(queue)
        .ok_or_else(|| anyhow::anyhow!("queue {queue:?} does not exist"))
}

fn delta_from_secs(seconds: f64) -> TimeDelta {
    TimeDelta::milliseconds((seconds * 1000.0) as i64)
}

/// Insert a checkpoint unless one with the same name exists. Returns
/// `true` on insert.
fn write_once(
    q: &mut MemQueue,
    task_id: Uuid,
    name: &str,
    state: &Value,
    owner_run_id: Uuid,
    now: DateTime<Utc>,
) -> bool {
    let exists = q
        .checkpoints
        .iter()
        .any(|c| c.task_id == task_id && c.name == name);
    if exists {
        return false;
    }
    q.checkpoints.push(Checkpoint {
        task_id,
        name: name.to_owned(),
        state: state.clone(),
        owner_run_id,
        updated_at: now,
    });
    true
}

#[async_trait]
impl TaskStore for MemTaskStore {
    async fn create_queue(&self, queue: &str) -> Result<()> {
        validate_queue_name(queue)?;
        let mut inner = self.lock();
        inner.queues.entry(queue.to_owned()).or_default();
        Ok(())
    }

    async fn drop_queue(&self, queue: &str) -> Result<()> {
        validate_queue_name(queue)?;
        let mut inner = self.lock();
        inner.queues.remove(queue);
        Ok(())
    }

    async fn list_queues(&self) -> Result<Vec<String>> {
        let inner = self.lock();
        Ok(inner.queues.keys().cloned().collect())
    }

    async fn spawn_task(&self, queue: &str, new: &NewTask) -> Result<SpawnedTask> {
        let mut inner = self.lock();
        let now = now_of(&inner);
        let q = queue_of(&mut inner, queue)?;

        let available_at = match new.start {
            StartTime::Immediate => now,
            StartTime::At(ts) => ts,
            StartTime::After(delay) => now + delta_from_secs(delay.as_secs_f64()),
        };

        let task_id = Uuid::new_v4();
        let run_id = Uuid::new_v4();

        q.tasks.insert(
            task_id,
            Task {
                id: task_id,
                name: new.name.clone(),
                params: new.params.clone(),
                headers: new.headers.clone(),
                retry_strategy: new.retry_strategy.clone().map(Json),
                max_attempts: new.max_attempts,
                cancellation: new.cancellation.clone(),
                state: TaskState::Pending,
                attempts: 1,
                created_at: now,
                first_started_at: None,
                last_run_id: Some(run_id),
                completed_payload: None,
                cancelled_at: None,
            },
        );
        q.runs.insert(
            run_id,
            Run {
                id: run_id,
                task_id,
                attempt: 1,
                state: RunState::Pending,
                claimed_by: None,
                claim_expires_at: None,
                available_at: Some(available_at),
                wake_event: None,
                event_payload: None,
                started_at: None,
                completed_at: None,
                failed_at: None,
                result: None,
                failure_reason: None,
                created_at: now,
            },
        );
        let seq = q.next_seq;
        q.next_seq += 1;
        q.run_seq.insert(run_id, seq);

        Ok(SpawnedTask {
            task_id,
            run_id,
            attempt: 1,
        })
    }

    async fn emit_event(&self, queue: &str, event_name: &str, payload: &Value) -> Result<()> {
        let mut inner = self.lock();
        let now = now_of(&inner);
        let q = queue_of(&mut inner, queue)?;

        let woken: Vec<(Uuid, Waiter)> = q
            .waiters
            .iter()
            .filter(|(_, w)| w.event_name == event_name)
            .map(|(task_id, w)| (*task_id, w.clone()))
            .collect();

        if woken.is_empty() {
            let id = q.next_event_id;
            q.next_event_id += 1;
            q.events.push(CachedEvent {
                id,
                name: event_name.to_owned(),
                payload: payload.clone(),
            });
            return Ok(());
        }

        for (task_id, waiter) in woken {
            q.waiters.remove(&task_id);
            write_once(q, task_id, &waiter.checkpoint_name, payload, waiter.run_id, now);
            if let Some(run) = q.runs.get_mut(&waiter.run_id) {
                if run.state == RunState::Sleeping {
                    run.state = RunState::Pending;
                    run.event_payload = Some(payload.clone());
                    run.available_at = Some(now);
                }
            }
            if let Some(task) = q.tasks.get_mut(&task_id) {
                if task.state == TaskState::Sleeping {
                    task.state = TaskState::Pending;
                }
            }
        }

        Ok(())
    }

    async fn claim_tasks(
        &self,
        queue: &str,
        batch_size: u32,
        claim_timeout: Duration,
        worker_id: &str,
    ) -> Result<Vec<ClaimedTask>> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }
        let mut inner = self.lock();
        let now = now_of(&inner);
        let q = queue_of(&mut inner, queue)?;

        let mut eligible: Vec<(DateTime<Utc>, u64, Uuid)> = q
            .runs
            .values()
            .filter(|run| {
                let task_live = q
                    .tasks
                    .get(&run.task_id)
                    .is_some_and(|t| !t.state.is_terminal());
                let due = matches!(run.state, RunState::Pending | RunState::Sleeping)
                    && run.available_at.is_some_and(|at| at <= now);
                let expired = run.state == RunState::Running
                    && run.claim_expires_at.is_some_and(|at| at <= now);
                task_live && (due || expired)
            })
            .map(|run| {
                let seq = q.run_seq.get(&run.id).copied().unwrap_or(u64::MAX);
                (run.available_at.unwrap_or(now), seq, run.id)
            })
            .collect();
        eligible.sort();
        eligible.truncate(batch_size as usize);

        let expires = now + delta_from_secs(claim_timeout.as_secs_f64());
        let mut claimed = Vec::with_capacity(eligible.len());
        for (_, _, run_id) in eligible {
            let Some(run) = q.runs.get_mut(&run_id) else {
                continue;
            };
            run.state = RunState::Running;
            run.claimed_by = Some(worker_id.to_owned());
            run.claim_expires_at = Some(expires);
            run.started_at.get_or_insert(now);
            let task_id = run.task_id;
            let attempt = run.attempt;

            let Some(task) = q.tasks.get_mut(&task_id) else {
                continue;
            };
            task.state = TaskState::Running;
            task.first_started_at.get_or_insert(now);
            task.last_run_id = Some(run_id);

            claimed.push(ClaimedTask {
                task_id,
                run_id,
                attempt,
                task_name: task.name.clone(),
                params: task.params.clone(),
                headers: task.headers.clone(),
            });
        }

        Ok(claimed)
    }

    async fn extend_claim(
        &self,
        queue: &str,
        run_id: Uuid,
        worker_id: &str,
        claim_timeout: Duration,
    ) -> Result<ExtendOutcome> {
        let mut inner = self.lock();
        let now = now_of(&inner);
        let q = queue_of(&mut inner, queue)?;

        let Some(run) = q.runs.get_mut(&run_id) else {
            return Ok(ExtendOutcome::NotOwner);
        };
        let owned = run.state == RunState::Running
            && run.claimed_by.as_deref() == Some(worker_id)
            && run.claim_expires_at.is_some_and(|at| at > now);
        if !owned {
            return Ok(ExtendOutcome::NotOwner);
        }
        run.claim_expires_at = Some(now + delta_from_secs(claim_timeout.as_secs_f64()));
        Ok(ExtendOutcome::Extended)
    }

    async fn complete_run(
        &self,
        queue: &str,
        run_id: Uuid,
        worker_id: &str,
        result: &Value,
    ) -> Result<CompleteOutcome> {
        let mut inner = self.lock();
        let now = now_of(&inner);
        let q = queue_of(&mut inner, queue)?;

        let Some(run) = q.runs.get_mut(&run_id) else {
            return Ok(CompleteOutcome::NotOwner);
        };
        if run.state != RunState::Running || run.claimed_by.as_deref() != Some(worker_id) {
            return Ok(CompleteOutcome::NotOwner);
        }
        run.state = RunState::Completed;
        run.result = Some(result.clone());
        run.completed_at = Some(now);
        run.claimed_by = None;
        run.claim_expires_at = None;
        let task_id = run.task_id;

        if let Some(task) = q.tasks.get_mut(&task_id) {
            task.state = TaskState::Completed;
            task.completed_payload = Some(result.clone());
        }
        Ok(CompleteOutcome::Completed)
    }

    async fn fail_run(
        &self,
        queue: &str,
        run_id: Uuid,
        worker_id: &str,
        reason: &FailureReason,
    ) -> Result<FailOutcome> {
        let mut inner = self.lock();
        let now = now_of(&inner);
        let q = queue_of(&mut inner, queue)?;

        let Some(run) = q.runs.get_mut(&run_id) else {
            return Ok(FailOutcome::NotOwner);
        };
        if run.state != RunState::Running || run.claimed_by.as_deref() != Some(worker_id) {
            return Ok(FailOutcome::NotOwner);
        }
        run.state = RunState::Failed;
        run.failure_reason = Some(Json(reason.clone()));
        run.failed_at = Some(now);
        run.claimed_by = None;
        run.claim_expires_at = None;
        let task_id = run.task_id;
        let failed_attempt = run.attempt;

        let Some(task) = q.tasks.get_mut(&task_id) else {
            return Ok(FailOutcome::Exhausted);
        };
        if task.attempts < task.max_attempts {
            let backoff = task.retry_strategy().backoff_seconds(failed_attempt);
            let next_attempt = task.attempts + 1;
            let next_run_id = Uuid::new_v4();
            task.attempts = next_attempt;
            task.state = TaskState::Pending;
            task.last_run_id = Some(next_run_id);

            q.runs.insert(
                next_run_id,
                Run {
                    id: next_run_id,
                    task_id,
                    attempt: next_attempt,
                    state: RunState::Pending,
                    claimed_by: None,
                    claim_expires_at: None,
                    available_at: Some(now + delta_from_secs(backoff)),
                    wake_event: None,
                    event_payload: None,
                    started_at: None,
                    completed_at: None,
                    failed_at: None,
                    result: None,
                    failure_reason: None,
                    created_at: now,
                },
            );
            let seq = q.next_seq;
            q.next_seq += 1;
            q.run_seq.insert(next_run_id, seq);

            Ok(FailOutcome::Retrying {
                run_id: next_run_id,
                attempt: next_attempt,
            })
        } else {
            task.state = TaskState::Failed;
            Ok(FailOutcome::Exhausted)
        }
    }

    async fn suspend_for_event(
        &self,
        queue: &str,
        task_id: Uuid,
        run_id: Uuid,
        worker_id: &str,
        event_name: &str,
        checkpoint_name: &str,
    ) -> Result<EventWait> {
        let mut inner = self.lock();
        let now = now_of(&inner);
        let q = queue_of(&mut inner, queue)?;

        // Oldest cached emission first.
        let oldest = q
            .events
            .iter()
            .filter(|e| e.name == event_name)
            .min_by_key(|e| e.id)
            .map(|e| e.id);
        if let Some(id) = oldest {
            let pos = q
                .events
                .iter()
                .position(|e| e.id == id)
                .unwrap_or_default();
            let event = q.events.remove(pos);
            write_once(q, task_id, checkpoint_name, &event.payload, run_id, now);
            return Ok(EventWait::Cached(event.payload));
        }

        let Some(run) = q.runs.get_mut(&run_id) else {
            return Ok(EventWait::Suspended);
        };
        if run.state != RunState::Running || run.claimed_by.as_deref() != Some(worker_id) {
            return Ok(EventWait::Suspended);
        }
        run.state = RunState::Sleeping;
        run.wake_event = Some(event_name.to_owned());
        run.available_at = None;
        run.claimed_by = None;
        run.claim_expires_at = None;

        q.waiters.insert(
            task_id,
            Waiter {
                run_id,
                event_name: event_name.to_owned(),
                checkpoint_name: checkpoint_name.to_owned(),
            },
        );
        if let Some(task) = q.tasks.get_mut(&task_id) {
            if task.state == TaskState::Running {
                task.state = TaskState::Sleeping;
            }
        }
        Ok(EventWait::Suspended)
    }

    async fn suspend_for_sleep(
        &self,
        queue: &str,
        task_id: Uuid,
        run_id: Uuid,
        worker_id: &str,
        delay: Duration,
        checkpoint_name: &str,
    ) -> Result<()> {
        let mut inner = self.lock();
        let now = now_of(&inner);
        let q = queue_of(&mut inner, queue)?;

        let seconds = delay.as_secs_f64();
        let Some(run) = q.runs.get_mut(&run_id) else {
            return Ok(());
        };
        if run.state != RunState::Running || run.claimed_by.as_deref() != Some(worker_id) {
            return Ok(());
        }
        run.state = RunState::Sleeping;
        run.wake_event = None;
        run.available_at = Some(now + delta_from_secs(seconds));
        run.claimed_by = None;
        run.claim_expires_at = None;

        write_once(
            q,
            task_id,
            checkpoint_name,
            &serde_json::json!({ "seconds": seconds }),
            run_id,
            now,
        );
        if let Some(task) = q.tasks.get_mut(&task_id) {
            if task.state == TaskState::Running {
                task.state = TaskState::Sleeping;
            }
        }
        Ok(())
    }

    async fn read_checkpoint(
        &self,
        queue: &str,
        task_id: Uuid,
        name: &str,
    ) -> Result<Option<Value>> {
        let mut inner = self.lock();
        let q = queue_of(&mut inner, queue)?;
        Ok(q.checkpoints
            .iter()
            .find(|c| c.task_id == task_id && c.name == name)
            .map(|c| c.state.clone()))
    }

    async fn write_checkpoint(
        &self,
        queue: &str,
        task_id: Uuid,
        name: &str,
        state: &Value,
        owner_run_id: Uuid,
    ) -> Result<bool> {
        let mut inner = self.lock();
        let now = now_of(&inner);
        let q = queue_of(&mut inner, queue)?;
        Ok(write_once(q, task_id, name, state, owner_run_id, now))
    }

    async fn get_task(&self, queue: &str, task_id: Uuid) -> Result<Option<Task>> {
        let mut inner = self.lock();
        let q = queue_of(&mut inner, queue)?;
        Ok(q.tasks.get(&task_id).cloned())
    }

    async fn get_run(&self, queue: &str, run_id: Uuid) -> Result<Option<Run>> {
        let mut inner = self.lock();
        let q = queue_of(&mut inner, queue)?;
        Ok(q.runs.get(&run_id).cloned())
    }

    async fn cancel_task(&self, queue: &str, task_id: Uuid) -> Result<bool> {
        let mut inner = self.lock();
        let now = now_of(&inner);
        let q = queue_of(&mut inner, queue)?;

        let Some(task) = q.tasks.get_mut(&task_id) else {
            return Ok(false);
        };
        if task.state.is_terminal() {
            return Ok(false);
        }
        task.state = TaskState::Cancelled;
        task.cancelled_at = Some(now);

        for run in q.runs.values_mut() {
            if run.task_id == task_id
                && matches!(run.state, RunState::Pending | RunState::Sleeping)
            {
                run.state = RunState::Cancelled;
                run.claimed_by = None;
                run.claim_expires_at = None;
                run.available_at = None;
                run.wake_event = None;
            }
        }
        q.waiters.remove(&task_id);
        Ok(true)
    }
}

/// Checkpoints of a task in write order. Test helper mirroring the
/// Postgres `list_checkpoints` query.
impl MemTaskStore {
    pub fn checkpoints(&self, queue: &str, task_id: Uuid) -> Vec<Checkpoint> {
        let mut inner = self.lock();
        match queue_of(&mut inner, queue) {
            Ok(q) => q
                .checkpoints
                .iter()
                .filter(|c| c.task_id == task_id)
                .cloned()
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}
