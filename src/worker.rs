#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

//! Long-running worker loops: WAL draining, task polling, the dispatch queue
//! consumer and the stale-claim watchdog. Each loop is independent and owns no
//! state beyond its poll interval; crash-and-restart is always safe.

use async_trait::async_trait;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::LedgerConfig;
use crate::error::{LedgerError, Result};
use crate::pipeline::ConsolidationPipeline;
use crate::scheduler::{TaskDispatcher, TaskScheduler};
use crate::types::{RetryDecision, Task, WorkerId};
use crate::wal::WalService;

/// Executes one claimed task to produce a result. Implementations hold the
/// role-specific logic; the worker owns the claim, heartbeat and retry
/// bookkeeping around it.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &Task) -> Result<serde_json::Value>;
}

/// Dispatcher that pushes claimed tasks onto an in-process queue, drained by
/// `run_dispatch_consumer`. Decouples completion handling from execution so a
/// slow task cannot stall the completer.
pub struct QueueDispatcher {
    sender: mpsc::Sender<Task>,
}

impl QueueDispatcher {
    /// Returns the dispatcher and the receiving end for the consumer loop.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Task>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl TaskDispatcher for QueueDispatcher {
    async fn dispatch(&self, task: Task) -> Result<()> {
        self.sender
            .send(task)
            .await
            .map_err(|e| LedgerError::TaskError(format!("dispatch queue closed: {e}")))
    }
}

/// Drains pending WAL entries through the pipeline until the queue is empty,
/// then reports how many entries were claimed.
///
/// # Errors
/// Returns an error on store failure; per-entry processing failures are
/// absorbed into the WAL retry protocol.
pub async fn drain_wal_once(
    wal: &WalService,
    pipeline: &ConsolidationPipeline,
    worker_id: &WorkerId,
    batch_limit: u32,
) -> Result<usize> {
    let mut drained = 0_usize;
    loop {
        let claimed = wal.claim_batch(worker_id, batch_limit).await?;
        if claimed.is_empty() {
            return Ok(drained);
        }
        drained += claimed.len();

        let results = join_all(
            claimed
                .iter()
                .map(|entry| pipeline.process_claimed(entry)),
        )
        .await;
        for result in results {
            if let Err(e) = result {
                error!("WAL entry processing hit a store error: {e}");
            }
        }
    }
}

/// Claims and runs one task end to end: heartbeat while executing, then
/// completion with auto-dispatch, or the bounded-retry failure path.
///
/// # Errors
/// Returns an error on store failure. Executor failures feed the retry
/// protocol and are not surfaced here.
pub async fn run_claimed_task(
    scheduler: &TaskScheduler,
    executor: &dyn TaskExecutor,
    task: Task,
    worker_id: &WorkerId,
) -> Result<()> {
    let task_id = task.id;
    // Auto-dispatched tasks arrive holding the scheduler's claim identity,
    // not this loop's. Heartbeats must come from whoever holds the claim or
    // the store rejects them and the task looks lost.
    let claim_holder = task.claimed_by.clone().unwrap_or_else(|| worker_id.clone());
    let heartbeat_every = Duration::from_secs(u64::from(task.timeout_seconds.max(2)) / 2);

    let execution = executor.execute(&task);
    tokio::pin!(execution);

    let outcome = loop {
        tokio::select! {
            outcome = &mut execution => break outcome,
            () = tokio::time::sleep(heartbeat_every) => {
                if !scheduler.heartbeat(task_id, &claim_holder).await? {
                    // The watchdog took the claim back; executing further
                    // would race the next claimant.
                    warn!(task_id = %task_id, "Lost claim mid-execution, abandoning task");
                    return Ok(());
                }
            }
        }
    };

    match outcome {
        Ok(result) => {
            scheduler.complete_task(task_id, result, true).await?;
        }
        Err(e) => {
            let decision = scheduler
                .fail_task_with_retry(task_id, &e.to_string())
                .await?;
            if decision == RetryDecision::Exhausted {
                debug!(task_id = %task_id, "Task retries exhausted");
            }
        }
    }
    Ok(())
}

/// WAL worker loop: poll, drain, sleep.
pub async fn run_wal_worker(
    wal: Arc<WalService>,
    pipeline: Arc<ConsolidationPipeline>,
    worker_id: WorkerId,
    config: &LedgerConfig,
) {
    let poll = config.poll_interval;
    info!(worker = %worker_id, "WAL worker started");
    loop {
        match drain_wal_once(&wal, &pipeline, &worker_id, config.claim_batch_limit).await {
            Ok(0) => {}
            Ok(n) => debug!(worker = %worker_id, drained = n, "Drained WAL entries"),
            Err(e) => error!(worker = %worker_id, "WAL drain failed: {e}"),
        }
        tokio::time::sleep(poll).await;
    }
}

/// Task worker loop: claim ready tasks in priority order and run them.
pub async fn run_task_worker(
    scheduler: Arc<TaskScheduler>,
    executor: Arc<dyn TaskExecutor>,
    worker_id: WorkerId,
    config: &LedgerConfig,
) {
    let poll = config.poll_interval;
    info!(worker = %worker_id, "Task worker started");
    loop {
        match claim_and_run_ready(&scheduler, executor.as_ref(), &worker_id, config).await {
            Ok(0) => tokio::time::sleep(poll).await,
            Ok(n) => debug!(worker = %worker_id, ran = n, "Ran ready tasks"),
            Err(e) => {
                error!(worker = %worker_id, "Task poll failed: {e}");
                tokio::time::sleep(poll).await;
            }
        }
    }
}

async fn claim_and_run_ready(
    scheduler: &TaskScheduler,
    executor: &dyn TaskExecutor,
    worker_id: &WorkerId,
    config: &LedgerConfig,
) -> Result<usize> {
    let ready = scheduler.next_ready(config.claim_batch_limit).await?;
    let mut ran = 0_usize;
    for candidate in ready {
        let outcome = scheduler.claim(candidate.id, worker_id).await?;
        let Some(task) = outcome.task else {
            continue;
        };
        run_claimed_task(scheduler, executor, task, worker_id).await?;
        ran += 1;
    }
    Ok(ran)
}

/// Consumer for the auto-dispatch queue. Tasks arriving here are already
/// claimed by the scheduler, so they go straight to execution.
pub async fn run_dispatch_consumer(
    scheduler: Arc<TaskScheduler>,
    executor: Arc<dyn TaskExecutor>,
    mut receiver: mpsc::Receiver<Task>,
    worker_id: WorkerId,
) {
    info!(worker = %worker_id, "Dispatch consumer started");
    while let Some(task) = receiver.recv().await {
        let task_id = task.id;
        if let Err(e) = run_claimed_task(&scheduler, executor.as_ref(), task, &worker_id).await {
            error!(task_id = %task_id, "Dispatched task hit a store error: {e}");
        }
    }
    info!(worker = %worker_id, "Dispatch queue closed, consumer stopping");
}

/// Watchdog loop: periodically sweeps in-progress tasks whose heartbeat went
/// stale back into the queue.
pub async fn run_watchdog(scheduler: Arc<TaskScheduler>, config: &LedgerConfig) {
    let interval = config.stale_sweep_interval.max(Duration::from_secs(1));
    info!(interval_secs = interval.as_secs(), "Watchdog started");
    loop {
        tokio::time::sleep(interval).await;
        if let Err(e) = scheduler.requeue_stale().await {
            error!("Stale task sweep failed: {e}");
        }
    }
}
