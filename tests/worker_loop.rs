#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod support;

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use ledger::worker::{drain_wal_once, run_claimed_task};
use ledger::{
    LedgerError, NewTask, QueueDispatcher, Result as LedgerResult, Task, TaskExecutor,
    TaskScheduler, TaskStatus, WalStatus, WorkerId,
};
use support::harness::{relationship, test_config, FlakyExtractor, RecordingSink, TestRig};

struct StubExecutor {
    fail: bool,
}

#[async_trait]
impl TaskExecutor for StubExecutor {
    async fn execute(&self, task: &Task) -> LedgerResult<Value> {
        if self.fail {
            Err(LedgerError::TaskError("executor refused".to_string()))
        } else {
            Ok(json!({"echo": task.payload}))
        }
    }
}

/// Executor slower than the task's heartbeat interval.
struct SlowExecutor {
    delay: std::time::Duration,
}

#[async_trait]
impl TaskExecutor for SlowExecutor {
    async fn execute(&self, task: &Task) -> LedgerResult<Value> {
        tokio::time::sleep(self.delay).await;
        Ok(json!({"echo": task.payload}))
    }
}

fn queue_scheduler(
    rig: &TestRig,
    config: &ledger::LedgerConfig,
) -> (Arc<TaskScheduler>, tokio::sync::mpsc::Receiver<Task>) {
    let (dispatcher, receiver) = QueueDispatcher::channel(16);
    let scheduler = Arc::new(TaskScheduler::new(
        rig.store.clone(),
        Arc::new(dispatcher),
        rig.alerts.clone(),
        config,
    ));
    (scheduler, receiver)
}

#[tokio::test]
async fn drain_processes_every_pending_entry_across_batches() -> Result<(), String> {
    let mut config = test_config();
    config.claim_batch_limit = 2;
    let rig = TestRig::new(&config);
    let sink = Arc::new(RecordingSink::default());
    let pipeline = rig.pipeline(
        &config,
        Arc::new(FlakyExtractor::new(0, vec![relationship("a", "knows", "b")])),
        sink,
    );

    let mut ids = Vec::new();
    for i in 0..5 {
        let payload = json!({
            "content": json!({"relationships": []}).to_string(),
            "user": "tester",
            "seq": i,
        });
        let entry = rig.wal.append(payload).await.map_err(|e| e.to_string())?;
        ids.push(entry.id);
    }

    let drained = drain_wal_once(&rig.wal, &pipeline, &WorkerId::new("w1"), config.claim_batch_limit)
        .await
        .map_err(|e| e.to_string())?;
    if drained != 5 {
        return Err(format!("expected 5 drained entries, got {drained}"));
    }
    for id in ids {
        let entry = rig
            .wal
            .get_entry(id)
            .await
            .map_err(|e| e.to_string())?
            .ok_or("entry vanished")?;
        if entry.status != WalStatus::Completed {
            return Err(format!("entry {id} ended as {:?}", entry.status));
        }
    }
    Ok(())
}

#[tokio::test]
async fn completed_task_flows_through_the_dispatch_queue() -> Result<(), String> {
    let config = test_config();
    let rig = TestRig::new(&config);
    let (scheduler, mut receiver) = queue_scheduler(&rig, &config);

    let root = scheduler
        .create_task(NewTask::new("root", json!({"n": 1})))
        .await
        .map_err(|e| e.to_string())?;
    let dependent = scheduler
        .create_task(NewTask::new("next", json!({})).depends_on(vec![root.id]))
        .await
        .map_err(|e| e.to_string())?;

    let worker = WorkerId::new("w1");
    let claim = scheduler
        .claim(root.id, &worker)
        .await
        .map_err(|e| e.to_string())?;
    let task = claim.task.ok_or("root claim lost")?;

    run_claimed_task(&scheduler, &StubExecutor { fail: false }, task, &worker)
        .await
        .map_err(|e| e.to_string())?;

    let completed = scheduler
        .get_task(root.id)
        .await
        .map_err(|e| e.to_string())?
        .ok_or("root vanished")?;
    if completed.status != TaskStatus::Completed {
        return Err(format!("root ended as {:?}", completed.status));
    }

    // The unblocked dependent arrives on the queue already claimed.
    let dispatched = receiver.recv().await.ok_or("dispatch queue closed")?;
    if dispatched.id != dependent.id || dispatched.status != TaskStatus::InProgress {
        return Err(format!(
            "unexpected dispatched task {} ({:?})",
            dispatched.id, dispatched.status
        ));
    }
    Ok(())
}

#[tokio::test]
async fn executor_failure_feeds_the_retry_protocol() -> Result<(), String> {
    let config = test_config();
    let rig = TestRig::new(&config);
    let (scheduler, _receiver) = queue_scheduler(&rig, &config);

    let task = scheduler
        .create_task(NewTask::new("flaky", json!({})).max_retries(2))
        .await
        .map_err(|e| e.to_string())?;
    let worker = WorkerId::new("w1");
    let claim = scheduler
        .claim(task.id, &worker)
        .await
        .map_err(|e| e.to_string())?;
    let claimed = claim.task.ok_or("claim lost")?;

    run_claimed_task(&scheduler, &StubExecutor { fail: true }, claimed, &worker)
        .await
        .map_err(|e| e.to_string())?;

    let after = scheduler
        .get_task(task.id)
        .await
        .map_err(|e| e.to_string())?
        .ok_or("task vanished")?;
    if after.status != TaskStatus::Queued || after.retry_count != 1 {
        return Err(format!(
            "expected requeued task with one recorded failure, got {:?} rc={}",
            after.status, after.retry_count
        ));
    }
    if after.error.as_deref() != Some("Task error: executor refused") {
        return Err(format!("unexpected recorded error: {:?}", after.error));
    }
    Ok(())
}

#[tokio::test]
async fn slow_dispatched_task_survives_its_heartbeat_interval() -> Result<(), String> {
    let config = test_config();
    let rig = TestRig::new(&config);
    let (scheduler, mut receiver) = queue_scheduler(&rig, &config);

    let root = scheduler
        .create_task(NewTask::new("root", json!({})))
        .await
        .map_err(|e| e.to_string())?;
    let mut request = NewTask::new("slow", json!({"n": 2})).depends_on(vec![root.id]);
    request.timeout_seconds = 2;
    let dependent = scheduler.create_task(request).await.map_err(|e| e.to_string())?;

    let worker = WorkerId::new("w1");
    scheduler
        .claim(root.id, &worker)
        .await
        .map_err(|e| e.to_string())?;
    scheduler
        .complete_task(root.id, json!({}), true)
        .await
        .map_err(|e| e.to_string())?;

    // The dependent arrives claimed under the scheduler's dispatch identity;
    // the consumer runs it under its own worker id. Execution outlasts the
    // heartbeat interval, so heartbeats must land against the actual claim
    // holder or the task is abandoned mid-run.
    let dispatched = receiver.recv().await.ok_or("dispatch queue closed")?;
    if dispatched.id != dependent.id {
        return Err(format!("unexpected dispatched task {}", dispatched.id));
    }
    let consumer = WorkerId::new("consumer");
    run_claimed_task(
        &scheduler,
        &SlowExecutor {
            delay: std::time::Duration::from_millis(1_500),
        },
        dispatched,
        &consumer,
    )
    .await
    .map_err(|e| e.to_string())?;

    let finished = scheduler
        .get_task(dependent.id)
        .await
        .map_err(|e| e.to_string())?
        .ok_or("dependent vanished")?;
    if finished.status != TaskStatus::Completed || finished.result.is_none() {
        return Err(format!(
            "slow dispatched task must finish, got {:?} result={:?}",
            finished.status, finished.result
        ));
    }
    Ok(())
}
