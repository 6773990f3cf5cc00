#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod support;

use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use ledger::collab::Severity;
use ledger::{LedgerError, NewTask, RetryDecision, TaskStatus, WorkerId};
use support::harness::{test_config, RecordingDispatcher, TestRig};

#[tokio::test]
async fn cycle_is_rejected_before_any_row_is_written() -> Result<(), String> {
    let config = test_config();
    let rig = TestRig::new(&config);
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let scheduler = rig.scheduler(&config, dispatcher);

    let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    scheduler
        .create_task(NewTask::new("step", json!({})).with_id(a))
        .await
        .map_err(|e| e.to_string())?;
    scheduler
        .create_task(NewTask::new("step", json!({})).with_id(b).depends_on(vec![a]))
        .await
        .map_err(|e| e.to_string())?;
    scheduler
        .create_task(NewTask::new("step", json!({})).with_id(c).depends_on(vec![b]))
        .await
        .map_err(|e| e.to_string())?;

    // a -> c would close a <- b <- c.
    let result = scheduler.add_dependency(a, c).await;
    if !matches!(result, Err(LedgerError::DependencyCycle(_))) {
        return Err(format!("expected cycle rejection, got {result:?}"));
    }

    // A fresh task closing the loop through its creation deps is also caught.
    let d = Uuid::new_v4();
    scheduler
        .create_task(NewTask::new("step", json!({})).with_id(d).depends_on(vec![c]))
        .await
        .map_err(|e| e.to_string())?;
    let self_loop = scheduler.add_dependency(d, d).await;
    if !matches!(self_loop, Err(LedgerError::DependencyCycle(_))) {
        return Err(format!("expected self-loop rejection, got {self_loop:?}"));
    }

    // No edge slipped in.
    let a_task = scheduler
        .get_task(a)
        .await
        .map_err(|e| e.to_string())?
        .ok_or("task a vanished")?;
    if !a_task.depends_on.is_empty() {
        return Err("rejected edge was persisted".to_string());
    }
    Ok(())
}

#[tokio::test]
async fn diamond_dependents_are_dispatched_exactly_once() -> Result<(), String> {
    let config = test_config();
    let rig = TestRig::new(&config);
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let scheduler = rig.scheduler(&config, dispatcher.clone());

    let (a, b, c, d) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    scheduler
        .create_task(NewTask::new("root", json!({})).with_id(a))
        .await
        .map_err(|e| e.to_string())?;
    scheduler
        .create_task(NewTask::new("left", json!({})).with_id(b).depends_on(vec![a]))
        .await
        .map_err(|e| e.to_string())?;
    scheduler
        .create_task(NewTask::new("right", json!({})).with_id(c).depends_on(vec![a]))
        .await
        .map_err(|e| e.to_string())?;
    scheduler
        .create_task(NewTask::new("join", json!({})).with_id(d).depends_on(vec![b, c]))
        .await
        .map_err(|e| e.to_string())?;

    let worker = WorkerId::new("w1");
    let claim = scheduler.claim(a, &worker).await.map_err(|e| e.to_string())?;
    if !claim.success {
        return Err("root task should be claimable".to_string());
    }
    scheduler
        .complete_task(a, json!({"ok": true}), true)
        .await
        .map_err(|e| e.to_string())?;

    // Both branches were unblocked, claimed and dispatched.
    if dispatcher.dispatch_count(b).await != 1 || dispatcher.dispatch_count(c).await != 1 {
        return Err(format!("branches dispatched {:?}", dispatcher.dispatched().await));
    }
    // The join waits for its second dependency.
    scheduler
        .complete_task(b, json!({}), true)
        .await
        .map_err(|e| e.to_string())?;
    if dispatcher.dispatch_count(d).await != 0 {
        return Err("join dispatched before all dependencies completed".to_string());
    }
    scheduler
        .complete_task(c, json!({}), true)
        .await
        .map_err(|e| e.to_string())?;
    if dispatcher.dispatch_count(d).await != 1 {
        return Err(format!(
            "join must be dispatched exactly once, got {}",
            dispatcher.dispatch_count(d).await
        ));
    }

    let join = scheduler
        .get_task(d)
        .await
        .map_err(|e| e.to_string())?
        .ok_or("join vanished")?;
    if join.status != TaskStatus::InProgress {
        return Err(format!("dispatched join should hold a claim, got {:?}", join.status));
    }
    Ok(())
}

#[tokio::test]
async fn terminal_failure_cascades_to_transitive_dependents() -> Result<(), String> {
    let config = test_config();
    let rig = TestRig::new(&config);
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let scheduler = rig.scheduler(&config, dispatcher.clone());

    let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    scheduler
        .create_task(NewTask::new("root", json!({})).with_id(a).retryable(false))
        .await
        .map_err(|e| e.to_string())?;
    scheduler
        .create_task(NewTask::new("mid", json!({})).with_id(b).depends_on(vec![a]))
        .await
        .map_err(|e| e.to_string())?;
    scheduler
        .create_task(NewTask::new("leaf", json!({})).with_id(c).depends_on(vec![b]))
        .await
        .map_err(|e| e.to_string())?;

    let decision = scheduler
        .fail_task_with_retry(a, "unrecoverable")
        .await
        .map_err(|e| e.to_string())?;
    if decision != RetryDecision::Exhausted {
        return Err(format!("non-retryable task must fail terminally, got {decision:?}"));
    }

    for (label, id) in [("mid", b), ("leaf", c)] {
        let task = scheduler
            .get_task(id)
            .await
            .map_err(|e| e.to_string())?
            .ok_or("task vanished")?;
        if task.status != TaskStatus::Failed {
            return Err(format!("{label} should fail by cascade, got {:?}", task.status));
        }
        if !task.error.as_deref().is_some_and(|e| e.contains("failed dependency")) {
            return Err(format!("{label} lacks the dependency-failure reason: {:?}", task.error));
        }
    }
    if !dispatcher.dispatched().await.is_empty() {
        return Err("cascaded tasks must never be dispatched".to_string());
    }
    if rig.alerts.count(Severity::Critical).await != 1 {
        return Err("terminal failure must raise one critical alert".to_string());
    }
    Ok(())
}

#[tokio::test]
async fn retryable_task_requeues_until_the_cap_then_fails() -> Result<(), String> {
    let config = test_config();
    let rig = TestRig::new(&config);
    let scheduler = rig.scheduler(&config, Arc::new(RecordingDispatcher::default()));

    let task = scheduler
        .create_task(NewTask::new("flaky", json!({})).max_retries(3))
        .await
        .map_err(|e| e.to_string())?;
    let worker = WorkerId::new("w1");

    for attempt in 1..=3_u32 {
        let claim = scheduler
            .claim(task.id, &worker)
            .await
            .map_err(|e| e.to_string())?;
        if !claim.success {
            return Err(format!("attempt {attempt}: task was not claimable"));
        }
        let decision = scheduler
            .fail_task_with_retry(task.id, "transient")
            .await
            .map_err(|e| e.to_string())?;
        match decision {
            RetryDecision::Scheduled { attempt: n, .. } if n == attempt => {}
            other => return Err(format!("attempt {attempt}: got {other:?}")),
        }
    }

    // Fourth failure: the cap is exhausted.
    let claim = scheduler
        .claim(task.id, &worker)
        .await
        .map_err(|e| e.to_string())?;
    if !claim.success {
        return Err("task must be claimable for its final attempt".to_string());
    }
    let decision = scheduler
        .fail_task_with_retry(task.id, "transient")
        .await
        .map_err(|e| e.to_string())?;
    if decision != RetryDecision::Exhausted {
        return Err(format!("expected exhaustion on the fourth failure, got {decision:?}"));
    }

    let final_state = scheduler
        .get_task(task.id)
        .await
        .map_err(|e| e.to_string())?
        .ok_or("task vanished")?;
    if final_state.status != TaskStatus::Failed || final_state.retry_count != 3 {
        return Err(format!(
            "expected terminal failure with retry_count 3, got {:?} rc={}",
            final_state.status, final_state.retry_count
        ));
    }
    Ok(())
}

#[tokio::test]
async fn approval_gates_claiming_until_granted() -> Result<(), String> {
    let config = test_config();
    let rig = TestRig::new(&config);
    let scheduler = rig.scheduler(&config, Arc::new(RecordingDispatcher::default()));

    let task = scheduler
        .create_task(NewTask::new("deploy", json!({})).approval_required(true))
        .await
        .map_err(|e| e.to_string())?;
    if task.status != TaskStatus::AwaitingApproval {
        return Err(format!("expected awaiting_approval, got {:?}", task.status));
    }

    let worker = WorkerId::new("w1");
    let premature = scheduler
        .claim(task.id, &worker)
        .await
        .map_err(|e| e.to_string())?;
    if premature.success {
        return Err("unapproved task must not be claimable".to_string());
    }

    let approved = scheduler
        .approve_task(task.id, "reviewer")
        .await
        .map_err(|e| e.to_string())?;
    if approved.status != TaskStatus::Queued
        || approved.approved_by.as_deref() != Some("reviewer")
    {
        return Err(format!("approval did not queue the task: {approved:?}"));
    }

    let claim = scheduler
        .claim(task.id, &worker)
        .await
        .map_err(|e| e.to_string())?;
    if !claim.success {
        return Err("approved task must be claimable".to_string());
    }
    Ok(())
}

#[tokio::test]
async fn task_over_an_already_failed_dependency_fails_immediately() -> Result<(), String> {
    let config = test_config();
    let rig = TestRig::new(&config);
    let scheduler = rig.scheduler(&config, Arc::new(RecordingDispatcher::default()));

    let dead = scheduler
        .create_task(NewTask::new("root", json!({})).retryable(false))
        .await
        .map_err(|e| e.to_string())?;
    scheduler
        .fail_task_with_retry(dead.id, "gone")
        .await
        .map_err(|e| e.to_string())?;

    let late = scheduler
        .create_task(NewTask::new("late", json!({})).depends_on(vec![dead.id]))
        .await
        .map_err(|e| e.to_string())?;
    if late.status != TaskStatus::Failed {
        return Err(format!(
            "task over a failed dependency must fail at creation, got {:?}",
            late.status
        ));
    }
    Ok(())
}

#[tokio::test]
async fn duplicate_completion_is_a_noop() -> Result<(), String> {
    let config = test_config();
    let rig = TestRig::new(&config);
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let scheduler = rig.scheduler(&config, dispatcher.clone());

    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    scheduler
        .create_task(NewTask::new("root", json!({})).with_id(a))
        .await
        .map_err(|e| e.to_string())?;
    scheduler
        .create_task(NewTask::new("next", json!({})).with_id(b).depends_on(vec![a]))
        .await
        .map_err(|e| e.to_string())?;

    scheduler
        .complete_task(a, json!({"v": 1}), true)
        .await
        .map_err(|e| e.to_string())?;
    scheduler
        .complete_task(a, json!({"v": 2}), true)
        .await
        .map_err(|e| e.to_string())?;

    let task = scheduler
        .get_task(a)
        .await
        .map_err(|e| e.to_string())?
        .ok_or("task vanished")?;
    if task.result != Some(json!({"v": 1})) {
        return Err(format!("duplicate completion overwrote the result: {:?}", task.result));
    }
    // The dependent was already claimed by the first completion, so the
    // second pass finds nothing to dispatch.
    if dispatcher.dispatch_count(b).await != 1 {
        return Err(format!(
            "dependent dispatched {} times",
            dispatcher.dispatch_count(b).await
        ));
    }
    Ok(())
}

#[tokio::test]
async fn stale_claims_are_swept_back_to_the_queue() -> Result<(), String> {
    let config = test_config();
    let rig = TestRig::new(&config);
    let scheduler = rig.scheduler(&config, Arc::new(RecordingDispatcher::default()));

    let mut request = NewTask::new("slow", json!({}));
    request.timeout_seconds = 0;
    let task = scheduler.create_task(request).await.map_err(|e| e.to_string())?;

    let worker = WorkerId::new("doomed");
    let claim = scheduler
        .claim(task.id, &worker)
        .await
        .map_err(|e| e.to_string())?;
    if !claim.success {
        return Err("task should be claimable".to_string());
    }

    // Zero timeout: the claim is stale the moment it exists.
    let swept = scheduler.requeue_stale().await.map_err(|e| e.to_string())?;
    if swept != 1 {
        return Err(format!("expected one swept task, got {swept}"));
    }

    let requeued = scheduler
        .get_task(task.id)
        .await
        .map_err(|e| e.to_string())?
        .ok_or("task vanished")?;
    if requeued.status != TaskStatus::Queued || requeued.claimed_by.is_some() {
        return Err(format!("sweep left the task as {:?}", requeued.status));
    }

    // The dead worker's heartbeat no longer lands.
    let beat = scheduler
        .heartbeat(task.id, &worker)
        .await
        .map_err(|e| e.to_string())?;
    if beat {
        return Err("heartbeat must fail after the claim was swept".to_string());
    }
    Ok(())
}
