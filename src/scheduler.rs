#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

//! Dependency-aware task scheduling: atomic claims, completion with the
//! auto-dispatch handshake, bounded retry, and dependency-failure cascade.
//! The scheduler owns data operations only; execution is behind the injected
//! `TaskDispatcher`.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::collab::{AlertSink, Severity};
use crate::config::LedgerConfig;
use crate::error::{LedgerError, Result};
use crate::store::TaskStore;
use crate::types::{
    exponential_delay, ClaimOutcome, NewTask, RetryDecision, Task, TaskStatus, WorkerId,
};

/// Execution hand-off for a task the scheduler has already claimed. Wired at
/// construction time; there is no global dispatch registration.
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    async fn dispatch(&self, task: Task) -> Result<()>;
}

pub struct TaskScheduler {
    store: Arc<dyn TaskStore>,
    dispatcher: Arc<dyn TaskDispatcher>,
    alerts: Arc<dyn AlertSink>,
    backoff_base: Duration,
    default_max_retries: u32,
    // Claims taken during the auto-dispatch handshake are attributed to the
    // scheduler itself rather than any polling worker.
    dispatch_identity: WorkerId,
}

impl TaskScheduler {
    #[must_use]
    pub fn new(
        store: Arc<dyn TaskStore>,
        dispatcher: Arc<dyn TaskDispatcher>,
        alerts: Arc<dyn AlertSink>,
        config: &LedgerConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            alerts,
            backoff_base: config.task_backoff_base,
            default_max_retries: config.task_default_max_retries,
            dispatch_identity: WorkerId::new("scheduler-dispatch"),
        }
    }

    /// Creates a task. Rejects dependency sets that reference unknown tasks
    /// or would close a cycle, before any row is written.
    ///
    /// # Errors
    /// `DependencyCycle` for cycles, `NotFound` for unknown dependencies,
    /// `TaskError` for an empty role, store errors otherwise.
    pub async fn create_task(&self, mut task: NewTask) -> Result<Task> {
        if task.role.trim().is_empty() {
            return Err(LedgerError::TaskError("task role must not be empty".to_string()));
        }

        let id = task.id.unwrap_or_else(Uuid::new_v4);
        task.id = Some(id);
        if task.max_retries.is_none() {
            task.max_retries = Some(self.default_max_retries);
        }

        let mut failed_dependency = None;
        if !task.depends_on.is_empty() {
            if task.depends_on.contains(&id) {
                return Err(LedgerError::DependencyCycle(format!(
                    "task {id} cannot depend on itself"
                )));
            }

            let found = self.store.get_tasks(&task.depends_on).await?;
            let found_ids = found.iter().map(|t| t.id).collect::<HashSet<_>>();
            if let Some(missing) = task.depends_on.iter().find(|d| !found_ids.contains(d)) {
                return Err(LedgerError::NotFound(format!("dependency task {missing}")));
            }

            let edges = self.store.dependency_edges().await?;
            for depends_on in &task.depends_on {
                if reaches(*depends_on, id, &edges) {
                    return Err(LedgerError::DependencyCycle(format!(
                        "dependency {depends_on} already reaches task {id}"
                    )));
                }
            }

            failed_dependency = found
                .iter()
                .find(|dep| dep.status == TaskStatus::Failed)
                .map(|dep| dep.id);
        }

        let initial_status = if task.approval_required {
            TaskStatus::AwaitingApproval
        } else {
            TaskStatus::Queued
        };

        let created = self.store.insert_task(task, initial_status).await?;
        info!(task_id = %created.id, role = %created.role, "Created task");

        // A dependency that already failed will never emit a completion
        // event, so the new task must not sit blocked forever.
        if let Some(failed_dep) = failed_dependency {
            let reason = format!("failed dependency: task {failed_dep} already failed");
            if let Some(failed) = self.store.fail_for_dependency(created.id, &reason).await? {
                warn!(task_id = %failed.id, "Task created over a failed dependency");
                return Ok(failed);
            }
        }

        Ok(created)
    }

    /// Adds a dependency edge to an existing queued task, preserving the DAG
    /// invariant.
    ///
    /// # Errors
    /// `DependencyCycle` when the edge would close a cycle, `NotFound` when
    /// either task is unknown, `InvalidTransition` when the task already ran.
    pub async fn add_dependency(&self, task_id: Uuid, depends_on: Uuid) -> Result<()> {
        if task_id == depends_on {
            return Err(LedgerError::DependencyCycle(format!(
                "task {task_id} cannot depend on itself"
            )));
        }

        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("task {task_id}")))?;
        if !matches!(task.status, TaskStatus::Queued | TaskStatus::AwaitingApproval) {
            return Err(LedgerError::InvalidTransition(format!(
                "task {task_id} is {} and can no longer gain dependencies",
                task.status.as_str()
            )));
        }
        if self.store.get_task(depends_on).await?.is_none() {
            return Err(LedgerError::NotFound(format!("dependency task {depends_on}")));
        }

        let edges = self.store.dependency_edges().await?;
        if reaches(depends_on, task_id, &edges) {
            return Err(LedgerError::DependencyCycle(format!(
                "edge {task_id} -> {depends_on} would close a cycle"
            )));
        }

        self.store.insert_edge(task_id, depends_on).await
    }

    /// Atomic conditional claim. Losing a race returns `success = false` and
    /// never raises; so does a task whose dependencies are not yet complete.
    ///
    /// # Errors
    /// `NotFound` for unknown tasks, store errors otherwise.
    pub async fn claim(&self, task_id: Uuid, worker_id: &WorkerId) -> Result<ClaimOutcome> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("task {task_id}")))?;

        if !self.dependencies_satisfied(&task).await? {
            debug!(task_id = %task_id, "Claim refused: dependencies incomplete");
            return Ok(ClaimOutcome::lost());
        }

        match self.store.try_claim(task_id, worker_id).await? {
            Some(claimed) => {
                debug!(task_id = %task_id, worker = %worker_id, "Claimed task");
                Ok(ClaimOutcome::won(claimed))
            }
            None => Ok(ClaimOutcome::lost()),
        }
    }

    /// Completes a task and, when `auto_dispatch` is set, evaluates every
    /// dependent whose dependency set is now satisfied. Each newly unblocked
    /// dependent is atomically claimed before its execution is handed to the
    /// dispatcher, so concurrent completions dispatch it exactly once.
    ///
    /// # Errors
    /// `NotFound` for unknown tasks, store errors otherwise.
    pub async fn complete_task(
        &self,
        task_id: Uuid,
        result: serde_json::Value,
        auto_dispatch: bool,
    ) -> Result<Task> {
        let (task, transitioned) = self.store.complete(task_id, result).await?;
        if transitioned {
            info!(task_id = %task_id, "Task completed");
        } else {
            debug!(task_id = %task_id, "Duplicate completion ignored");
        }

        if auto_dispatch && task.status == TaskStatus::Completed {
            self.dispatch_unblocked(task_id).await?;
        }
        Ok(task)
    }

    /// Bounded-retry failure protocol. Retryable tasks under their cap go
    /// back to the queue with exponential backoff; otherwise the failure is
    /// terminal and cascades to every transitive dependent.
    ///
    /// # Errors
    /// `NotFound` for unknown tasks, store errors otherwise.
    pub async fn fail_task_with_retry(
        &self,
        task_id: Uuid,
        error_message: &str,
    ) -> Result<RetryDecision> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("task {task_id}")))?;

        if task.is_retryable && task.retry_count < task.max_retries {
            let attempt = task.retry_count + 1;
            let delay = exponential_delay(self.backoff_base, attempt);
            let requeue_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::MAX);
            self.store
                .record_task_failure(task_id, error_message, Some(requeue_at))
                .await?;
            warn!(
                task_id = %task_id,
                attempt,
                delay_secs = delay.as_secs(),
                "Task failed, scheduling retry"
            );
            return Ok(RetryDecision::Scheduled { attempt, delay });
        }

        self.store
            .record_task_failure(task_id, error_message, None)
            .await?;
        error!(task_id = %task_id, retries = task.retry_count, "Task failed permanently");
        self.alerts
            .notify(
                Severity::Critical,
                &format!(
                    "Task {task_id} ({}) failed permanently after {} retries: {error_message}",
                    task.role, task.retry_count
                ),
            )
            .await;
        self.cascade_dependency_failure(task_id).await?;
        Ok(RetryDecision::Exhausted)
    }

    /// awaiting_approval -> queued.
    ///
    /// # Errors
    /// `InvalidTransition` when the task is not awaiting approval.
    pub async fn approve_task(&self, task_id: Uuid, approver: &str) -> Result<Task> {
        self.store.approve(task_id, approver).await?.ok_or_else(|| {
            LedgerError::InvalidTransition(format!("task {task_id} is not awaiting approval"))
        })
    }

    /// # Errors
    /// Returns an error if the store fails.
    pub async fn heartbeat(&self, task_id: Uuid, worker_id: &WorkerId) -> Result<bool> {
        self.store.heartbeat(task_id, worker_id).await
    }

    /// Watchdog sweep: in-progress tasks with a heartbeat stale beyond their
    /// timeout go back to the queue, exactly as if the claim had failed.
    ///
    /// # Errors
    /// Returns an error if the store fails.
    pub async fn requeue_stale(&self) -> Result<u32> {
        let swept = self.store.requeue_stale(Utc::now()).await?;
        if swept > 0 {
            warn!(swept, "Requeued stale in-progress tasks");
        }
        Ok(swept)
    }

    /// Queued tasks ready to claim right now, highest priority first.
    ///
    /// # Errors
    /// Returns an error if the store fails.
    pub async fn next_ready(&self, limit: u32) -> Result<Vec<Task>> {
        self.store.claimable_ready(limit).await
    }

    /// # Errors
    /// Returns an error if the store fails.
    pub async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>> {
        self.store.get_task(task_id).await
    }

    async fn dependencies_satisfied(&self, task: &Task) -> Result<bool> {
        if task.depends_on.is_empty() {
            return Ok(true);
        }
        let deps = self.store.get_tasks(&task.depends_on).await?;
        Ok(deps.len() == task.depends_on.len()
            && deps.iter().all(|d| d.status == TaskStatus::Completed))
    }

    /// The auto-dispatch handshake.
    async fn dispatch_unblocked(&self, completed_id: Uuid) -> Result<()> {
        for dependent in self.store.direct_dependents(completed_id).await? {
            if dependent.status != TaskStatus::Queued {
                continue;
            }

            let deps = self.store.get_tasks(&dependent.depends_on).await?;
            if let Some(failed) = deps.iter().find(|d| d.status == TaskStatus::Failed) {
                let reason = format!("failed dependency: task {} failed", failed.id);
                if self
                    .store
                    .fail_for_dependency(dependent.id, &reason)
                    .await?
                    .is_some()
                {
                    self.cascade_dependency_failure(dependent.id).await?;
                }
                continue;
            }
            if !deps.iter().all(|d| d.status == TaskStatus::Completed) {
                continue;
            }

            // Claim-before-dispatch: when two completions unblock the same
            // dependent concurrently, only the claim winner dispatches.
            let Some(claimed) = self
                .store
                .try_claim(dependent.id, &self.dispatch_identity)
                .await?
            else {
                debug!(task_id = %dependent.id, "Dependent already claimed elsewhere");
                continue;
            };

            info!(task_id = %claimed.id, role = %claimed.role, "Auto-dispatching unblocked task");
            if let Err(e) = self.dispatcher.dispatch(claimed).await {
                // The claim stands; the watchdog will requeue it once its
                // heartbeat goes stale.
                error!(task_id = %dependent.id, "Dispatch failed: {e}");
            }
        }
        Ok(())
    }

    /// Marks every transitive dependent of a permanently failed task as
    /// failed with a dependency reason, rather than leaving them blocked.
    async fn cascade_dependency_failure(&self, failed_id: Uuid) -> Result<()> {
        let mut frontier = vec![failed_id];
        let mut seen = HashSet::from([failed_id]);

        while let Some(current) = frontier.pop() {
            for dependent in self.store.direct_dependents(current).await? {
                if !seen.insert(dependent.id) {
                    continue;
                }
                let reason = format!("failed dependency: task {current} failed");
                if let Some(failed) = self
                    .store
                    .fail_for_dependency(dependent.id, &reason)
                    .await?
                {
                    warn!(task_id = %failed.id, "Task failed due to dependency");
                    frontier.push(failed.id);
                }
            }
        }
        Ok(())
    }
}

/// Depth-first reachability over `depends_on` edges: is `target` reachable
/// from `start`? Used at the write boundary to keep the graph acyclic.
#[must_use]
pub fn reaches(start: Uuid, target: Uuid, edges: &HashMap<Uuid, Vec<Uuid>>) -> bool {
    if start == target {
        return true;
    }
    let mut stack = vec![start];
    let mut visited = HashSet::new();
    while let Some(node) = stack.pop() {
        if !visited.insert(node) {
            continue;
        }
        if let Some(deps) = edges.get(&node) {
            for dep in deps {
                if *dep == target {
                    return true;
                }
                stack.push(*dep);
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<Uuid> {
        (0..n).map(|_| Uuid::new_v4()).collect()
    }

    #[test]
    fn reaches_detects_direct_edge() {
        let v = ids(2);
        let edges = HashMap::from([(v[0], vec![v[1]])]);
        assert!(reaches(v[0], v[1], &edges));
        assert!(!reaches(v[1], v[0], &edges));
    }

    #[test]
    fn reaches_detects_transitive_path() {
        let v = ids(4);
        let edges = HashMap::from([
            (v[0], vec![v[1]]),
            (v[1], vec![v[2]]),
            (v[2], vec![v[3]]),
        ]);
        assert!(reaches(v[0], v[3], &edges));
        assert!(!reaches(v[3], v[0], &edges));
    }

    #[test]
    fn reaches_is_true_for_self() {
        let v = ids(1);
        assert!(reaches(v[0], v[0], &HashMap::new()));
    }

    #[test]
    fn reaches_terminates_on_existing_cycles() {
        // Defensive only; the write boundary prevents this shape from being
        // stored. The walk must still not loop forever.
        let v = ids(3);
        let edges = HashMap::from([
            (v[0], vec![v[1]]),
            (v[1], vec![v[2]]),
            (v[2], vec![v[0]]),
        ]);
        assert!(reaches(v[0], v[2], &edges));
        assert!(!reaches(v[0], Uuid::new_v4(), &edges));
    }

    #[test]
    fn diamond_graphs_are_not_cycles() {
        // d depends on b and c, both depend on a.
        let (a, b, c, d) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let edges = HashMap::from([
            (b, vec![a]),
            (c, vec![a]),
            (d, vec![b, c]),
        ]);
        assert!(!reaches(a, d, &edges));
        assert!(reaches(d, a, &edges));
    }
}
