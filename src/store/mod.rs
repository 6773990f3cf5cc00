#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::LedgerDb;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;
use crate::types::{NewTask, NewWalEntry, Task, WalEntry, WorkerId};

/// Durable WAL storage. All claim semantics live here: the backing store is
/// the sole arbiter of claim races.
#[async_trait]
pub trait WalStore: Send + Sync {
    /// Inserts the entry, or returns the existing row when `idempotency_key`
    /// already exists. The boolean is `true` when a new row was written.
    async fn insert_or_get(&self, entry: NewWalEntry) -> Result<(WalEntry, bool)>;

    async fn get_entry(&self, id: Uuid) -> Result<Option<WalEntry>>;

    /// Atomically claims up to `limit` pending entries whose retry delay has
    /// elapsed, in submission order. Status, `claimed_by` and `checkpoint_id`
    /// are all stamped inside the claim transaction.
    async fn claim_batch(
        &self,
        worker_id: &WorkerId,
        checkpoint_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<WalEntry>>;

    /// Atomically claims one specific pending entry. `None` means another
    /// worker holds it or it is not pending.
    async fn claim_entry(
        &self,
        id: Uuid,
        worker_id: &WorkerId,
        checkpoint_id: Option<&str>,
    ) -> Result<Option<WalEntry>>;

    async fn mark_completed(&self, id: Uuid) -> Result<WalEntry>;

    /// Records a failure. `requeue_at = Some(t)` returns the entry to pending
    /// with `retry_count + 1`; `None` leaves it terminally failed with
    /// `retry_count + 1`.
    async fn record_failure(
        &self,
        id: Uuid,
        error: &str,
        requeue_at: Option<DateTime<Utc>>,
    ) -> Result<WalEntry>;
}

/// Durable task storage with atomic conditional transitions.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Inserts the task with its dependency edges. Cycle checking happens in
    /// the scheduler before this is called.
    async fn insert_task(&self, task: NewTask, initial_status: crate::types::TaskStatus)
        -> Result<Task>;

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>>;

    async fn get_tasks(&self, ids: &[Uuid]) -> Result<Vec<Task>>;

    /// Snapshot of all non-terminal dependency edges, task id -> depends_on,
    /// for cycle checking at the write boundary.
    async fn dependency_edges(&self) -> Result<HashMap<Uuid, Vec<Uuid>>>;

    /// Adds a dependency edge. The scheduler has already verified acyclicity.
    async fn insert_edge(&self, task_id: Uuid, depends_on: Uuid) -> Result<()>;

    /// Atomic conditional transition queued -> in_progress. `None` when the
    /// task is not claimable (already claimed, awaiting approval, terminal,
    /// or its retry delay has not elapsed).
    async fn try_claim(&self, id: Uuid, worker_id: &WorkerId) -> Result<Option<Task>>;

    /// Transition to completed, storing the result. Idempotent: completing an
    /// already-terminal task returns it unchanged with `false`.
    async fn complete(&self, id: Uuid, result: Value) -> Result<(Task, bool)>;

    /// Records a failure. `requeue_at = Some(t)` returns the task to queued
    /// with `retry_count + 1`; `None` marks it terminally failed without
    /// consuming a retry.
    async fn record_task_failure(
        &self,
        id: Uuid,
        error: &str,
        requeue_at: Option<DateTime<Utc>>,
    ) -> Result<Task>;

    /// Marks a never-run task failed because a dependency failed. Applies
    /// only to non-terminal, not-in-progress tasks; returns `None` otherwise.
    async fn fail_for_dependency(&self, id: Uuid, reason: &str) -> Result<Option<Task>>;

    /// Tasks that directly depend on the given task.
    async fn direct_dependents(&self, id: Uuid) -> Result<Vec<Task>>;

    /// Queued tasks whose dependencies are all completed and whose retry
    /// delay has elapsed, highest priority first.
    async fn claimable_ready(&self, limit: u32) -> Result<Vec<Task>>;

    /// awaiting_approval -> queued.
    async fn approve(&self, id: Uuid, approver: &str) -> Result<Option<Task>>;

    /// Refreshes `last_heartbeat_at` when `worker_id` holds the claim.
    async fn heartbeat(&self, id: Uuid, worker_id: &WorkerId) -> Result<bool>;

    /// Returns stale in-progress tasks to queued. Returns how many were swept.
    async fn requeue_stale(&self, now: DateTime<Utc>) -> Result<u32>;
}

/// Ephemeral key-value storage with TTL expiry, used for checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn set_with_ttl(&self, key: &str, value: Value, ttl: Duration) -> Result<()>;

    /// `None` on miss or after TTL expiry.
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn delete(&self, key: &str) -> Result<()>;
}
