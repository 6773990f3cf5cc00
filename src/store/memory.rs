#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{LedgerError, Result};
use crate::types::{NewTask, NewWalEntry, Task, TaskStatus, WalEntry, WalStatus, WorkerId};

use super::{CheckpointStore, TaskStore, WalStore};

#[derive(Default)]
struct Inner {
    wal: HashMap<Uuid, WalEntry>,
    // Insertion order; claim scans preserve submission FIFO.
    wal_order: Vec<Uuid>,
    wal_keys: HashMap<String, Uuid>,
    tasks: HashMap<Uuid, Task>,
    task_order: Vec<Uuid>,
    kv: HashMap<String, (Value, DateTime<Utc>)>,
}

/// In-memory implementation of all three storage traits. A single lock makes
/// every operation atomic, mirroring the transaction boundary the Postgres
/// store gets from the database.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn wal_entry_due(entry: &WalEntry, now: DateTime<Utc>) -> bool {
    entry.status == WalStatus::Pending
        && entry.next_retry_at.is_none_or(|at| at <= now)
}

fn task_claimable(task: &Task, now: DateTime<Utc>) -> bool {
    task.status == TaskStatus::Queued && task.next_retry_at.is_none_or(|at| at <= now)
}

fn claim_wal_entry(
    entry: &mut WalEntry,
    worker_id: &WorkerId,
    checkpoint_id: Option<&str>,
    now: DateTime<Utc>,
) {
    entry.status = WalStatus::Processing;
    entry.claimed_by = Some(worker_id.clone());
    entry.checkpoint_id = checkpoint_id.map(ToString::to_string);
    entry.updated_at = now;
}

#[async_trait]
impl WalStore for MemoryStore {
    async fn insert_or_get(&self, entry: NewWalEntry) -> Result<(WalEntry, bool)> {
        let mut inner = self.inner.lock().await;
        if let Some(existing_id) = inner.wal_keys.get(&entry.idempotency_key).copied() {
            let existing = inner.wal.get(&existing_id).cloned().ok_or_else(|| {
                LedgerError::Internal(format!("dangling idempotency key {}", entry.idempotency_key))
            })?;
            return Ok((existing, false));
        }

        let now = Utc::now();
        let stored = WalEntry {
            id: entry.id,
            idempotency_key: entry.idempotency_key.clone(),
            status: WalStatus::Pending,
            raw_payload: entry.raw_payload,
            claimed_by: None,
            retry_count: 0,
            checkpoint_id: None,
            next_retry_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        inner.wal_keys.insert(entry.idempotency_key, entry.id);
        inner.wal_order.push(entry.id);
        inner.wal.insert(entry.id, stored.clone());
        Ok((stored, true))
    }

    async fn get_entry(&self, id: Uuid) -> Result<Option<WalEntry>> {
        Ok(self.inner.lock().await.wal.get(&id).cloned())
    }

    async fn claim_batch(
        &self,
        worker_id: &WorkerId,
        checkpoint_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<WalEntry>> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let due_ids = inner
            .wal_order
            .iter()
            .filter(|id| inner.wal.get(id).is_some_and(|e| wal_entry_due(e, now)))
            .take(limit as usize)
            .copied()
            .collect::<Vec<_>>();

        let mut claimed = Vec::with_capacity(due_ids.len());
        for id in due_ids {
            if let Some(entry) = inner.wal.get_mut(&id) {
                claim_wal_entry(entry, worker_id, checkpoint_id, now);
                claimed.push(entry.clone());
            }
        }
        Ok(claimed)
    }

    async fn claim_entry(
        &self,
        id: Uuid,
        worker_id: &WorkerId,
        checkpoint_id: Option<&str>,
    ) -> Result<Option<WalEntry>> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        Ok(inner.wal.get_mut(&id).and_then(|entry| {
            if wal_entry_due(entry, now) {
                claim_wal_entry(entry, worker_id, checkpoint_id, now);
                Some(entry.clone())
            } else {
                None
            }
        }))
    }

    async fn mark_completed(&self, id: Uuid) -> Result<WalEntry> {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .wal
            .get_mut(&id)
            .ok_or_else(|| LedgerError::NotFound(format!("WAL entry {id}")))?;
        entry.status = WalStatus::Completed;
        entry.next_retry_at = None;
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    async fn record_failure(
        &self,
        id: Uuid,
        error: &str,
        requeue_at: Option<DateTime<Utc>>,
    ) -> Result<WalEntry> {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .wal
            .get_mut(&id)
            .ok_or_else(|| LedgerError::NotFound(format!("WAL entry {id}")))?;
        entry.retry_count += 1;
        entry.last_error = Some(error.to_string());
        entry.claimed_by = None;
        entry.updated_at = Utc::now();
        match requeue_at {
            Some(at) => {
                entry.status = WalStatus::Pending;
                entry.next_retry_at = Some(at);
            }
            None => {
                entry.status = WalStatus::Failed;
                entry.next_retry_at = None;
            }
        }
        Ok(entry.clone())
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn insert_task(&self, task: NewTask, initial_status: TaskStatus) -> Result<Task> {
        let mut inner = self.inner.lock().await;
        let id = task.id.unwrap_or_else(Uuid::new_v4);
        if inner.tasks.contains_key(&id) {
            return Err(LedgerError::TaskError(format!("task {id} already exists")));
        }

        let now = Utc::now();
        let stored = Task {
            id,
            role: task.role,
            status: initial_status,
            priority: task.priority,
            payload: task.payload,
            depends_on: task.depends_on,
            result: None,
            error: None,
            retry_count: 0,
            max_retries: task.max_retries.unwrap_or(3),
            next_retry_at: None,
            is_retryable: task.is_retryable,
            approval_required: task.approval_required,
            approved_by: None,
            approved_at: None,
            session_id: task.session_id,
            created_by: task.created_by,
            claimed_by: None,
            started_at: None,
            timeout_seconds: task.timeout_seconds,
            last_heartbeat_at: None,
            created_at: now,
            updated_at: now,
        };
        inner.task_order.push(id);
        inner.tasks.insert(id, stored.clone());
        Ok(stored)
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>> {
        Ok(self.inner.lock().await.tasks.get(&id).cloned())
    }

    async fn get_tasks(&self, ids: &[Uuid]) -> Result<Vec<Task>> {
        let inner = self.inner.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| inner.tasks.get(id).cloned())
            .collect())
    }

    async fn dependency_edges(&self) -> Result<HashMap<Uuid, Vec<Uuid>>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .tasks
            .values()
            .filter(|t| !t.depends_on.is_empty())
            .map(|t| (t.id, t.depends_on.clone()))
            .collect())
    }

    async fn insert_edge(&self, task_id: Uuid, depends_on: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let task = inner
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| LedgerError::NotFound(format!("task {task_id}")))?;
        if !task.depends_on.contains(&depends_on) {
            task.depends_on.push(depends_on);
            task.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn try_claim(&self, id: Uuid, worker_id: &WorkerId) -> Result<Option<Task>> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        Ok(inner.tasks.get_mut(&id).and_then(|task| {
            if task_claimable(task, now) {
                task.status = TaskStatus::InProgress;
                task.claimed_by = Some(worker_id.clone());
                task.started_at = Some(now);
                task.last_heartbeat_at = Some(now);
                task.updated_at = now;
                Some(task.clone())
            } else {
                None
            }
        }))
    }

    async fn complete(&self, id: Uuid, result: Value) -> Result<(Task, bool)> {
        let mut inner = self.inner.lock().await;
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or_else(|| LedgerError::NotFound(format!("task {id}")))?;
        if !matches!(task.status, TaskStatus::InProgress | TaskStatus::Queued) {
            return Ok((task.clone(), false));
        }
        task.status = TaskStatus::Completed;
        task.result = Some(result);
        task.next_retry_at = None;
        task.updated_at = Utc::now();
        Ok((task.clone(), true))
    }

    async fn record_task_failure(
        &self,
        id: Uuid,
        error: &str,
        requeue_at: Option<DateTime<Utc>>,
    ) -> Result<Task> {
        let mut inner = self.inner.lock().await;
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or_else(|| LedgerError::NotFound(format!("task {id}")))?;
        task.error = Some(error.to_string());
        task.claimed_by = None;
        task.updated_at = Utc::now();
        match requeue_at {
            Some(at) => {
                task.status = TaskStatus::Queued;
                task.retry_count += 1;
                task.next_retry_at = Some(at);
            }
            None => {
                task.status = TaskStatus::Failed;
                task.next_retry_at = None;
            }
        }
        Ok(task.clone())
    }

    async fn fail_for_dependency(&self, id: Uuid, reason: &str) -> Result<Option<Task>> {
        let mut inner = self.inner.lock().await;
        Ok(inner.tasks.get_mut(&id).and_then(|task| {
            if matches!(task.status, TaskStatus::Queued | TaskStatus::AwaitingApproval) {
                task.status = TaskStatus::Failed;
                task.error = Some(reason.to_string());
                task.next_retry_at = None;
                task.updated_at = Utc::now();
                Some(task.clone())
            } else {
                None
            }
        }))
    }

    async fn direct_dependents(&self, id: Uuid) -> Result<Vec<Task>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .task_order
            .iter()
            .filter_map(|tid| inner.tasks.get(tid))
            .filter(|t| t.depends_on.contains(&id))
            .cloned()
            .collect())
    }

    async fn claimable_ready(&self, limit: u32) -> Result<Vec<Task>> {
        let inner = self.inner.lock().await;
        let now = Utc::now();
        let mut ready = inner
            .task_order
            .iter()
            .filter_map(|tid| inner.tasks.get(tid))
            .filter(|t| task_claimable(t, now))
            .filter(|t| {
                t.depends_on.iter().all(|dep| {
                    inner
                        .tasks
                        .get(dep)
                        .is_some_and(|d| d.status == TaskStatus::Completed)
                })
            })
            .cloned()
            .collect::<Vec<_>>();
        ready.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        ready.truncate(limit as usize);
        Ok(ready)
    }

    async fn approve(&self, id: Uuid, approver: &str) -> Result<Option<Task>> {
        let mut inner = self.inner.lock().await;
        Ok(inner.tasks.get_mut(&id).and_then(|task| {
            if task.status == TaskStatus::AwaitingApproval {
                task.status = TaskStatus::Queued;
                task.approved_by = Some(approver.to_string());
                task.approved_at = Some(Utc::now());
                task.updated_at = Utc::now();
                Some(task.clone())
            } else {
                None
            }
        }))
    }

    async fn heartbeat(&self, id: Uuid, worker_id: &WorkerId) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        Ok(inner.tasks.get_mut(&id).is_some_and(|task| {
            if task.status == TaskStatus::InProgress
                && task.claimed_by.as_ref() == Some(worker_id)
            {
                task.last_heartbeat_at = Some(Utc::now());
                task.updated_at = Utc::now();
                true
            } else {
                false
            }
        }))
    }

    async fn requeue_stale(&self, now: DateTime<Utc>) -> Result<u32> {
        let mut inner = self.inner.lock().await;
        let mut swept = 0_u32;
        for task in inner.tasks.values_mut() {
            if task.is_stale(now) {
                task.status = TaskStatus::Queued;
                task.claimed_by = None;
                task.started_at = None;
                task.last_heartbeat_at = None;
                task.updated_at = now;
                swept += 1;
            }
        }
        Ok(swept)
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn set_with_ttl(&self, key: &str, value: Value, ttl: Duration) -> Result<()> {
        let deadline = Utc::now()
            + chrono::Duration::from_std(ttl)
                .map_err(|e| LedgerError::Internal(format!("TTL out of range: {e}")))?;
        self.inner
            .lock()
            .await
            .kv
            .insert(key.to_string(), (value, deadline));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        match inner.kv.get(key) {
            Some((_, deadline)) if *deadline <= now => {
                inner.kv.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.lock().await.kv.remove(key);
        Ok(())
    }
}
