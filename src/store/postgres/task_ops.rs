#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::Acquire;
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{LedgerError, Result};
use crate::store::TaskStore;
use crate::types::{NewTask, Task, TaskStatus, WorkerId};

use super::mappers::{parse_task, to_u32, TaskRow, TASK_COLUMNS};
use super::LedgerDb;

impl LedgerDb {
    async fn edges_for(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, Vec<Uuid>>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query_as::<_, (Uuid, Uuid)>(
            "SELECT task_id, depends_on_id FROM task_edges WHERE task_id = ANY($1)",
        )
        .bind(ids)
        .fetch_all(self.pool())
        .await
        .map_err(|e| LedgerError::DatabaseError(format!("Failed to load task edges: {e}")))?;

        let mut edges: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for (task_id, depends_on_id) in rows {
            edges.entry(task_id).or_default().push(depends_on_id);
        }
        Ok(edges)
    }

    async fn hydrate(&self, rows: Vec<TaskRow>) -> Result<Vec<Task>> {
        let ids = rows.iter().map(TaskRow::id).collect::<Vec<_>>();
        let mut edges = self.edges_for(&ids).await?;
        rows.into_iter()
            .map(|row| {
                let deps = edges.remove(&row.id()).unwrap_or_default();
                parse_task(row, deps)
            })
            .collect()
    }

    async fn hydrate_one(&self, row: TaskRow) -> Result<Task> {
        let mut edges = self.edges_for(&[row.id()]).await?;
        let deps = edges.remove(&row.id()).unwrap_or_default();
        parse_task(row, deps)
    }
}

#[async_trait]
impl TaskStore for LedgerDb {
    async fn insert_task(&self, task: NewTask, initial_status: TaskStatus) -> Result<Task> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| LedgerError::DatabaseError(format!("Failed to begin tx: {e}")))?;

        let conn = tx
            .acquire()
            .await
            .map_err(|e| LedgerError::DatabaseError(format!("Failed to acquire tx conn: {e}")))?;

        let id = task.id.unwrap_or_else(Uuid::new_v4);
        let max_retries = task.max_retries.unwrap_or(3);

        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "INSERT INTO tasks (id, role, status, priority, payload, max_retries,
                                is_retryable, approval_required, session_id,
                                created_by, timeout_seconds)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(id)
        .bind(&task.role)
        .bind(initial_status.as_str())
        .bind(task.priority)
        .bind(&task.payload)
        .bind(max_retries.cast_signed())
        .bind(task.is_retryable)
        .bind(task.approval_required)
        .bind(&task.session_id)
        .bind(&task.created_by)
        .bind(task.timeout_seconds.cast_signed())
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| LedgerError::DatabaseError(format!("Failed to insert task: {e}")))?;

        for depends_on in &task.depends_on {
            sqlx::query(
                "INSERT INTO task_edges (task_id, depends_on_id)
                 VALUES ($1, $2)
                 ON CONFLICT (task_id, depends_on_id) DO NOTHING",
            )
            .bind(id)
            .bind(depends_on)
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                LedgerError::DatabaseError(format!("Failed to insert task edge: {e}"))
            })?;
        }

        tx.commit()
            .await
            .map_err(|e| LedgerError::DatabaseError(format!("Failed to commit tx: {e}")))?;

        parse_task(row, task.depends_on)
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| LedgerError::DatabaseError(format!("Failed to load task: {e}")))?;

        match row {
            Some(row) => Ok(Some(self.hydrate_one(row).await?)),
            None => Ok(None),
        }
    }

    async fn get_tasks(&self, ids: &[Uuid]) -> Result<Vec<Task>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE id = ANY($1) ORDER BY created_at ASC"
        ))
        .bind(ids)
        .fetch_all(self.pool())
        .await
        .map_err(|e| LedgerError::DatabaseError(format!("Failed to load tasks: {e}")))?;

        self.hydrate(rows).await
    }

    async fn dependency_edges(&self) -> Result<HashMap<Uuid, Vec<Uuid>>> {
        let rows = sqlx::query_as::<_, (Uuid, Uuid)>(
            "SELECT task_id, depends_on_id FROM task_edges",
        )
        .fetch_all(self.pool())
        .await
        .map_err(|e| LedgerError::DatabaseError(format!("Failed to load edge snapshot: {e}")))?;

        let mut edges: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for (task_id, depends_on_id) in rows {
            edges.entry(task_id).or_default().push(depends_on_id);
        }
        Ok(edges)
    }

    async fn insert_edge(&self, task_id: Uuid, depends_on: Uuid) -> Result<()> {
        sqlx::query(
            "INSERT INTO task_edges (task_id, depends_on_id)
             VALUES ($1, $2)
             ON CONFLICT (task_id, depends_on_id) DO NOTHING",
        )
        .bind(task_id)
        .bind(depends_on)
        .execute(self.pool())
        .await
        .map(|_result| ())
        .map_err(|e| LedgerError::DatabaseError(format!("Failed to insert task edge: {e}")))
    }

    async fn try_claim(&self, id: Uuid, worker_id: &WorkerId) -> Result<Option<Task>> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "UPDATE tasks
             SET status = 'in_progress',
                 claimed_by = $2,
                 started_at = NOW(),
                 last_heartbeat_at = NOW(),
                 updated_at = NOW()
             WHERE id = $1
               AND status = 'queued'
               AND (next_retry_at IS NULL OR next_retry_at <= NOW())
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(id)
        .bind(worker_id.value())
        .fetch_optional(self.pool())
        .await
        .map_err(|e| LedgerError::DatabaseError(format!("Failed to claim task: {e}")))?;

        match row {
            Some(row) => Ok(Some(self.hydrate_one(row).await?)),
            None => Ok(None),
        }
    }

    async fn complete(&self, id: Uuid, result: Value) -> Result<(Task, bool)> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "UPDATE tasks
             SET status = 'completed',
                 result = $2,
                 next_retry_at = NULL,
                 updated_at = NOW()
             WHERE id = $1
               AND status IN ('in_progress', 'queued')
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(id)
        .bind(&result)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| LedgerError::DatabaseError(format!("Failed to complete task: {e}")))?;

        if let Some(row) = row {
            return Ok((self.hydrate_one(row).await?, true));
        }

        let existing = self
            .get_task(id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("task {id}")))?;
        Ok((existing, false))
    }

    async fn record_task_failure(
        &self,
        id: Uuid,
        error: &str,
        requeue_at: Option<DateTime<Utc>>,
    ) -> Result<Task> {
        let row = if let Some(at) = requeue_at {
            sqlx::query_as::<_, TaskRow>(&format!(
                "UPDATE tasks
                 SET status = 'queued',
                     retry_count = retry_count + 1,
                     next_retry_at = $2,
                     error = $3,
                     claimed_by = NULL,
                     updated_at = NOW()
                 WHERE id = $1
                 RETURNING {TASK_COLUMNS}"
            ))
            .bind(id)
            .bind(at)
            .bind(error)
            .fetch_optional(self.pool())
            .await
        } else {
            sqlx::query_as::<_, TaskRow>(&format!(
                "UPDATE tasks
                 SET status = 'failed',
                     next_retry_at = NULL,
                     error = $2,
                     claimed_by = NULL,
                     updated_at = NOW()
                 WHERE id = $1
                 RETURNING {TASK_COLUMNS}"
            ))
            .bind(id)
            .bind(error)
            .fetch_optional(self.pool())
            .await
        }
        .map_err(|e| LedgerError::DatabaseError(format!("Failed to record task failure: {e}")))?
        .ok_or_else(|| LedgerError::NotFound(format!("task {id}")))?;

        self.hydrate_one(row).await
    }

    async fn fail_for_dependency(&self, id: Uuid, reason: &str) -> Result<Option<Task>> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "UPDATE tasks
             SET status = 'failed',
                 error = $2,
                 next_retry_at = NULL,
                 updated_at = NOW()
             WHERE id = $1
               AND status IN ('queued', 'awaiting_approval')
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(id)
        .bind(reason)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| {
            LedgerError::DatabaseError(format!("Failed to cascade dependency failure: {e}"))
        })?;

        match row {
            Some(row) => Ok(Some(self.hydrate_one(row).await?)),
            None => Ok(None),
        }
    }

    async fn direct_dependents(&self, id: Uuid) -> Result<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE id IN (SELECT task_id FROM task_edges WHERE depends_on_id = $1)
             ORDER BY created_at ASC"
        ))
        .bind(id)
        .fetch_all(self.pool())
        .await
        .map_err(|e| LedgerError::DatabaseError(format!("Failed to load dependents: {e}")))?;

        self.hydrate(rows).await
    }

    async fn claimable_ready(&self, limit: u32) -> Result<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks t
             WHERE t.status = 'queued'
               AND (t.next_retry_at IS NULL OR t.next_retry_at <= NOW())
               AND NOT EXISTS (
                   SELECT 1 FROM task_edges e
                   JOIN tasks d ON d.id = e.depends_on_id
                   WHERE e.task_id = t.id AND d.status <> 'completed'
               )
             ORDER BY t.priority DESC, t.created_at ASC
             LIMIT $1"
        ))
        .bind(i64::from(limit))
        .fetch_all(self.pool())
        .await
        .map_err(|e| LedgerError::DatabaseError(format!("Failed to load ready tasks: {e}")))?;

        self.hydrate(rows).await
    }

    async fn approve(&self, id: Uuid, approver: &str) -> Result<Option<Task>> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "UPDATE tasks
             SET status = 'queued',
                 approved_by = $2,
                 approved_at = NOW(),
                 updated_at = NOW()
             WHERE id = $1
               AND status = 'awaiting_approval'
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(id)
        .bind(approver)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| LedgerError::DatabaseError(format!("Failed to approve task: {e}")))?;

        match row {
            Some(row) => Ok(Some(self.hydrate_one(row).await?)),
            None => Ok(None),
        }
    }

    async fn heartbeat(&self, id: Uuid, worker_id: &WorkerId) -> Result<bool> {
        sqlx::query(
            "UPDATE tasks
             SET last_heartbeat_at = NOW(), updated_at = NOW()
             WHERE id = $1
               AND status = 'in_progress'
               AND claimed_by = $2",
        )
        .bind(id)
        .bind(worker_id.value())
        .execute(self.pool())
        .await
        .map(|rows| rows.rows_affected() > 0)
        .map_err(|e| LedgerError::DatabaseError(format!("Failed to heartbeat task: {e}")))
    }

    async fn requeue_stale(&self, now: DateTime<Utc>) -> Result<u32> {
        sqlx::query(
            "UPDATE tasks
             SET status = 'queued',
                 claimed_by = NULL,
                 started_at = NULL,
                 last_heartbeat_at = NULL,
                 updated_at = NOW()
             WHERE status = 'in_progress'
               AND COALESCE(last_heartbeat_at, started_at)
                   + make_interval(secs => timeout_seconds) <= $1",
        )
        .bind(now)
        .execute(self.pool())
        .await
        .map(|rows| to_u32(i32::try_from(rows.rows_affected()).unwrap_or(i32::MAX)))
        .map_err(|e| LedgerError::DatabaseError(format!("Failed to requeue stale tasks: {e}")))
    }
}
