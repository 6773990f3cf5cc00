#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::{LedgerError, Result};
use crate::types::{Task, TaskStatus, WalEntry, WalStatus, WorkerId};

pub const WAL_COLUMNS: &str = "id, idempotency_key, status, raw_payload, claimed_by, \
     retry_count, checkpoint_id, next_retry_at, last_error, created_at, updated_at";

pub const TASK_COLUMNS: &str = "id, role, status, priority, payload, result, error, \
     retry_count, max_retries, next_retry_at, is_retryable, approval_required, \
     approved_by, approved_at, session_id, created_by, claimed_by, started_at, \
     timeout_seconds, last_heartbeat_at, created_at, updated_at";

#[derive(FromRow)]
pub struct WalEntryRow {
    id: Uuid,
    idempotency_key: String,
    status: String,
    raw_payload: Value,
    claimed_by: Option<String>,
    retry_count: i32,
    checkpoint_id: Option<String>,
    next_retry_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

pub fn parse_wal_entry(row: WalEntryRow) -> Result<WalEntry> {
    let status = WalStatus::try_from(row.status.as_str()).map_err(LedgerError::DatabaseError)?;
    Ok(WalEntry {
        id: row.id,
        idempotency_key: row.idempotency_key,
        status,
        raw_payload: row.raw_payload,
        claimed_by: row.claimed_by.map(WorkerId::new),
        retry_count: to_u32(row.retry_count),
        checkpoint_id: row.checkpoint_id,
        next_retry_at: row.next_retry_at,
        last_error: row.last_error,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}

#[derive(FromRow)]
pub struct TaskRow {
    id: Uuid,
    role: String,
    status: String,
    priority: i32,
    payload: Value,
    result: Option<Value>,
    error: Option<String>,
    retry_count: i32,
    max_retries: i32,
    next_retry_at: Option<DateTime<Utc>>,
    is_retryable: bool,
    approval_required: bool,
    approved_by: Option<String>,
    approved_at: Option<DateTime<Utc>>,
    session_id: Option<String>,
    created_by: Option<String>,
    claimed_by: Option<String>,
    started_at: Option<DateTime<Utc>>,
    timeout_seconds: i32,
    last_heartbeat_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TaskRow {
    pub const fn id(&self) -> Uuid {
        self.id
    }
}

pub fn parse_task(row: TaskRow, depends_on: Vec<Uuid>) -> Result<Task> {
    let status = TaskStatus::try_from(row.status.as_str()).map_err(LedgerError::DatabaseError)?;
    Ok(Task {
        id: row.id,
        role: row.role,
        status,
        priority: row.priority,
        payload: row.payload,
        depends_on,
        result: row.result,
        error: row.error,
        retry_count: to_u32(row.retry_count),
        max_retries: to_u32(row.max_retries),
        next_retry_at: row.next_retry_at,
        is_retryable: row.is_retryable,
        approval_required: row.approval_required,
        approved_by: row.approved_by,
        approved_at: row.approved_at,
        session_id: row.session_id,
        created_by: row.created_by,
        claimed_by: row.claimed_by.map(WorkerId::new),
        started_at: row.started_at,
        timeout_seconds: to_u32(row.timeout_seconds),
        last_heartbeat_at: row.last_heartbeat_at,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}

pub const fn to_u32(value: i32) -> u32 {
    if value < 0 {
        0
    } else {
        value.cast_unsigned()
    }
}
