#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{LedgerError, Result};
use crate::store::WalStore;
use crate::types::{NewWalEntry, WalEntry, WorkerId};

use super::mappers::{parse_wal_entry, WalEntryRow, WAL_COLUMNS};
use super::LedgerDb;

#[async_trait]
impl WalStore for LedgerDb {
    async fn insert_or_get(&self, entry: NewWalEntry) -> Result<(WalEntry, bool)> {
        let inserted = sqlx::query_as::<_, WalEntryRow>(&format!(
            "INSERT INTO wal_entries (id, idempotency_key, raw_payload)
             VALUES ($1, $2, $3)
             ON CONFLICT (idempotency_key) DO NOTHING
             RETURNING {WAL_COLUMNS}"
        ))
        .bind(entry.id)
        .bind(&entry.idempotency_key)
        .bind(&entry.raw_payload)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| LedgerError::DatabaseError(format!("Failed to append WAL entry: {e}")))?;

        if let Some(row) = inserted {
            return Ok((parse_wal_entry(row)?, true));
        }

        // Duplicate within the dedup window; hand back the winner.
        let existing = sqlx::query_as::<_, WalEntryRow>(&format!(
            "SELECT {WAL_COLUMNS} FROM wal_entries WHERE idempotency_key = $1"
        ))
        .bind(&entry.idempotency_key)
        .fetch_one(self.pool())
        .await
        .map_err(|e| {
            LedgerError::DatabaseError(format!("Failed to load deduplicated WAL entry: {e}"))
        })?;

        Ok((parse_wal_entry(existing)?, false))
    }

    async fn get_entry(&self, id: Uuid) -> Result<Option<WalEntry>> {
        sqlx::query_as::<_, WalEntryRow>(&format!(
            "SELECT {WAL_COLUMNS} FROM wal_entries WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| LedgerError::DatabaseError(format!("Failed to load WAL entry: {e}")))?
        .map(parse_wal_entry)
        .transpose()
    }

    async fn claim_batch(
        &self,
        worker_id: &WorkerId,
        checkpoint_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<WalEntry>> {
        // Lock-and-skip select plus the status update in one statement, so a
        // crash between select and update cannot leave a half-claimed row.
        let rows = sqlx::query_as::<_, WalEntryRow>(&format!(
            "UPDATE wal_entries
             SET status = 'processing',
                 claimed_by = $1,
                 checkpoint_id = $2,
                 updated_at = NOW()
             WHERE id IN (
                 SELECT id FROM wal_entries
                 WHERE status = 'pending'
                   AND (next_retry_at IS NULL OR next_retry_at <= NOW())
                 ORDER BY created_at ASC
                 FOR UPDATE SKIP LOCKED
                 LIMIT $3
             )
             RETURNING {WAL_COLUMNS}"
        ))
        .bind(worker_id.value())
        .bind(checkpoint_id)
        .bind(i64::from(limit))
        .fetch_all(self.pool())
        .await
        .map_err(|e| LedgerError::DatabaseError(format!("Failed to claim WAL batch: {e}")))?;

        let mut entries = rows
            .into_iter()
            .map(parse_wal_entry)
            .collect::<Result<Vec<_>>>()?;
        // RETURNING order is unspecified; restore submission order.
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(entries)
    }

    async fn claim_entry(
        &self,
        id: Uuid,
        worker_id: &WorkerId,
        checkpoint_id: Option<&str>,
    ) -> Result<Option<WalEntry>> {
        sqlx::query_as::<_, WalEntryRow>(&format!(
            "UPDATE wal_entries
             SET status = 'processing',
                 claimed_by = $2,
                 checkpoint_id = $3,
                 updated_at = NOW()
             WHERE id = $1
               AND status = 'pending'
               AND (next_retry_at IS NULL OR next_retry_at <= NOW())
             RETURNING {WAL_COLUMNS}"
        ))
        .bind(id)
        .bind(worker_id.value())
        .bind(checkpoint_id)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| LedgerError::DatabaseError(format!("Failed to claim WAL entry: {e}")))?
        .map(parse_wal_entry)
        .transpose()
    }

    async fn mark_completed(&self, id: Uuid) -> Result<WalEntry> {
        let row = sqlx::query_as::<_, WalEntryRow>(&format!(
            "UPDATE wal_entries
             SET status = 'completed',
                 next_retry_at = NULL,
                 updated_at = NOW()
             WHERE id = $1
             RETURNING {WAL_COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| LedgerError::DatabaseError(format!("Failed to complete WAL entry: {e}")))?
        .ok_or_else(|| LedgerError::NotFound(format!("WAL entry {id}")))?;

        parse_wal_entry(row)
    }

    async fn record_failure(
        &self,
        id: Uuid,
        error: &str,
        requeue_at: Option<DateTime<Utc>>,
    ) -> Result<WalEntry> {
        let row = if let Some(at) = requeue_at {
            sqlx::query_as::<_, WalEntryRow>(&format!(
                "UPDATE wal_entries
                 SET status = 'pending',
                     retry_count = retry_count + 1,
                     next_retry_at = $2,
                     last_error = $3,
                     claimed_by = NULL,
                     updated_at = NOW()
                 WHERE id = $1
                 RETURNING {WAL_COLUMNS}"
            ))
            .bind(id)
            .bind(at)
            .bind(error)
            .fetch_optional(self.pool())
            .await
        } else {
            sqlx::query_as::<_, WalEntryRow>(&format!(
                "UPDATE wal_entries
                 SET status = 'failed',
                     retry_count = retry_count + 1,
                     next_retry_at = NULL,
                     last_error = $2,
                     claimed_by = NULL,
                     updated_at = NOW()
                 WHERE id = $1
                 RETURNING {WAL_COLUMNS}"
            ))
            .bind(id)
            .bind(error)
            .fetch_optional(self.pool())
            .await
        }
        .map_err(|e| LedgerError::DatabaseError(format!("Failed to record WAL failure: {e}")))?
        .ok_or_else(|| LedgerError::NotFound(format!("WAL entry {id}")))?;

        parse_wal_entry(row)
    }
}
