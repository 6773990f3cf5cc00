#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

//! Write-ahead log service: durable, idempotent recording of fast-path
//! events, claim-for-processing, and the bounded-retry failure protocol.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::collab::{AlertSink, Severity};
use crate::config::LedgerConfig;
use crate::error::{LedgerError, Result};
use crate::store::WalStore;
use crate::types::{BackoffTable, NewWalEntry, WalEntry, WorkerId};

pub struct WalService {
    store: Arc<dyn WalStore>,
    alerts: Arc<dyn AlertSink>,
    dedup_window_ms: u64,
    max_attempts: u32,
    backoff: BackoffTable,
}

impl WalService {
    #[must_use]
    pub fn new(store: Arc<dyn WalStore>, alerts: Arc<dyn AlertSink>, config: &LedgerConfig) -> Self {
        Self {
            store,
            alerts,
            dedup_window_ms: config.dedup_window_ms,
            max_attempts: config.wal_max_attempts,
            backoff: config.wal_backoff.clone(),
        }
    }

    /// Records a fast-path event. Duplicate payloads within the dedup window
    /// return the existing entry; this never raises for duplicate input.
    ///
    /// # Errors
    /// Returns an error only when the store itself fails.
    pub async fn append(&self, payload: Value) -> Result<WalEntry> {
        let key = idempotency_key(&payload, self.dedup_window_ms, Utc::now());
        let (entry, inserted) = self
            .store
            .insert_or_get(NewWalEntry::new(key, payload))
            .await?;

        if inserted {
            debug!(entry_id = %entry.id, "Appended WAL entry");
        } else {
            debug!(entry_id = %entry.id, "Deduplicated WAL append");
        }
        Ok(entry)
    }

    /// # Errors
    /// Returns an error if the store fails. An empty result is normal.
    pub async fn claim_batch(&self, worker_id: &WorkerId, limit: u32) -> Result<Vec<WalEntry>> {
        self.store.claim_batch(worker_id, None, limit).await
    }

    /// Claims one specific entry on behalf of a checkpointed batch. `None`
    /// means contention or a non-pending entry; both are normal.
    ///
    /// # Errors
    /// Returns an error if the store fails.
    pub async fn claim_entry(
        &self,
        id: Uuid,
        worker_id: &WorkerId,
        checkpoint_id: Option<&str>,
    ) -> Result<Option<WalEntry>> {
        self.store.claim_entry(id, worker_id, checkpoint_id).await
    }

    /// # Errors
    /// Returns an error if the store fails.
    pub async fn get_entry(&self, id: Uuid) -> Result<Option<WalEntry>> {
        self.store.get_entry(id).await
    }

    /// Terminal success. Emits a recovery signal when earlier attempts
    /// failed, so operators see the entry healed rather than silent.
    ///
    /// # Errors
    /// Returns an error if the store fails or the entry does not exist.
    pub async fn mark_completed(&self, id: Uuid) -> Result<WalEntry> {
        let entry = self.store.mark_completed(id).await?;
        if entry.retry_count > 0 {
            self.alerts
                .notify(
                    Severity::Info,
                    &format!(
                        "WAL entry {id} recovered after {} failed attempt(s)",
                        entry.retry_count
                    ),
                )
                .await;
        }
        info!(entry_id = %id, "WAL entry completed");
        Ok(entry)
    }

    /// Failure protocol: requeue with the next backoff delay while attempts
    /// remain, otherwise terminal failure plus a critical alert.
    ///
    /// # Errors
    /// Returns an error if the store fails or the entry does not exist.
    pub async fn mark_failed(&self, id: Uuid, error_message: &str) -> Result<WalEntry> {
        let entry = self
            .store
            .get_entry(id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("WAL entry {id}")))?;

        let attempt = entry.retry_count + 1;
        if attempt < self.max_attempts {
            let delay = self.backoff.delay_for_attempt(attempt).unwrap_or_default();
            let requeue_at = Utc::now() + clamp_to_chrono(delay);
            warn!(
                entry_id = %id,
                attempt,
                delay_secs = delay.as_secs(),
                "WAL entry failed, scheduling retry"
            );
            self.store
                .record_failure(id, error_message, Some(requeue_at))
                .await
        } else {
            error!(entry_id = %id, attempt, "WAL entry failed permanently");
            let failed = self.store.record_failure(id, error_message, None).await?;
            self.alerts
                .notify(
                    Severity::Critical,
                    &format!(
                        "WAL entry {id} failed permanently after {attempt} attempt(s): {error_message}"
                    ),
                )
                .await;
            Ok(failed)
        }
    }
}

fn clamp_to_chrono(delay: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::MAX)
}

/// Content hash plus a coarse time bucket. Two identical payloads appended
/// within the same window collapse to one key; the same payload much later
/// hashes to a fresh key.
#[must_use]
pub fn idempotency_key(payload: &Value, window_ms: u64, now: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    if let Ok(window) = i64::try_from(window_ms) {
        if window > 0 {
            let bucket = now.timestamp_millis().div_euclid(window);
            hasher.update(bucket.to_be_bytes());
        }
    }
    format!("{:x}", hasher.finalize())
}
