#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

//! Batch consolidation pipeline. Stateless and re-entrant: all per-entry
//! state lives in the WAL's own status field, all batch progress in the
//! checkpoint store.

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::checkpoint::CheckpointManager;
use crate::collab::{EntityResolver, Extractor, RelationshipSink};
use crate::error::{LedgerError, Result};
use crate::types::{BatchCounters, BatchId, Checkpoint, WalEntry, WalStatus, WorkerId};
use crate::wal::WalService;

/// Per-entry processing outcome. `Skipped` covers both already-completed
/// entries and lost claim races; neither is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOutcome {
    Processed,
    Skipped,
    Failed,
}

pub struct ConsolidationPipeline {
    wal: Arc<WalService>,
    checkpoints: Arc<CheckpointManager>,
    extractor: Arc<dyn Extractor>,
    resolver: Arc<dyn EntityResolver>,
    sink: Arc<dyn RelationshipSink>,
    checkpoint_interval: usize,
    worker_id: WorkerId,
}

impl ConsolidationPipeline {
    #[must_use]
    pub fn new(
        wal: Arc<WalService>,
        checkpoints: Arc<CheckpointManager>,
        extractor: Arc<dyn Extractor>,
        resolver: Arc<dyn EntityResolver>,
        sink: Arc<dyn RelationshipSink>,
        checkpoint_interval: usize,
        worker_id: WorkerId,
    ) -> Self {
        Self {
            wal,
            checkpoints,
            extractor,
            resolver,
            sink,
            checkpoint_interval: checkpoint_interval.max(1),
            worker_id,
        }
    }

    /// Claims and consolidates one WAL entry. Entries that are already
    /// completed, or that another worker holds, are skipped.
    ///
    /// # Errors
    /// Returns an error only on store failure; processing failures are
    /// absorbed into the entry's retry protocol.
    pub async fn process_entry(&self, id: Uuid, checkpoint_id: Option<&str>) -> Result<EntryOutcome> {
        let Some(current) = self.wal.get_entry(id).await? else {
            warn!(entry_id = %id, "WAL entry vanished before processing");
            return Ok(EntryOutcome::Skipped);
        };
        if current.status == WalStatus::Completed {
            debug!(entry_id = %id, "Skipping already-completed WAL entry");
            return Ok(EntryOutcome::Skipped);
        }

        let Some(claimed) = self
            .wal
            .claim_entry(id, &self.worker_id, checkpoint_id)
            .await?
        else {
            debug!(entry_id = %id, "Lost claim race for WAL entry");
            return Ok(EntryOutcome::Skipped);
        };

        self.process_claimed(&claimed).await
    }

    /// Consolidates an entry this worker already holds a claim on.
    ///
    /// # Errors
    /// Returns an error only on store failure.
    pub async fn process_claimed(&self, entry: &WalEntry) -> Result<EntryOutcome> {
        match self.consolidate(entry).await {
            Ok(applied) => {
                self.wal.mark_completed(entry.id).await?;
                debug!(entry_id = %entry.id, relationships = applied, "Consolidated WAL entry");
                Ok(EntryOutcome::Processed)
            }
            Err(e) => {
                self.wal.mark_failed(entry.id, &e.to_string()).await?;
                Ok(EntryOutcome::Failed)
            }
        }
    }

    /// Processes a batch of entry ids in submission order, resuming from the
    /// last checkpoint when one exists. A checkpoint is written every
    /// `checkpoint_interval` entries and at the final entry, always before
    /// the loop advances past the boundary. On reaching the end the
    /// checkpoint is cleared.
    ///
    /// # Errors
    /// Returns an error on store or checkpoint failure.
    pub async fn process_batch(
        &self,
        batch_id: &BatchId,
        entry_ids: &[Uuid],
    ) -> Result<BatchCounters> {
        let (resume_index, mut counters) =
            (self.checkpoints.load(batch_id).await?).map_or((0, BatchCounters::default()), |cp| {
                info!(
                    batch_id = %batch_id,
                    resume_index = cp.resume_index(),
                    "Resuming batch from checkpoint"
                );
                (cp.resume_index(), cp.counters)
            });

        let checkpoint_id = batch_id.checkpoint_key();
        let last = entry_ids.len().saturating_sub(1);

        for (index, id) in entry_ids.iter().enumerate().skip(resume_index) {
            match self.process_entry(*id, Some(&checkpoint_id)).await? {
                EntryOutcome::Processed => counters.processed += 1,
                EntryOutcome::Skipped => counters.skipped += 1,
                EntryOutcome::Failed => counters.failed += 1,
            }

            if (index + 1) % self.checkpoint_interval == 0 || index == last {
                self.checkpoints
                    .save(&Checkpoint::new(batch_id.clone(), index, counters))
                    .await?;
            }
        }

        self.checkpoints.clear(batch_id).await?;
        info!(
            batch_id = %batch_id,
            processed = counters.processed,
            failed = counters.failed,
            skipped = counters.skipped,
            "Batch consolidation finished"
        );
        Ok(counters)
    }

    /// Extraction plus entity resolution plus relationship writes for one
    /// entry. Returns how many relationships were applied.
    async fn consolidate(&self, entry: &WalEntry) -> Result<usize> {
        let content = entry
            .raw_payload
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                LedgerError::WalError(format!("entry {} payload has no content field", entry.id))
            })?;
        let user = entry
            .raw_payload
            .get("user")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let known_entities = entry
            .raw_payload
            .get("known_entities")
            .and_then(Value::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let relationships = self.extractor.extract(content, &known_entities).await?;
        let mut applied = 0_usize;
        for relationship in &relationships {
            let subject = self.resolver.resolve(&relationship.subject, user).await?;
            let object = self.resolver.resolve(&relationship.object, user).await?;
            // Unconditional overwrite in WAL order: the newer entry's value
            // always wins, regardless of confidence or source.
            self.sink
                .upsert(subject.entity_id, object.entity_id, relationship)
                .await?;
            applied += 1;
        }
        Ok(applied)
    }
}

