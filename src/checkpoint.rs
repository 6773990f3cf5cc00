#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

//! Checkpoint persistence for batch jobs. Pure storage wrapper: `save` is an
//! idempotent overwrite, `load` after a crash returns the last saved state,
//! and TTL expiry means the batch restarts from zero, which is a correct
//! outcome because downstream writes are idempotent.

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::Result;
use crate::store::CheckpointStore;
use crate::types::{BatchId, Checkpoint};

pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    ttl: Duration,
}

impl CheckpointManager {
    #[must_use]
    pub fn new(store: Arc<dyn CheckpointStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// # Errors
    /// Returns an error if the checkpoint store fails or the checkpoint
    /// cannot be serialized.
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let key = checkpoint.batch_id.checkpoint_key();
        let value = serde_json::to_value(checkpoint)?;
        self.store.set_with_ttl(&key, value, self.ttl).await?;
        debug!(
            batch_id = %checkpoint.batch_id,
            last_index = checkpoint.last_processed_index,
            "Saved checkpoint"
        );
        Ok(())
    }

    /// # Errors
    /// Returns an error if the checkpoint store fails. A missing or expired
    /// checkpoint is `Ok(None)`, never an error.
    pub async fn load(&self, batch_id: &BatchId) -> Result<Option<Checkpoint>> {
        let Some(value) = self.store.get(&batch_id.checkpoint_key()).await? else {
            return Ok(None);
        };
        // A checkpoint we cannot deserialize is as good as a missing one:
        // the batch restarts from zero instead of failing.
        match serde_json::from_value(value) {
            Ok(checkpoint) => Ok(Some(checkpoint)),
            Err(e) => {
                debug!(batch_id = %batch_id, "Discarding unreadable checkpoint: {e}");
                Ok(None)
            }
        }
    }

    /// # Errors
    /// Returns an error if the checkpoint store fails.
    pub async fn clear(&self, batch_id: &BatchId) -> Result<()> {
        self.store.delete(&batch_id.checkpoint_key()).await?;
        debug!(batch_id = %batch_id, "Cleared checkpoint");
        Ok(())
    }
}
