#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::identifiers::BatchId;

/// Progress counters carried in checkpoint metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounters {
    pub processed: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl BatchCounters {
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.processed + self.failed + self.skipped
    }
}

/// Persisted marker of batch progress. A resumed batch continues at
/// `last_processed_index + 1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub batch_id: BatchId,
    pub last_processed_index: usize,
    pub counters: BatchCounters,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl Checkpoint {
    #[must_use]
    pub fn new(batch_id: BatchId, last_processed_index: usize, counters: BatchCounters) -> Self {
        Self {
            batch_id,
            last_processed_index,
            counters,
            metadata: Map::new(),
            timestamp: Utc::now(),
        }
    }

    /// Index at which a resumed batch continues.
    #[must_use]
    pub const fn resume_index(&self) -> usize {
        self.last_processed_index + 1
    }
}
