#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::identifiers::WorkerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl WalStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl TryFrom<&str> for WalStatus {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown WAL status: {s}")),
        }
    }
}

/// A durably recorded fast-path event awaiting asynchronous consolidation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    pub id: Uuid,
    pub idempotency_key: String,
    pub status: WalStatus,
    pub raw_payload: Value,
    pub claimed_by: Option<WorkerId>,
    pub retry_count: u32,
    pub checkpoint_id: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert payload for `WalStore::insert_or_get`. The store assigns timestamps.
#[derive(Debug, Clone)]
pub struct NewWalEntry {
    pub id: Uuid,
    pub idempotency_key: String,
    pub raw_payload: Value,
}

impl NewWalEntry {
    #[must_use]
    pub fn new(idempotency_key: String, raw_payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            idempotency_key,
            raw_payload,
        }
    }
}
