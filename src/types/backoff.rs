#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry delays indexed by attempt number. Attempt 1 uses the first entry;
/// attempts past the end of the table reuse the last entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffTable {
    delays: Vec<Duration>,
}

impl BackoffTable {
    #[must_use]
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    /// The WAL retry schedule: 30 seconds, 5 minutes, 15 minutes.
    #[must_use]
    pub fn wal_default() -> Self {
        Self::new(vec![
            Duration::from_secs(30),
            Duration::from_secs(5 * 60),
            Duration::from_secs(15 * 60),
        ])
    }

    /// Delay for the given 1-based retry attempt. Returns `None` for
    /// attempt 0 (no retry has happened) or an empty table.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 {
            return None;
        }
        let index = usize::try_from(attempt - 1).ok()?;
        self.delays
            .get(index.min(self.delays.len().checked_sub(1)?))
            .copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.delays.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.delays.is_empty()
    }
}

/// Exponential backoff for task retries: `base * 2^(attempt - 1)`, capped so
/// the shift cannot overflow.
#[must_use]
pub fn exponential_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1_u32 << exponent)
}
