mod backoff;
mod checkpoint;
mod identifiers;
mod task;
mod wal;

pub use backoff::{exponential_delay, BackoffTable};
pub use checkpoint::{BatchCounters, Checkpoint};
pub use identifiers::{BatchId, WorkerId};
pub use task::{ClaimOutcome, NewTask, RetryDecision, Task, TaskStatus};
pub use wal::{NewWalEntry, WalEntry, WalStatus};
