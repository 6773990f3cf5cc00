#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

//! Durable ingestion core: an idempotent write-ahead log over Postgres, a
//! checkpointed batch consolidation pipeline, and a dependency-aware task
//! scheduler with bounded retry and automatic downstream dispatch.

pub mod checkpoint;
pub mod collab;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod scheduler;
pub mod store;
pub mod types;
pub mod wal;
pub mod worker;

pub use checkpoint::CheckpointManager;
pub use collab::{AlertSink, EntityResolver, Extractor, LogAlertSink, RelationshipSink};
pub use config::LedgerConfig;
pub use error::{LedgerError, Result};
pub use pipeline::{ConsolidationPipeline, EntryOutcome};
pub use scheduler::{TaskDispatcher, TaskScheduler};
pub use store::{CheckpointStore, LedgerDb, MemoryStore, TaskStore, WalStore};
pub use types::{
    BatchCounters, BatchId, Checkpoint, ClaimOutcome, NewTask, NewWalEntry, RetryDecision, Task,
    TaskStatus, WalEntry, WalStatus, WorkerId,
};
pub use wal::WalService;
pub use worker::{QueueDispatcher, TaskExecutor};
