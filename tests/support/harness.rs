//! Shared recording collaborators for the integration suites. Everything runs
//! against `MemoryStore`, whose single-lock semantics match the transaction
//! boundaries of the Postgres store.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use ledger::collab::{
    AlertSink, EntityResolver, Extractor, Relationship, Resolution, ResolutionAction, Severity,
};
use ledger::scheduler::TaskDispatcher;
use ledger::{
    CheckpointManager, ConsolidationPipeline, LedgerConfig, LedgerError, MemoryStore, Result,
    Task, TaskScheduler, WalService, WorkerId,
};

/// Config tuned for tests: no task backoff delay, tight checkpoint interval.
pub fn test_config() -> LedgerConfig {
    let mut config = LedgerConfig::default();
    config.task_backoff_base = Duration::ZERO;
    config.checkpoint_interval = 2;
    config
}

#[derive(Default)]
pub struct RecordingAlertSink {
    events: Mutex<Vec<(Severity, String)>>,
}

impl RecordingAlertSink {
    pub async fn events(&self) -> Vec<(Severity, String)> {
        self.events.lock().await.clone()
    }

    pub async fn count(&self, severity: Severity) -> usize {
        self.events
            .lock()
            .await
            .iter()
            .filter(|(s, _)| *s == severity)
            .count()
    }
}

#[async_trait]
impl AlertSink for RecordingAlertSink {
    async fn notify(&self, severity: Severity, message: &str) {
        self.events
            .lock()
            .await
            .push((severity, message.to_string()));
    }
}

#[derive(Default)]
pub struct RecordingDispatcher {
    dispatched: Mutex<Vec<Uuid>>,
}

impl RecordingDispatcher {
    pub async fn dispatched(&self) -> Vec<Uuid> {
        self.dispatched.lock().await.clone()
    }

    pub async fn dispatch_count(&self, task_id: Uuid) -> usize {
        self.dispatched
            .lock()
            .await
            .iter()
            .filter(|id| **id == task_id)
            .count()
    }
}

#[async_trait]
impl TaskDispatcher for RecordingDispatcher {
    async fn dispatch(&self, task: Task) -> Result<()> {
        self.dispatched.lock().await.push(task.id);
        Ok(())
    }
}

/// Extractor that errors a fixed number of times before yielding its
/// configured relationships. Zero failures makes it a plain stub.
pub struct FlakyExtractor {
    failures_remaining: Mutex<u32>,
    relationships: Vec<Relationship>,
}

impl FlakyExtractor {
    pub fn new(failures: u32, relationships: Vec<Relationship>) -> Self {
        Self {
            failures_remaining: Mutex::new(failures),
            relationships,
        }
    }
}

#[async_trait]
impl Extractor for FlakyExtractor {
    async fn extract(&self, _content: &str, _known: &[String]) -> Result<Vec<Relationship>> {
        let mut remaining = self.failures_remaining.lock().await;
        if *remaining > 0 {
            *remaining -= 1;
            return Err(LedgerError::Internal("extractor outage".to_string()));
        }
        Ok(self.relationships.clone())
    }
}

/// Resolver that derives a stable id from the entity name alone.
pub struct StubResolver;

#[async_trait]
impl EntityResolver for StubResolver {
    async fn resolve(&self, entity_name: &str, _user: &str) -> Result<Resolution> {
        let mut bytes = [0_u8; 16];
        for (i, b) in entity_name.bytes().enumerate() {
            bytes[i % 16] ^= b;
        }
        Ok(Resolution {
            action: ResolutionAction::Updated,
            entity_id: Uuid::from_bytes(bytes),
        })
    }
}

#[derive(Default)]
pub struct RecordingSink {
    upserts: Mutex<Vec<(Uuid, Uuid, String)>>,
}

impl RecordingSink {
    pub async fn upserts(&self) -> Vec<(Uuid, Uuid, String)> {
        self.upserts.lock().await.clone()
    }
}

#[async_trait]
impl ledger::RelationshipSink for RecordingSink {
    async fn upsert(
        &self,
        subject_id: Uuid,
        object_id: Uuid,
        relationship: &Relationship,
    ) -> Result<()> {
        self.upserts
            .lock()
            .await
            .push((subject_id, object_id, relationship.predicate.clone()));
        Ok(())
    }
}

pub struct TestRig {
    pub store: Arc<MemoryStore>,
    pub alerts: Arc<RecordingAlertSink>,
    pub wal: Arc<WalService>,
    pub checkpoints: Arc<CheckpointManager>,
}

impl TestRig {
    pub fn new(config: &LedgerConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let alerts = Arc::new(RecordingAlertSink::default());
        let wal = Arc::new(WalService::new(store.clone(), alerts.clone(), config));
        let checkpoints = Arc::new(CheckpointManager::new(
            store.clone(),
            config.checkpoint_ttl,
        ));
        Self {
            store,
            alerts,
            wal,
            checkpoints,
        }
    }

    /// Pipeline wired with the given extractor; resolver and sink are stubs.
    pub fn pipeline(
        &self,
        config: &LedgerConfig,
        extractor: Arc<dyn Extractor>,
        sink: Arc<RecordingSink>,
    ) -> ConsolidationPipeline {
        ConsolidationPipeline::new(
            self.wal.clone(),
            self.checkpoints.clone(),
            extractor,
            Arc::new(StubResolver),
            sink,
            config.checkpoint_interval,
            WorkerId::new("pipeline-test"),
        )
    }

    /// Scheduler over the shared store with a recording dispatcher.
    pub fn scheduler(
        &self,
        config: &LedgerConfig,
        dispatcher: Arc<RecordingDispatcher>,
    ) -> TaskScheduler {
        TaskScheduler::new(self.store.clone(), dispatcher, self.alerts.clone(), config)
    }
}

/// Payload a `FlakyExtractor`-driven pipeline can consolidate.
pub fn event_payload(content: &str) -> Value {
    serde_json::json!({ "content": content, "user": "tester" })
}

pub fn relationship(subject: &str, predicate: &str, object: &str) -> Relationship {
    Relationship {
        subject: subject.to_string(),
        predicate: predicate.to_string(),
        object: object.to_string(),
        attributes: serde_json::Map::new(),
    }
}
