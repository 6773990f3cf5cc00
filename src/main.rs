#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use ledger::collab::{EntityResolver, Extractor, Relationship, Resolution, ResolutionAction};
use ledger::{
    CheckpointManager, ConsolidationPipeline, LedgerConfig, LedgerDb, LedgerError, LogAlertSink,
    NewTask, QueueDispatcher, RelationshipSink, Result, Task, TaskExecutor, TaskScheduler,
    WalService, WorkerId,
};

#[derive(Parser)]
#[command(name = "ledger")]
#[command(about = "Durable ingestion WAL and dependency-aware task scheduling")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize database schema
    InitDb,

    /// Append one event to the write-ahead log
    Append {
        /// Event payload as a JSON object
        payload: String,
    },

    /// Create a task
    CreateTask {
        /// Task role
        role: String,

        /// Task payload as a JSON object
        #[arg(default_value = "{}")]
        payload: String,

        /// Dependency task ids
        #[arg(short, long)]
        depends_on: Vec<Uuid>,

        /// Queue priority (higher first)
        #[arg(short, long, default_value = "0")]
        priority: i32,

        /// Hold the task until a human approves it
        #[arg(long)]
        approval_required: bool,
    },

    /// Approve a task that is awaiting approval
    Approve {
        /// Task id
        task_id: Uuid,

        /// Approver name
        #[arg(short, long, default_value = "cli")]
        by: String,
    },

    /// Show one task
    Show {
        /// Task id
        task_id: Uuid,
    },

    /// Run the worker loops (WAL drain, task polling, dispatch, watchdog)
    Worker,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = LedgerConfig::from_env()?;

    match cli.command {
        Commands::InitDb => {
            let db = connect(&config).await?;
            db.initialize_schema().await?;
            println!("✅ Schema initialized");
            Ok(())
        }

        Commands::Append { payload } => {
            let payload: Value =
                serde_json::from_str(&payload).context("payload must be a JSON object")?;
            let db = Arc::new(connect(&config).await?);
            let wal = WalService::new(db, Arc::new(LogAlertSink), &config);
            let entry = wal.append(payload).await?;
            println!("✅ Appended WAL entry {}", entry.id);
            Ok(())
        }

        Commands::CreateTask {
            role,
            payload,
            depends_on,
            priority,
            approval_required,
        } => {
            let payload: Value =
                serde_json::from_str(&payload).context("payload must be a JSON object")?;
            let scheduler = build_scheduler(&config).await?.0;
            let task = scheduler
                .create_task(
                    NewTask::new(role, payload)
                        .depends_on(depends_on)
                        .priority(priority)
                        .approval_required(approval_required),
                )
                .await?;
            println!("✅ Created task {} ({})", task.id, task.status.as_str());
            Ok(())
        }

        Commands::Approve { task_id, by } => {
            let scheduler = build_scheduler(&config).await?.0;
            let task = scheduler.approve_task(task_id, &by).await?;
            println!("✅ Task {} is now {}", task.id, task.status.as_str());
            Ok(())
        }

        Commands::Show { task_id } => {
            let scheduler = build_scheduler(&config).await?.0;
            let task = scheduler
                .get_task(task_id)
                .await?
                .ok_or_else(|| LedgerError::NotFound(format!("task {task_id}")))?;
            println!("{}", serde_json::to_string_pretty(&task)?);
            Ok(())
        }

        Commands::Worker => {
            run_worker(&config).await?;
            Ok(())
        }
    }
}

async fn connect(config: &LedgerConfig) -> Result<LedgerDb> {
    LedgerDb::new(config.require_database_url()?, config.pool_max_connections).await
}

async fn build_scheduler(
    config: &LedgerConfig,
) -> Result<(Arc<TaskScheduler>, tokio::sync::mpsc::Receiver<Task>)> {
    let db = Arc::new(connect(config).await?);
    let (dispatcher, receiver) = QueueDispatcher::channel(64);
    let scheduler = Arc::new(TaskScheduler::new(
        db,
        Arc::new(dispatcher),
        Arc::new(LogAlertSink),
        config,
    ));
    Ok((scheduler, receiver))
}

async fn run_worker(config: &LedgerConfig) -> Result<()> {
    let db = Arc::new(connect(config).await?);
    let alerts = Arc::new(LogAlertSink);
    let worker_id = WorkerId::from_process();

    let wal = Arc::new(WalService::new(db.clone(), alerts.clone(), config));
    let checkpoints = Arc::new(CheckpointManager::new(db.clone(), config.checkpoint_ttl));
    let pipeline = Arc::new(ConsolidationPipeline::new(
        wal.clone(),
        checkpoints,
        Arc::new(PayloadExtractor),
        Arc::new(NameResolver::default()),
        Arc::new(LogRelationshipSink),
        config.checkpoint_interval,
        worker_id.clone(),
    ));

    let (dispatcher, receiver) = QueueDispatcher::channel(256);
    let scheduler = Arc::new(TaskScheduler::new(
        db,
        Arc::new(dispatcher),
        alerts,
        config,
    ));
    let executor: Arc<dyn TaskExecutor> = Arc::new(EchoExecutor);

    info!(worker = %worker_id, "Starting ledger worker");
    tokio::join!(
        ledger::worker::run_wal_worker(wal, pipeline, worker_id.clone(), config),
        ledger::worker::run_task_worker(
            scheduler.clone(),
            executor.clone(),
            worker_id.clone(),
            config
        ),
        ledger::worker::run_dispatch_consumer(
            scheduler.clone(),
            executor,
            receiver,
            WorkerId::new(format!("{worker_id}-dispatch"))
        ),
        ledger::worker::run_watchdog(scheduler, config),
    );
    Ok(())
}

/// Extractor for payloads that already carry structured relationships under a
/// `relationships` array. Deployments with a language-model extractor swap
/// this out at wiring time.
struct PayloadExtractor;

#[async_trait]
impl Extractor for PayloadExtractor {
    async fn extract(&self, content: &str, _known_entities: &[String]) -> Result<Vec<Relationship>> {
        let parsed: Value = match serde_json::from_str(content) {
            Ok(v) => v,
            Err(_) => return Ok(Vec::new()),
        };
        let Some(raw) = parsed.get("relationships").cloned() else {
            return Ok(Vec::new());
        };
        Ok(serde_json::from_value(raw)?)
    }
}

/// Name-keyed resolver that mints an id per (user, name) pair.
#[derive(Default)]
struct NameResolver {
    seen: Mutex<HashMap<(String, String), Uuid>>,
}

#[async_trait]
impl EntityResolver for NameResolver {
    async fn resolve(&self, entity_name: &str, user: &str) -> Result<Resolution> {
        let mut seen = self.seen.lock().await;
        let key = (user.to_string(), entity_name.to_lowercase());
        if let Some(id) = seen.get(&key) {
            return Ok(Resolution {
                action: ResolutionAction::Updated,
                entity_id: *id,
            });
        }
        let id = Uuid::new_v4();
        seen.insert(key, id);
        Ok(Resolution {
            action: ResolutionAction::Created,
            entity_id: id,
        })
    }
}

/// Sink that records consolidated relationships to the log only.
struct LogRelationshipSink;

#[async_trait]
impl RelationshipSink for LogRelationshipSink {
    async fn upsert(
        &self,
        subject_id: Uuid,
        object_id: Uuid,
        relationship: &Relationship,
    ) -> Result<()> {
        info!(
            subject = %subject_id,
            object = %object_id,
            predicate = %relationship.predicate,
            "Consolidated relationship"
        );
        Ok(())
    }
}

/// Executor that completes every task with its own payload as the result.
struct EchoExecutor;

#[async_trait]
impl TaskExecutor for EchoExecutor {
    async fn execute(&self, task: &Task) -> Result<Value> {
        Ok(task.payload.clone())
    }
}
