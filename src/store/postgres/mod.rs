#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

mod mappers;
mod task_ops;
mod wal_ops;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tracing::info;

use crate::error::{LedgerError, Result};

use super::CheckpointStore;

const SCHEMA_SQL: &str = include_str!("../../canonical_schema/schema.sql");

/// Postgres-backed store. The database is the single source of truth and the
/// sole arbiter of claim races.
#[derive(Clone)]
pub struct LedgerDb {
    pool: PgPool,
}

impl LedgerDb {
    /// # Errors
    /// Returns an error if the connection cannot be established.
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL ledger database");
        Ok(Self { pool })
    }

    /// Create a new `LedgerDb` with an existing pool (for testing).
    #[must_use]
    pub const fn new_with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub(crate) const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// # Errors
    /// Returns an error if schema creation fails.
    pub async fn initialize_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(self.pool())
            .await
            .map(|_result| ())
            .map_err(|e| LedgerError::DatabaseError(format!("Failed to initialize schema: {e}")))
    }
}

#[async_trait]
impl CheckpointStore for LedgerDb {
    async fn set_with_ttl(&self, key: &str, value: Value, ttl: Duration) -> Result<()> {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl)
                .map_err(|e| LedgerError::Internal(format!("TTL out of range: {e}")))?;

        sqlx::query(
            "INSERT INTO checkpoints (key, value, expires_at)
             VALUES ($1, $2, $3)
             ON CONFLICT (key) DO UPDATE
             SET value = EXCLUDED.value,
                 expires_at = EXCLUDED.expires_at",
        )
        .bind(key)
        .bind(value)
        .bind(expires_at)
        .execute(self.pool())
        .await
        .map(|_result| ())
        .map_err(|e| LedgerError::DatabaseError(format!("Failed to save checkpoint: {e}")))
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        sqlx::query_scalar::<_, Value>(
            "SELECT value FROM checkpoints WHERE key = $1 AND expires_at > NOW()",
        )
        .bind(key)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| LedgerError::DatabaseError(format!("Failed to load checkpoint: {e}")))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM checkpoints WHERE key = $1")
            .bind(key)
            .execute(self.pool())
            .await
            .map(|_result| ())
            .map_err(|e| LedgerError::DatabaseError(format!("Failed to clear checkpoint: {e}")))
    }
}
