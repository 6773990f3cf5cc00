#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

//! Contracts for the external collaborators the core calls out to. The core
//! owns none of their logic; it only defines the seams.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// A relationship extracted from event content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub subject: String,
    pub predicate: String,
    pub object: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionAction {
    Created,
    Updated,
}

/// Result of resolving an entity name to a stored entity.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub action: ResolutionAction,
    pub entity_id: Uuid,
}

/// Content understanding. Slow; never called while a store lock is held.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(
        &self,
        content: &str,
        known_entities: &[String],
    ) -> Result<Vec<Relationship>>;
}

#[async_trait]
pub trait EntityResolver: Send + Sync {
    async fn resolve(&self, entity_name: &str, user: &str) -> Result<Resolution>;
}

/// Destination for consolidated relationships. `upsert` must overwrite any
/// existing value for the same (subject, predicate, object) key; the pipeline
/// relies on this for last-write-wins conflict resolution.
#[async_trait]
pub trait RelationshipSink: Send + Sync {
    async fn upsert(
        &self,
        subject_id: Uuid,
        object_id: Uuid,
        relationship: &Relationship,
    ) -> Result<()>;
}

/// Operator-facing alerting. Delivery failures are the sink's problem; the
/// core fires and forgets.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, severity: Severity, message: &str);
}

/// Alert sink that forwards to the tracing subscriber. The default for
/// deployments without a dedicated notification channel.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn notify(&self, severity: Severity, message: &str) {
        match severity {
            Severity::Info => info!(alert = true, "{message}"),
            Severity::Warning => warn!(alert = true, "{message}"),
            Severity::Critical => error!(alert = true, "{message}"),
        }
    }
}
