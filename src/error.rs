#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use thiserror::Error;

/// Error code constants for type-safe error handling
pub mod code {
    pub const EXISTS: &str = "EXISTS";
    pub const NOTFOUND: &str = "NOTFOUND";
    pub const INVALID: &str = "INVALID";
    pub const CONFLICT: &str = "CONFLICT";
    pub const CYCLE: &str = "CYCLE";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const INTERNAL: &str = "INTERNAL";
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("SQLx error: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("WAL error: {0}")]
    WalError(String),

    #[error("Task error: {0}")]
    TaskError(String),

    #[error("Dependency cycle: {0}")]
    DependencyCycle(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    /// Returns the protocol error code for this error
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigError(_) | Self::SerializationError(_) => code::INVALID,
            Self::DatabaseError(_) | Self::SqlxError(_) | Self::IoError(_) | Self::Internal(_) => {
                code::INTERNAL
            }
            Self::WalError(_) | Self::TaskError(_) | Self::InvalidTransition(_) => code::CONFLICT,
            Self::DependencyCycle(_) => code::CYCLE,
            Self::NotFound(_) => code::NOTFOUND,
        }
    }

    /// Returns the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConfigError(_) => 2,
            Self::DatabaseError(_) | Self::SqlxError(_) => 3,
            Self::WalError(_) => 4,
            Self::TaskError(_) | Self::InvalidTransition(_) => 5,
            Self::DependencyCycle(_) => 6,
            Self::NotFound(_) | Self::IoError(_) => 7,
            Self::SerializationError(_) => 8,
            Self::Internal(_) => 9,
        }
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
