//! services/worker/src/error.rs

use tutoring_core::ports::DomainError;

use crate::config::ConfigError;

/// Top-level error for the worker binaries.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}
