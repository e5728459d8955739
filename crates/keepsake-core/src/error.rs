//! Error types for keepsake-core

use thiserror::Error;

use crate::db::MigrationError;

/// Result type alias using keepsake-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in local keepsake-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record not found (or already tombstoned)
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A schema migration failed; the store stays at the previous version
    #[error(transparent)]
    Migration(#[from] MigrationError),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}
