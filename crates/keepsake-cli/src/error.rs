use std::io;

use keepsake_core::auth::AuthError;
use keepsake_core::sync::SyncError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] keepsake_core::Error),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("No record fields provided")]
    EmptyFields,
    #[error("Invalid field '{0}': expected key=value")]
    InvalidField(String),
    #[error("Record ID cannot be empty")]
    EmptyRecordId,
    #[error("Record not found for id/prefix: {0}")]
    RecordNotFound(String),
    #[error("{0}")]
    AmbiguousRecordId(String),
    #[error("Editor command failed: {0}")]
    EditorFailed(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error(
        "Sync is not configured. Run `keepsake config init --api-url <URL>` or set KEEPSAKE_API_URL."
    )]
    SyncNotConfigured,
}
