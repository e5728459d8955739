//! Durable local store for Keepsake

mod connection;
mod migrations;
mod outbox;
mod repository;
mod sync_log;
mod sync_state_repository;

pub use connection::Database;
pub use migrations::{
    current_version, latest_version, migrate, Migration, MigrationError, MIGRATIONS,
};
pub use outbox::Outbox;
pub use repository::{ApplyOutcome, RecordRepository, SqliteRecordRepository};
pub use sync_log::SyncLog;
pub use sync_state_repository::{SqliteSyncStateRepository, SyncStateRepository};

/// Map a column decoding failure into a rusqlite error so it propagates as a store error.
pub(crate) fn conversion_error<E>(column: usize, error: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(error),
    )
}
