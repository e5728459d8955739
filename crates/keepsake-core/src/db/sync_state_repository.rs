//! Key-value persistence for the sync checkpoint

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};
use crate::models::SyncCheckpoint;

const LAST_PULL_AT: &str = "last_pull_at";
const LAST_FULL_SYNC_AT: &str = "last_full_sync_at";

/// Trait for checkpoint storage operations
pub trait SyncStateRepository {
    /// Load the checkpoint; missing keys load as `None`
    fn load(&self) -> Result<SyncCheckpoint>;

    /// Persist the checkpoint
    fn save(&self, checkpoint: &SyncCheckpoint) -> Result<()>;

    /// Forget the checkpoint (e.g. on account switch)
    fn reset(&self) -> Result<()>;
}

/// `SQLite` implementation of `SyncStateRepository` over the `sync_state` table
pub struct SqliteSyncStateRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteSyncStateRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn get_timestamp(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM sync_state WHERE key = ?",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        raw.map(|value| {
            DateTime::parse_from_rfc3339(&value)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|error| {
                    Error::Database(format!("corrupt sync_state value for '{key}': {error}"))
                })
        })
        .transpose()
    }

    fn set_timestamp(&self, key: &str, value: Option<DateTime<Utc>>) -> Result<()> {
        match value {
            Some(ts) => {
                self.conn.execute(
                    "INSERT INTO sync_state (key, value) VALUES (?, ?)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    params![key, ts.to_rfc3339()],
                )?;
            }
            None => {
                self.conn
                    .execute("DELETE FROM sync_state WHERE key = ?", params![key])?;
            }
        }
        Ok(())
    }
}

impl SyncStateRepository for SqliteSyncStateRepository<'_> {
    fn load(&self) -> Result<SyncCheckpoint> {
        Ok(SyncCheckpoint {
            last_pull_at: self.get_timestamp(LAST_PULL_AT)?,
            last_full_sync_at: self.get_timestamp(LAST_FULL_SYNC_AT)?,
        })
    }

    fn save(&self, checkpoint: &SyncCheckpoint) -> Result<()> {
        self.set_timestamp(LAST_PULL_AT, checkpoint.last_pull_at)?;
        self.set_timestamp(LAST_FULL_SYNC_AT, checkpoint.last_full_sync_at)
    }

    fn reset(&self) -> Result<()> {
        self.conn.execute(
            "DELETE FROM sync_state WHERE key IN (?, ?)",
            params![LAST_PULL_AT, LAST_FULL_SYNC_AT],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::util::from_millis;

    #[test]
    fn test_missing_checkpoint_loads_empty() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteSyncStateRepository::new(db.connection());
        assert_eq!(repo.load().unwrap(), SyncCheckpoint::default());
    }

    #[test]
    fn test_save_load_and_reset() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteSyncStateRepository::new(db.connection());
        let checkpoint = SyncCheckpoint {
            last_pull_at: Some(from_millis(1_700_000_000_000)),
            last_full_sync_at: Some(from_millis(1_700_000_100_000)),
        };

        repo.save(&checkpoint).unwrap();
        assert_eq!(repo.load().unwrap(), checkpoint);

        repo.reset().unwrap();
        assert_eq!(repo.load().unwrap(), SyncCheckpoint::default());
    }
}
