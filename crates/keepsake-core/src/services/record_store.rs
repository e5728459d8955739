//! Thread-safe store service shared by the host, the sync engine and the scheduler.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::clock::{system_clock, SharedClock};
use crate::db::{
    ApplyOutcome, Database, MigrationError, Outbox, RecordRepository, SqliteRecordRepository,
    SqliteSyncStateRepository, SyncLog, SyncStateRepository,
};
use crate::models::{
    OutboxEntry, Record, RecordFields, RecordId, RemoteRecord, SyncCheckpoint, SyncConflict,
    SyncErrorRecord,
};
use crate::Result;

/// Single-writer handle over the local database.
///
/// Every call locks the connection, runs its transaction and unlocks; callers
/// never hold the lock across a network call.
#[derive(Clone)]
pub struct RecordStore {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
    clock: SharedClock,
}

impl RecordStore {
    /// Open a store at the given filesystem path.
    pub fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        let db = Database::open(&db_path)?;
        Ok(Self::from_database(db, Some(db_path), system_clock()))
    }

    /// Open a store, continuing at the last good schema version if a migration fails.
    pub fn open_path_lenient(
        db_path: impl Into<PathBuf>,
    ) -> Result<(Self, Option<MigrationError>)> {
        let db_path = db_path.into();
        let (db, failure) = Database::open_lenient(&db_path)?;
        Ok((
            Self::from_database(db, Some(db_path), system_clock()),
            failure,
        ))
    }

    /// Open an in-memory store (primarily for tests).
    pub fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory()?;
        Ok(Self::from_database(db, None, system_clock()))
    }

    fn from_database(db: Database, db_path: Option<PathBuf>, clock: SharedClock) -> Self {
        tracing::debug!(
            schema_version = db.schema_version(),
            "Opened local store at {}",
            db_path
                .as_deref()
                .map_or_else(|| ":memory:".into(), Path::to_string_lossy)
        );
        Self {
            db: Arc::new(Mutex::new(db)),
            db_path,
            clock,
        }
    }

    /// Replace the time source used for record timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    #[must_use]
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    pub async fn schema_version(&self) -> u32 {
        self.db.lock().await.schema_version()
    }

    // Records

    pub async fn create(&self, fields: RecordFields) -> Result<Record> {
        let db = self.db.lock().await;
        SqliteRecordRepository::new(db.connection(), self.clock.as_ref()).create(fields)
    }

    pub async fn create_with_id(&self, id: RecordId, fields: RecordFields) -> Result<Record> {
        let db = self.db.lock().await;
        SqliteRecordRepository::new(db.connection(), self.clock.as_ref()).create_with_id(id, fields)
    }

    pub async fn update(&self, id: &RecordId, partial: RecordFields) -> Result<Record> {
        let db = self.db.lock().await;
        SqliteRecordRepository::new(db.connection(), self.clock.as_ref()).update(id, partial)
    }

    pub async fn soft_delete(&self, id: &RecordId) -> Result<Record> {
        let db = self.db.lock().await;
        SqliteRecordRepository::new(db.connection(), self.clock.as_ref()).soft_delete(id)
    }

    pub async fn get(&self, id: &RecordId) -> Result<Option<Record>> {
        let db = self.db.lock().await;
        SqliteRecordRepository::new(db.connection(), self.clock.as_ref()).get(id)
    }

    pub async fn list_active(&self) -> Result<Vec<Record>> {
        let db = self.db.lock().await;
        SqliteRecordRepository::new(db.connection(), self.clock.as_ref()).list_active()
    }

    pub async fn changes_since(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Record>> {
        let db = self.db.lock().await;
        SqliteRecordRepository::new(db.connection(), self.clock.as_ref()).changes_since(since)
    }

    pub async fn count_unsynced(&self) -> Result<usize> {
        let db = self.db.lock().await;
        SqliteRecordRepository::new(db.connection(), self.clock.as_ref()).count_unsynced()
    }

    pub async fn purge_tombstones(&self) -> Result<usize> {
        let db = self.db.lock().await;
        SqliteRecordRepository::new(db.connection(), self.clock.as_ref()).purge_tombstones()
    }

    /// Resolve an id or a unique id prefix to a record.
    pub async fn find_by_prefix(&self, prefix: &str) -> Result<Vec<Record>> {
        let prefix = prefix.trim().to_ascii_lowercase();
        if let Ok(id) = prefix.parse::<RecordId>() {
            return Ok(self.get(&id).await?.into_iter().collect());
        }
        Ok(self
            .changes_since(None)
            .await?
            .into_iter()
            .filter(|record| record.id.as_str().starts_with(&prefix))
            .collect())
    }

    // Sync support

    /// Apply a pulled record, dropping local entries the remote version supersedes.
    pub async fn apply_pulled(
        &self,
        remote: &RemoteRecord,
        synced_at: DateTime<Utc>,
    ) -> Result<(ApplyOutcome, usize)> {
        let db = self.db.lock().await;
        let conn = db.connection();
        let outcome =
            SqliteRecordRepository::new(conn, self.clock.as_ref()).apply_remote(remote, synced_at)?;
        let superseded = if outcome == ApplyOutcome::KeptLocal {
            0
        } else {
            Outbox::new(conn)
                .remove_superseded(&remote.id, remote.updated_at)?
                .len()
        };
        Ok((outcome, superseded))
    }

    /// Apply a pulled deletion, dropping local entries it supersedes.
    pub async fn apply_pulled_deletion(
        &self,
        id: &RecordId,
        deleted_at: DateTime<Utc>,
        synced_at: DateTime<Utc>,
    ) -> Result<(ApplyOutcome, usize)> {
        let db = self.db.lock().await;
        let conn = db.connection();
        let outcome = SqliteRecordRepository::new(conn, self.clock.as_ref())
            .apply_remote_deletion(id, deleted_at, synced_at)?;
        let superseded = if outcome == ApplyOutcome::Updated {
            Outbox::new(conn).remove_superseded(id, deleted_at)?.len()
        } else {
            0
        };
        Ok((outcome, superseded))
    }

    /// Remove an acknowledged entry; stamps `synced_at` once nothing else is pending.
    pub async fn acknowledge(&self, entry: &OutboxEntry, at: DateTime<Utc>) -> Result<bool> {
        let db = self.db.lock().await;
        let tx = db.connection().unchecked_transaction()?;
        let outbox = Outbox::new(&tx);
        outbox.remove(entry.entry_id)?;
        let synced = if outbox.count_for_record(&entry.record_id)? == 0 {
            SqliteRecordRepository::new(&tx, self.clock.as_ref())
                .mark_synced(&entry.record_id, at)?
        } else {
            false
        };
        tx.commit()?;
        Ok(synced)
    }

    /// Record a failed delivery attempt; returns the new retry count.
    pub async fn record_failure(&self, entry: &OutboxEntry, error: &str) -> Result<u32> {
        let db = self.db.lock().await;
        Outbox::new(db.connection()).record_failure(entry.entry_id, error)
    }

    /// Drop an entry for good and surface it in the sync error log.
    pub async fn drop_entry(&self, entry: &OutboxEntry, kind: &str, message: &str) -> Result<()> {
        let db = self.db.lock().await;
        let tx = db.connection().unchecked_transaction()?;
        Outbox::new(&tx).remove(entry.entry_id)?;
        SyncLog::new(&tx).record_error(entry, kind, message, self.clock.now())?;
        tx.commit()?;
        tracing::warn!(
            entry_id = entry.entry_id,
            record_id = %entry.record_id,
            kind,
            "Dropped outbox entry: {}",
            message
        );
        Ok(())
    }

    pub async fn peek_outbox_after(
        &self,
        cursor: Option<i64>,
        limit: usize,
    ) -> Result<Vec<OutboxEntry>> {
        let db = self.db.lock().await;
        Outbox::new(db.connection()).peek_batch_after(cursor, limit)
    }

    pub async fn pending_count(&self) -> Result<usize> {
        let db = self.db.lock().await;
        Outbox::new(db.connection()).count()
    }

    pub async fn load_checkpoint(&self) -> Result<SyncCheckpoint> {
        let db = self.db.lock().await;
        SqliteSyncStateRepository::new(db.connection()).load()
    }

    pub async fn save_checkpoint(&self, checkpoint: &SyncCheckpoint) -> Result<()> {
        let db = self.db.lock().await;
        SqliteSyncStateRepository::new(db.connection()).save(checkpoint)
    }

    /// Forget the checkpoint so the next pull starts from scratch.
    pub async fn reset_checkpoint(&self) -> Result<()> {
        let db = self.db.lock().await;
        SqliteSyncStateRepository::new(db.connection()).reset()?;
        tracing::info!("Sync checkpoint reset");
        Ok(())
    }

    pub async fn list_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        let db = self.db.lock().await;
        SyncLog::new(db.connection()).list_conflicts(limit)
    }

    pub async fn list_errors(&self, limit: usize) -> Result<Vec<SyncErrorRecord>> {
        let db = self.db.lock().await;
        SyncLog::new(db.connection()).list_errors(limit)
    }

    pub async fn clear_errors(&self) -> Result<usize> {
        let db = self.db.lock().await;
        SyncLog::new(db.connection()).clear_errors()
    }
}
