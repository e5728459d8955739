//! Record repository implementation

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{conversion_error, Outbox, SyncLog};
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::models::{
    merge_fields, ConflictWinner, MutationPayload, OutboxOperation, Record, RecordFields, RecordId,
    RemoteRecord,
};
use crate::util::{from_millis, from_millis_opt, truncate_to_millis};

const RECORD_COLUMNS: &str = "id, fields, created_at, updated_at, synced_at, deleted_at";

/// Result of applying a remote version locally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Record did not exist locally and was inserted
    Inserted,
    /// Remote version was newer and replaced the local row
    Updated,
    /// Remote version matched the local one (or there was nothing to apply)
    Unchanged,
    /// Local version was newer and was kept
    KeptLocal,
}

impl ApplyOutcome {
    /// Whether the remote version is now the local state
    #[must_use]
    pub const fn remote_won(self) -> bool {
        matches!(self, Self::Inserted | Self::Updated)
    }
}

/// Trait for record storage operations
pub trait RecordRepository {
    /// Create a new record and enqueue its `create` mutation
    fn create(&self, fields: RecordFields) -> Result<Record>;

    /// Create a record with a caller-provided id
    fn create_with_id(&self, id: RecordId, fields: RecordFields) -> Result<Record>;

    /// Shallow-merge `partial` into a live record and enqueue an `update`
    fn update(&self, id: &RecordId, partial: RecordFields) -> Result<Record>;

    /// Tombstone a live record and enqueue a `delete`
    fn soft_delete(&self, id: &RecordId) -> Result<Record>;

    /// Get a record by ID, tombstones included
    fn get(&self, id: &RecordId) -> Result<Option<Record>>;

    /// List live records, most recently updated first
    fn list_active(&self) -> Result<Vec<Record>>;

    /// Records written after `since` (all when `None`), tombstones included,
    /// ordered by `updated_at` then `id` ascending
    fn changes_since(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Record>>;

    /// Last-writer-wins upsert of a remote version; never enqueues
    fn apply_remote(&self, remote: &RemoteRecord, synced_at: DateTime<Utc>)
        -> Result<ApplyOutcome>;

    /// Last-writer-wins tombstone of a remotely deleted record; never enqueues
    fn apply_remote_deletion(
        &self,
        id: &RecordId,
        deleted_at: DateTime<Utc>,
        synced_at: DateTime<Utc>,
    ) -> Result<ApplyOutcome>;

    /// Stamp a remote acknowledgement
    fn mark_synced(&self, id: &RecordId, at: DateTime<Utc>) -> Result<bool>;

    /// Number of records whose latest write is not acknowledged
    fn count_unsynced(&self) -> Result<usize>;

    /// Physically remove acknowledged tombstones with nothing pending
    fn purge_tombstones(&self) -> Result<usize>;
}

/// `SQLite` implementation of `RecordRepository`
pub struct SqliteRecordRepository<'a> {
    conn: &'a Connection,
    clock: &'a dyn Clock,
}

impl<'a> SqliteRecordRepository<'a> {
    /// Create a new repository with the given connection and time source
    pub const fn new(conn: &'a Connection, clock: &'a dyn Clock) -> Self {
        Self { conn, clock }
    }

    /// Next local write timestamp, strictly after `previous`
    fn next_timestamp(&self, previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
        let now = truncate_to_millis(self.clock.now());
        match previous {
            Some(prev) if now <= prev => prev + Duration::milliseconds(1),
            _ => now,
        }
    }

    fn fetch(conn: &Connection, id: &RecordId) -> Result<Option<Record>> {
        Ok(conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM records WHERE id = ?"),
                params![id.as_str()],
                Self::parse_record,
            )
            .optional()?)
    }

    fn fetch_live(conn: &Connection, id: &RecordId) -> Result<Record> {
        Self::fetch(conn, id)?
            .filter(|record| !record.is_deleted())
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    fn write_row(conn: &Connection, record: &Record) -> Result<()> {
        let fields = serde_json::to_string(&record.fields)?;
        conn.execute(
            "INSERT INTO records (id, fields, created_at, updated_at, synced_at, deleted_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                fields = excluded.fields,
                updated_at = excluded.updated_at,
                synced_at = excluded.synced_at,
                deleted_at = excluded.deleted_at",
            params![
                record.id.as_str(),
                fields,
                record.created_at.timestamp_millis(),
                record.updated_at.timestamp_millis(),
                record.synced_at.map(|at| at.timestamp_millis()),
                record.deleted_at.map(|at| at.timestamp_millis()),
            ],
        )?;
        Ok(())
    }

    /// Write the row and its outbox entry on the same connection (an open transaction).
    fn write_local(conn: &Connection, operation: OutboxOperation, record: &Record) -> Result<()> {
        Self::write_row(conn, record)?;
        Outbox::new(conn).enqueue(
            operation,
            &record.id,
            &MutationPayload::for_record(operation, record),
            record.updated_at,
        )?;
        Ok(())
    }

    fn set_synced_at(conn: &Connection, id: &RecordId, at: DateTime<Utc>) -> Result<bool> {
        let rows = conn.execute(
            "UPDATE records SET synced_at = ? WHERE id = ?",
            params![at.timestamp_millis(), id.as_str()],
        )?;
        Ok(rows > 0)
    }

    fn query_records<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<Record>> {
        let mut stmt = self.conn.prepare(sql)?;
        let records = stmt
            .query_map(params, Self::parse_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// Parse a record from a database row
    fn parse_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<Record> {
        let id: String = row.get(0)?;
        let fields: String = row.get(1)?;
        Ok(Record {
            id: id.parse().map_err(|error| conversion_error(0, error))?,
            fields: serde_json::from_str(&fields).map_err(|error| conversion_error(1, error))?,
            created_at: from_millis(row.get(2)?),
            updated_at: from_millis(row.get(3)?),
            synced_at: from_millis_opt(row.get(4)?),
            deleted_at: from_millis_opt(row.get(5)?),
        })
    }
}

impl RecordRepository for SqliteRecordRepository<'_> {
    fn create(&self, fields: RecordFields) -> Result<Record> {
        self.create_with_id(RecordId::new(), fields)
    }

    fn create_with_id(&self, id: RecordId, fields: RecordFields) -> Result<Record> {
        let now = self.next_timestamp(None);
        let record = Record {
            id,
            fields,
            created_at: now,
            updated_at: now,
            synced_at: None,
            deleted_at: None,
        };

        let tx = self.conn.unchecked_transaction()?;
        if Self::fetch(&tx, &id)?.is_some() {
            return Err(Error::InvalidInput(format!("record {id} already exists")));
        }
        Self::write_local(&tx, OutboxOperation::Create, &record)?;
        tx.commit()?;

        tracing::debug!(record_id = %id, "Created record");
        Ok(record)
    }

    fn update(&self, id: &RecordId, partial: RecordFields) -> Result<Record> {
        let tx = self.conn.unchecked_transaction()?;
        let mut record = Self::fetch_live(&tx, id)?;

        merge_fields(&mut record.fields, partial);
        record.updated_at = self.next_timestamp(Some(record.updated_at));

        Self::write_local(&tx, OutboxOperation::Update, &record)?;
        tx.commit()?;

        tracing::debug!(record_id = %id, "Updated record");
        Ok(record)
    }

    fn soft_delete(&self, id: &RecordId) -> Result<Record> {
        let tx = self.conn.unchecked_transaction()?;
        let mut record = Self::fetch_live(&tx, id)?;

        let now = self.next_timestamp(Some(record.updated_at));
        record.updated_at = now;
        record.deleted_at = Some(now);

        Self::write_local(&tx, OutboxOperation::Delete, &record)?;
        tx.commit()?;

        tracing::debug!(record_id = %id, "Tombstoned record");
        Ok(record)
    }

    fn get(&self, id: &RecordId) -> Result<Option<Record>> {
        Self::fetch(self.conn, id)
    }

    fn list_active(&self) -> Result<Vec<Record>> {
        self.query_records(
            &format!(
                "SELECT {RECORD_COLUMNS}
                 FROM records
                 WHERE deleted_at IS NULL
                 ORDER BY updated_at DESC, id DESC"
            ),
            [],
        )
    }

    fn changes_since(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Record>> {
        self.query_records(
            &format!(
                "SELECT {RECORD_COLUMNS}
                 FROM records
                 WHERE ?1 IS NULL OR updated_at > ?1
                 ORDER BY updated_at ASC, id ASC"
            ),
            params![since.map(|at| at.timestamp_millis())],
        )
    }

    fn apply_remote(
        &self,
        remote: &RemoteRecord,
        synced_at: DateTime<Utc>,
    ) -> Result<ApplyOutcome> {
        let incoming_at = truncate_to_millis(remote.updated_at);
        let acked_at = truncate_to_millis(synced_at.max(incoming_at));
        let resolved_at = self.clock.now();

        let tx = self.conn.unchecked_transaction()?;
        let outcome = match Self::fetch(&tx, &remote.id)? {
            None => {
                Self::write_row(
                    &tx,
                    &Record {
                        id: remote.id,
                        fields: remote.fields.clone(),
                        created_at: remote.created_at.map_or(incoming_at, truncate_to_millis),
                        updated_at: incoming_at,
                        synced_at: Some(acked_at),
                        deleted_at: remote.deleted_at.map(truncate_to_millis),
                    },
                )?;
                ApplyOutcome::Inserted
            }
            Some(local) if incoming_at > local.updated_at => {
                if !local.is_synced() {
                    SyncLog::new(&tx).record_conflict(
                        &local.id,
                        local.updated_at,
                        incoming_at,
                        ConflictWinner::Remote,
                        resolved_at,
                    )?;
                }
                Self::write_row(
                    &tx,
                    &Record {
                        fields: remote.fields.clone(),
                        updated_at: incoming_at,
                        synced_at: Some(acked_at),
                        deleted_at: remote.deleted_at.map(truncate_to_millis),
                        ..local
                    },
                )?;
                ApplyOutcome::Updated
            }
            Some(local) if incoming_at == local.updated_at => {
                let synced = local.synced_at.map_or(acked_at, |at| at.max(acked_at));
                if local.synced_at != Some(synced) {
                    Self::set_synced_at(&tx, &local.id, synced)?;
                }
                ApplyOutcome::Unchanged
            }
            Some(local) => {
                if !local.is_synced() {
                    SyncLog::new(&tx).record_conflict(
                        &local.id,
                        local.updated_at,
                        incoming_at,
                        ConflictWinner::Local,
                        resolved_at,
                    )?;
                }
                ApplyOutcome::KeptLocal
            }
        };
        tx.commit()?;

        tracing::debug!(record_id = %remote.id, ?outcome, "Applied remote record");
        Ok(outcome)
    }

    fn apply_remote_deletion(
        &self,
        id: &RecordId,
        deleted_at: DateTime<Utc>,
        synced_at: DateTime<Utc>,
    ) -> Result<ApplyOutcome> {
        let incoming_at = truncate_to_millis(deleted_at);
        let acked_at = truncate_to_millis(synced_at.max(incoming_at));
        let resolved_at = self.clock.now();

        let tx = self.conn.unchecked_transaction()?;
        let outcome = match Self::fetch(&tx, id)? {
            None => ApplyOutcome::Unchanged,
            Some(local) if local.is_deleted() => {
                let synced = local.synced_at.map_or(acked_at, |at| at.max(acked_at));
                if local.synced_at != Some(synced) {
                    Self::set_synced_at(&tx, id, synced)?;
                }
                ApplyOutcome::Unchanged
            }
            Some(local) if incoming_at > local.updated_at => {
                if !local.is_synced() {
                    SyncLog::new(&tx).record_conflict(
                        id,
                        local.updated_at,
                        incoming_at,
                        ConflictWinner::Remote,
                        resolved_at,
                    )?;
                }
                Self::write_row(
                    &tx,
                    &Record {
                        updated_at: incoming_at,
                        synced_at: Some(acked_at),
                        deleted_at: Some(incoming_at),
                        ..local
                    },
                )?;
                ApplyOutcome::Updated
            }
            Some(local) => {
                if !local.is_synced() {
                    SyncLog::new(&tx).record_conflict(
                        id,
                        local.updated_at,
                        incoming_at,
                        ConflictWinner::Local,
                        resolved_at,
                    )?;
                }
                ApplyOutcome::KeptLocal
            }
        };
        tx.commit()?;

        tracing::debug!(record_id = %id, ?outcome, "Applied remote deletion");
        Ok(outcome)
    }

    fn mark_synced(&self, id: &RecordId, at: DateTime<Utc>) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE records SET synced_at = MAX(?, updated_at) WHERE id = ?",
            params![truncate_to_millis(at).timestamp_millis(), id.as_str()],
        )?;
        Ok(rows > 0)
    }

    fn count_unsynced(&self) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM records WHERE synced_at IS NULL OR synced_at < updated_at",
            [],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    fn purge_tombstones(&self) -> Result<usize> {
        let rows = self.conn.execute(
            "DELETE FROM records
             WHERE deleted_at IS NOT NULL
               AND synced_at IS NOT NULL
               AND synced_at >= updated_at
               AND NOT EXISTS (SELECT 1 FROM outbox WHERE outbox.record_id = records.id)",
            [],
        )?;
        if rows > 0 {
            tracing::info!("Purged {} acknowledged tombstones", rows);
        }
        Ok(rows)
    }
}
