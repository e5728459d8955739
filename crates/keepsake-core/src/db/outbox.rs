//! Durable outbox of pending local mutations

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::conversion_error;
use crate::error::{Error, Result};
use crate::models::{MutationPayload, OutboxEntry, OutboxOperation, RecordId};
use crate::util::from_millis;

const ENTRY_COLUMNS: &str =
    "entry_id, operation, record_id, payload, created_at, retry_count, last_error";

/// FIFO mutation queue stored next to the records table.
///
/// Works on any connection, including an open transaction, so callers can
/// enqueue in the same transaction that writes the record row.
pub struct Outbox<'a> {
    conn: &'a Connection,
}

impl<'a> Outbox<'a> {
    /// Create an outbox view over the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Append a mutation; returns its `entry_id`.
    pub fn enqueue(
        &self,
        operation: OutboxOperation,
        record_id: &RecordId,
        payload: &MutationPayload,
        created_at: DateTime<Utc>,
    ) -> Result<i64> {
        payload.validate(operation, record_id)?;
        let raw = serde_json::to_string(payload)?;

        self.conn.execute(
            "INSERT INTO outbox (operation, record_id, payload, created_at, retry_count)
             VALUES (?, ?, ?, ?, 0)",
            params![
                operation.as_str(),
                record_id.as_str(),
                raw,
                created_at.timestamp_millis()
            ],
        )?;

        let entry_id = self.conn.last_insert_rowid();
        tracing::debug!(entry_id, %record_id, %operation, "Enqueued outbox entry");
        Ok(entry_id)
    }

    /// Oldest `limit` entries in creation order
    pub fn peek_batch(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        self.peek_batch_after(None, limit)
    }

    /// Oldest `limit` entries created after `cursor` (an `entry_id`)
    pub fn peek_batch_after(&self, cursor: Option<i64>, limit: usize) -> Result<Vec<OutboxEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS}
             FROM outbox
             WHERE entry_id > ?
             ORDER BY entry_id ASC
             LIMIT ?"
        ))?;

        let entries = stmt
            .query_map(
                params![cursor.unwrap_or(0), i64::try_from(limit).unwrap_or(i64::MAX)],
                Self::parse_entry,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(entries)
    }

    /// Fetch a single entry
    pub fn get(&self, entry_id: i64) -> Result<Option<OutboxEntry>> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM outbox WHERE entry_id = ?"),
                params![entry_id],
                Self::parse_entry,
            )
            .optional()?)
    }

    /// All pending entries for one record, oldest first
    pub fn list_for_record(&self, record_id: &RecordId) -> Result<Vec<OutboxEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS}
             FROM outbox
             WHERE record_id = ?
             ORDER BY entry_id ASC"
        ))?;

        let entries = stmt
            .query_map(params![record_id.as_str()], Self::parse_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(entries)
    }

    /// Remove an entry; returns whether it existed
    pub fn remove(&self, entry_id: i64) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM outbox WHERE entry_id = ?", params![entry_id])?;
        Ok(rows > 0)
    }

    /// Record a failed delivery attempt; returns the new retry count
    pub fn record_failure(&self, entry_id: i64, error: &str) -> Result<u32> {
        self.conn
            .query_row(
                "UPDATE outbox
                 SET retry_count = retry_count + 1, last_error = ?
                 WHERE entry_id = ?
                 RETURNING retry_count",
                params![error, entry_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("outbox entry {entry_id}")))
    }

    /// Drop entries for `record_id` whose snapshot is older than `before`.
    ///
    /// Used when a newer remote version wins last-writer-wins.
    pub fn remove_superseded(
        &self,
        record_id: &RecordId,
        before: DateTime<Utc>,
    ) -> Result<Vec<OutboxEntry>> {
        let superseded: Vec<OutboxEntry> = self
            .list_for_record(record_id)?
            .into_iter()
            .filter(|entry| entry.payload.updated_at < before)
            .collect();

        for entry in &superseded {
            self.remove(entry.entry_id)?;
        }

        Ok(superseded)
    }

    /// Number of pending entries
    pub fn count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM outbox", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// Number of pending entries for one record
    pub fn count_for_record(&self, record_id: &RecordId) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM outbox WHERE record_id = ?",
            params![record_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    fn parse_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutboxEntry> {
        let operation: String = row.get(1)?;
        let record_id: String = row.get(2)?;
        let payload: String = row.get(3)?;

        Ok(OutboxEntry {
            entry_id: row.get(0)?,
            operation: operation
                .parse()
                .map_err(|error| conversion_error(1, error))?,
            record_id: record_id
                .parse()
                .map_err(|error| conversion_error(2, error))?,
            payload: serde_json::from_str(&payload).map_err(|error| conversion_error(3, error))?,
            created_at: from_millis(row.get(4)?),
            retry_count: row.get(5)?,
            last_error: row.get(6)?,
        })
    }
}
