//! Persistent logs of sync conflicts and hard sync errors

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use super::conversion_error;
use crate::error::Result;
use crate::models::{ConflictWinner, OutboxEntry, RecordId, SyncConflict, SyncErrorRecord};
use crate::util::from_millis;

/// Access to the `sync_conflicts` and `sync_errors` tables
pub struct SyncLog<'a> {
    conn: &'a Connection,
}

impl<'a> SyncLog<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Record a last-writer-wins decision.
    ///
    /// The same decision (record, local and incoming timestamps) is logged once,
    /// so redelivered pull batches do not duplicate rows.
    pub fn record_conflict(
        &self,
        record_id: &RecordId,
        local_updated_at: DateTime<Utc>,
        incoming_updated_at: DateTime<Utc>,
        winner: ConflictWinner,
        resolved_at: DateTime<Utc>,
    ) -> Result<bool> {
        let rows = self.conn.execute(
            "INSERT INTO sync_conflicts (
                record_id, local_updated_at, incoming_updated_at, resolved_at, winner
             )
             SELECT ?1, ?2, ?3, ?4, ?5
             WHERE NOT EXISTS (
                SELECT 1 FROM sync_conflicts
                WHERE record_id = ?1 AND local_updated_at = ?2 AND incoming_updated_at = ?3
             )",
            params![
                record_id.as_str(),
                local_updated_at.timestamp_millis(),
                incoming_updated_at.timestamp_millis(),
                resolved_at.timestamp_millis(),
                winner.as_str()
            ],
        )?;

        if rows > 0 {
            tracing::warn!(
                %record_id,
                winner = winner.as_str(),
                "Resolved sync conflict by last-writer-wins"
            );
        }
        Ok(rows > 0)
    }

    /// Most recent conflicts first
    pub fn list_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, record_id, local_updated_at, incoming_updated_at, resolved_at, winner
             FROM sync_conflicts
             ORDER BY resolved_at DESC, id DESC
             LIMIT ?",
        )?;

        let conflicts = stmt
            .query_map(params![i64::try_from(limit).unwrap_or(i64::MAX)], |row| {
                let record_id: String = row.get(1)?;
                let winner: String = row.get(5)?;
                Ok(SyncConflict {
                    id: row.get(0)?,
                    record_id: record_id
                        .parse()
                        .map_err(|error| conversion_error(1, error))?,
                    local_updated_at: from_millis(row.get(2)?),
                    incoming_updated_at: from_millis(row.get(3)?),
                    resolved_at: from_millis(row.get(4)?),
                    winner: if winner == "local" {
                        ConflictWinner::Local
                    } else {
                        ConflictWinner::Remote
                    },
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(conflicts)
    }

    /// Surface a dropped outbox entry as a visible per-record error
    pub fn record_error(
        &self,
        entry: &OutboxEntry,
        kind: &str,
        message: &str,
        occurred_at: DateTime<Utc>,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO sync_errors (record_id, entry_id, operation, kind, message, occurred_at)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                entry.record_id.as_str(),
                entry.entry_id,
                entry.operation.as_str(),
                kind,
                message,
                occurred_at.timestamp_millis()
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Most recent errors first
    pub fn list_errors(&self, limit: usize) -> Result<Vec<SyncErrorRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, record_id, entry_id, operation, kind, message, occurred_at
             FROM sync_errors
             ORDER BY occurred_at DESC, id DESC
             LIMIT ?",
        )?;

        let errors = stmt
            .query_map(params![i64::try_from(limit).unwrap_or(i64::MAX)], |row| {
                let record_id: String = row.get(1)?;
                Ok(SyncErrorRecord {
                    id: row.get(0)?,
                    record_id: record_id
                        .parse()
                        .map_err(|error| conversion_error(1, error))?,
                    entry_id: row.get(2)?,
                    operation: row.get(3)?,
                    kind: row.get(4)?,
                    message: row.get(5)?,
                    occurred_at: from_millis(row.get(6)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(errors)
    }

    /// Acknowledge (clear) every logged error; returns how many were removed
    pub fn clear_errors(&self) -> Result<usize> {
        Ok(self.conn.execute("DELETE FROM sync_errors", [])?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{MutationPayload, OutboxOperation};

    #[test]
    fn test_conflict_logged_once() {
        let db = Database::open_in_memory().unwrap();
        let log = SyncLog::new(db.connection());
        let id = RecordId::new();

        assert!(log
            .record_conflict(&id, from_millis(10), from_millis(5), ConflictWinner::Local, from_millis(20))
            .unwrap());
        assert!(!log
            .record_conflict(&id, from_millis(10), from_millis(5), ConflictWinner::Local, from_millis(30))
            .unwrap());

        let conflicts = log.list_conflicts(10).unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].record_id, id);
        assert_eq!(conflicts[0].winner, ConflictWinner::Local);
    }

    #[test]
    fn test_errors_round_trip_and_clear() {
        let db = Database::open_in_memory().unwrap();
        let log = SyncLog::new(db.connection());
        let record_id = RecordId::new();
        let entry = OutboxEntry {
            entry_id: 7,
            operation: OutboxOperation::Update,
            record_id,
            payload: MutationPayload {
                schema: 1,
                record_id,
                fields: Some(serde_json::Map::new()),
                updated_at: from_millis(1),
                deleted_at: None,
            },
            created_at: from_millis(1),
            retry_count: 3,
            last_error: None,
        };

        log.record_error(&entry, "rejected", "HTTP 422", from_millis(100))
            .unwrap();
        let errors = log.list_errors(5).unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].entry_id, 7);
        assert_eq!(errors[0].operation, "update");
        assert_eq!(errors[0].kind, "rejected");

        assert_eq!(log.clear_errors().unwrap(), 1);
        assert!(log.list_errors(5).unwrap().is_empty());
    }
}
