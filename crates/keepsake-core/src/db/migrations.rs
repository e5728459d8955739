//! Database migrations
//!
//! Each migration runs in its own transaction together with the version
//! marker bump, so a failure leaves the store at the last applied version.

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use crate::error::{Error, Result};

/// A versioned, idempotent schema change
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub statements: &'static [&'static str],
}

/// Failure while applying a single migration
#[derive(Debug, Error)]
#[error("Migration to schema version {version} failed: {source}")]
pub struct MigrationError {
    /// Version that failed to apply
    pub version: u32,
    #[source]
    pub source: rusqlite::Error,
}

/// Built-in schema, in ascending version order
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "records table",
        statements: &[
            "CREATE TABLE IF NOT EXISTS records (
                id TEXT PRIMARY KEY,
                fields TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                synced_at INTEGER,
                deleted_at INTEGER
            )",
            "CREATE INDEX IF NOT EXISTS idx_records_updated ON records(updated_at, id)",
            "CREATE INDEX IF NOT EXISTS idx_records_deleted ON records(deleted_at)",
        ],
    },
    Migration {
        version: 2,
        description: "outbox mutation queue",
        statements: &[
            "CREATE TABLE IF NOT EXISTS outbox (
                entry_id INTEGER PRIMARY KEY AUTOINCREMENT,
                operation TEXT NOT NULL CHECK (operation IN ('create', 'update', 'delete')),
                record_id TEXT NOT NULL REFERENCES records(id),
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT
            )",
            "CREATE INDEX IF NOT EXISTS idx_outbox_record ON outbox(record_id, entry_id)",
        ],
    },
    Migration {
        version: 3,
        description: "sync state, error and conflict logs",
        statements: &[
            "CREATE TABLE IF NOT EXISTS sync_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS sync_errors (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                record_id TEXT NOT NULL,
                entry_id INTEGER NOT NULL,
                operation TEXT NOT NULL,
                kind TEXT NOT NULL,
                message TEXT NOT NULL,
                occurred_at INTEGER NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_sync_errors_occurred_at ON sync_errors(occurred_at DESC)",
            "CREATE TABLE IF NOT EXISTS sync_conflicts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                record_id TEXT NOT NULL,
                local_updated_at INTEGER NOT NULL,
                incoming_updated_at INTEGER NOT NULL,
                resolved_at INTEGER NOT NULL,
                winner TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_record_id ON sync_conflicts(record_id)",
            "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_resolved_at ON sync_conflicts(resolved_at DESC)",
        ],
    },
];

/// Latest built-in schema version
pub fn latest_version() -> u32 {
    MIGRATIONS.iter().map(|m| m.version).max().unwrap_or(0)
}

/// Run all pending built-in migrations
pub fn run(conn: &Connection) -> Result<u32> {
    migrate(conn, MIGRATIONS)
}

/// Get the current schema version (0 when the marker table does not exist yet)
pub fn current_version(conn: &Connection) -> Result<u32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version: Option<u32> = conn
        .query_row(
            "SELECT version FROM schema_version WHERE id = 1",
            [],
            |row| row.get(0),
        )
        .optional()?;

    Ok(version.unwrap_or(0))
}

/// Apply every migration newer than the persisted marker, in ascending order.
///
/// Returns the resulting schema version.
pub fn migrate(conn: &Connection, migrations: &[Migration]) -> Result<u32> {
    let mut ordered: Vec<&Migration> = migrations.iter().collect();
    ordered.sort_by_key(|m| m.version);
    if let Some(pair) = ordered.windows(2).find(|pair| pair[0].version == pair[1].version) {
        return Err(Error::InvalidInput(format!(
            "duplicate migration version {}",
            pair[0].version
        )));
    }

    let start = current_version(conn)?;
    let mut version = start;
    for migration in ordered.into_iter().filter(|m| m.version > start) {
        apply(conn, migration).map_err(|source| MigrationError {
            version: migration.version,
            source,
        })?;
        version = migration.version;
        tracing::info!(
            "Migrated database to version {} ({})",
            migration.version,
            migration.description
        );
    }

    Ok(version)
}

fn apply(conn: &Connection, migration: &Migration) -> rusqlite::Result<()> {
    let tx = conn.unchecked_transaction()?;

    tx.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            version INTEGER NOT NULL
        )",
        [],
    )?;

    for stmt in migration.statements {
        tx.execute(stmt, [])?;
    }

    tx.execute(
        "INSERT INTO schema_version (id, version) VALUES (1, ?1)
         ON CONFLICT(id) DO UPDATE SET version = excluded.version",
        params![migration.version],
    )?;

    // Dropping an uncommitted transaction rolls it back.
    tx.commit()
}
