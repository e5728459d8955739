//! Database connection management

use std::path::Path;
use std::time::Duration;

use rusqlite::Connection;

use super::migrations::{self, MigrationError};
use crate::error::{Error, Result};

/// Database wrapper for the local `SQLite` store
pub struct Database {
    conn: Connection,
    schema_version: u32,
}

impl Database {
    /// Open a database at the given path, creating it if it doesn't exist
    ///
    /// Runs migrations automatically. A failed migration is returned as
    /// [`Error::Migration`]; use [`Database::open_lenient`] to keep working at
    /// the last applied version instead.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Self::connect(path.as_ref())?;
        Self::from_connection(conn)
    }

    /// Open an in-memory database (useful for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    /// Open a database, tolerating a failed migration.
    ///
    /// The returned store is usable at the version reported by
    /// [`Database::schema_version`]; the migration failure is handed back so
    /// the host can surface it.
    pub fn open_lenient(path: impl AsRef<Path>) -> Result<(Self, Option<MigrationError>)> {
        let conn = Self::connect(path.as_ref())?;
        Self::configure(&conn)?;
        match migrations::run(&conn) {
            Ok(schema_version) => Ok((
                Self {
                    conn,
                    schema_version,
                },
                None,
            )),
            Err(Error::Migration(error)) => {
                let schema_version = migrations::current_version(&conn)?;
                tracing::error!(
                    "Schema migration to version {} failed; continuing at version {}: {}",
                    error.version,
                    schema_version,
                    error.source
                );
                Ok((
                    Self {
                        conn,
                        schema_version,
                    },
                    Some(error),
                ))
            }
            Err(error) => Err(error),
        }
    }

    fn connect(path: &Path) -> Result<Connection> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Connection::open(path)?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        Self::configure(&conn)?;
        let schema_version = migrations::run(&conn)?;
        Ok(Self {
            conn,
            schema_version,
        })
    }

    /// Configure `SQLite` for a single-writer local store
    fn configure(conn: &Connection) -> Result<()> {
        // WAL is unavailable for in-memory databases; ignore the failure there.
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(())
    }

    /// Schema version the store is running at
    pub const fn schema_version(&self) -> u32 {
        self.schema_version
    }

    /// Get a reference to the underlying connection
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }
}
