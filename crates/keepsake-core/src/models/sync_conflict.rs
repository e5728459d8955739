//! Sync conflict and sync error log models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::record::RecordId;

/// Side that won a last-writer-wins decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictWinner {
    Local,
    Remote,
}

impl ConflictWinner {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

/// Recorded sync conflict resolved by last-writer-wins
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Conflict row identifier
    pub id: i64,
    /// Record involved in the conflict
    pub record_id: RecordId,
    /// Local row's timestamp when the conflict occurred
    pub local_updated_at: DateTime<Utc>,
    /// Incoming row's timestamp
    pub incoming_updated_at: DateTime<Utc>,
    /// Resolution timestamp
    pub resolved_at: DateTime<Utc>,
    /// Which version was kept
    pub winner: ConflictWinner,
}

/// A hard, per-record sync failure surfaced to the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncErrorRecord {
    pub id: i64,
    pub record_id: RecordId,
    /// Outbox entry that was dropped
    pub entry_id: i64,
    pub operation: String,
    /// Short machine-readable classification (e.g. `rejected`, `retry_exhausted`)
    pub kind: String,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}
