//! Sync checkpoint model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Process-wide incremental sync watermark
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    /// Server watermark of the last fully applied pull
    pub last_pull_at: Option<DateTime<Utc>>,
    /// Completion time of the last successful full sync
    pub last_full_sync_at: Option<DateTime<Utc>>,
}

impl SyncCheckpoint {
    /// Watermark after applying a batch stamped `server_at`; never moves backwards.
    #[must_use]
    pub fn advanced_to(self, server_at: DateTime<Utc>) -> Self {
        let last_pull_at = match self.last_pull_at {
            Some(current) if current >= server_at => current,
            _ => server_at,
        };
        Self {
            last_pull_at: Some(last_pull_at),
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::from_millis;

    #[test]
    fn advance_never_moves_backwards() {
        let checkpoint = SyncCheckpoint::default().advanced_to(from_millis(500));
        assert_eq!(checkpoint.last_pull_at, Some(from_millis(500)));

        let older = checkpoint.advanced_to(from_millis(100));
        assert_eq!(older.last_pull_at, Some(from_millis(500)));

        let newer = checkpoint.advanced_to(from_millis(900));
        assert_eq!(newer.last_pull_at, Some(from_millis(900)));
    }
}
