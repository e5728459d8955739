//! Observable sync state, cycle results and notifications.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, watch};

use crate::models::{OutboxEntry, RecordId};

const NOTIFICATION_CAPACITY: usize = 64;

/// Phase of the engine state machine
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Idle,
    Pushing,
    Pulling,
    Error,
}

impl SyncStatus {
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Pushing | Self::Pulling)
    }
}

/// Which pull strategy a cycle uses
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Push, then pull changes since the checkpoint
    #[default]
    Quick,
    /// Push, then pull everything
    Full,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Quick => "quick",
            Self::Full => "full",
        })
    }
}

/// Snapshot published to observers whenever the engine changes state
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SyncState {
    pub status: SyncStatus,
    pub last_sync: Option<DateTime<Utc>>,
    pub pending_count: usize,
    pub error: Option<String>,
}

/// Per-record outcome category
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemErrorKind {
    /// Network or server failure; the entry stays queued
    Transient,
    /// Remote state diverged; a pull runs before the entry is retried
    Conflict,
    /// The remote rejected the entry; it was dropped
    PermanentRejection,
    /// The entry failed too many times and was dropped
    RetryExhausted,
    /// The entry was not attempted because an earlier entry for the record failed
    Blocked,
}

impl ItemErrorKind {
    /// Whether the entry is still queued and a later cycle may deliver it
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::Conflict | Self::Blocked)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Conflict => "conflict",
            Self::PermanentRejection => "rejected",
            Self::RetryExhausted => "retry_exhausted",
            Self::Blocked => "blocked",
        }
    }
}

/// A per-record failure inside an otherwise completed cycle
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ItemError {
    pub record_id: RecordId,
    pub entry_id: Option<i64>,
    pub kind: ItemErrorKind,
    pub message: String,
}

impl ItemError {
    pub fn for_entry(entry: &OutboxEntry, kind: ItemErrorKind, message: impl Into<String>) -> Self {
        Self {
            record_id: entry.record_id,
            entry_id: Some(entry.entry_id),
            kind,
            message: message.into(),
        }
    }
}

/// Counts of how pulled items were applied
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PullSummary {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub kept_local: usize,
    pub deleted: usize,
    /// Local outbox entries discarded because a newer remote version won
    pub superseded: usize,
}

impl PullSummary {
    /// Items that changed local state
    #[must_use]
    pub const fn applied(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }
}

/// Outcome of one completed sync cycle
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SyncResult {
    pub mode: SyncMode,
    /// Outbox entries acknowledged by the remote
    pub processed_count: usize,
    pub error_count: usize,
    pub errors: Vec<ItemError>,
    /// Remote items received in the pull phase
    pub pulled_count: usize,
    pub pull: PullSummary,
}

impl SyncResult {
    #[must_use]
    pub fn new(mode: SyncMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn push_error(&mut self, error: ItemError) {
        tracing::debug!(
            record_id = %error.record_id,
            kind = error.kind.as_str(),
            "Sync item failed: {}",
            error.message
        );
        self.error_count += 1;
        self.errors.push(error);
    }

    /// Whether some entries failed in a way a later retry may fix
    #[must_use]
    pub fn has_retryable_failures(&self) -> bool {
        self.errors.iter().any(|error| error.kind.is_retryable())
    }
}

/// Discrete events for UI indicators
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncNotification {
    SyncStart { mode: SyncMode },
    SyncComplete(SyncResult),
    SyncError { message: String },
    NetworkChange { online: bool },
}

/// Publisher side of the observability hooks.
#[derive(Clone)]
pub struct SyncEvents {
    state: Arc<watch::Sender<SyncState>>,
    notifications: broadcast::Sender<SyncNotification>,
}

impl Default for SyncEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncEvents {
    #[must_use]
    pub fn new() -> Self {
        let (state, _) = watch::channel(SyncState::default());
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            state: Arc::new(state),
            notifications,
        }
    }

    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<SyncNotification> {
        self.notifications.subscribe()
    }

    #[must_use]
    pub fn current_state(&self) -> SyncState {
        self.state.borrow().clone()
    }

    pub fn update_state(&self, update: impl FnOnce(&mut SyncState)) {
        self.state.send_modify(update);
    }

    pub fn notify(&self, notification: SyncNotification) {
        // No subscribers is fine.
        let _ = self.notifications.send(notification);
    }
}
