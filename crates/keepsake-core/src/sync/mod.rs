//! Outbox replay, incremental pull and the scheduling around them.

mod engine;
mod scheduler;
mod state;

pub use engine::{SyncEngine, SyncError};
pub use scheduler::{SchedulerEvent, SchedulerHandle, SyncDriver, SyncScheduler};
pub use state::{
    ItemError, ItemErrorKind, PullSummary, SyncEvents, SyncMode, SyncNotification, SyncResult,
    SyncState, SyncStatus,
};
