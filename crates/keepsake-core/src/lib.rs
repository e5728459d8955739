//! keepsake-core - Offline-first record store and sync engine
//!
//! Every local write commits to `SQLite` together with an outbox entry
//! describing the mutation. The sync engine replays the outbox against a
//! remote API, pulls remote changes since a checkpoint and resolves
//! divergence with last-writer-wins on `updated_at`.

pub mod auth;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod remote;
pub mod services;
pub mod sync;
pub mod util;

pub use config::SyncSettings;
pub use error::{Error, Result};
pub use models::{Record, RecordFields, RecordId};
pub use services::RecordStore;
pub use sync::{SyncEngine, SyncError, SyncMode, SyncScheduler};
