//! Data models for Keepsake

mod checkpoint;
mod outbox;
mod record;
mod sync_conflict;

pub use checkpoint::SyncCheckpoint;
pub use outbox::{MutationPayload, OutboxEntry, OutboxOperation, PAYLOAD_SCHEMA_VERSION};
pub use record::{fields_from_value, merge_fields, Record, RecordFields, RecordId, RemoteRecord};
pub use sync_conflict::{ConflictWinner, SyncConflict, SyncErrorRecord};
