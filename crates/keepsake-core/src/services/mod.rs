//! Async services shared across the host application and the sync engine.

mod record_store;

pub use record_store::RecordStore;
