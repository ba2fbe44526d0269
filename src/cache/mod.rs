//! Local mirror of remote work items.
//!
//! Readers only ever touch this store; the sync engine is its only writer.
//! Records removed remotely are tombstoned first and purged after the
//! retention window, so a short-lived disappearance never loses data.

mod storage;
mod traits;

pub use storage::SqliteStore;
pub use traits::{BatchWriteOutcome, LocalStore, StoredRecord};
