//! Contract between the sync engine and whatever persists the mirror.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde::Serialize;
use std::collections::HashMap;

use crate::remote::types::{CommentRecord, SyncCursor, WorkItemRecord};

/// A mirrored work item plus local bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredRecord {
  pub record: WorkItemRecord,
  /// When this row was last written
  pub synced_at: DateTime<Utc>,
  /// Tombstone; set when a full sweep stopped listing the id
  pub deleted_at: Option<DateTime<Utc>>,
}

impl StoredRecord {
  pub fn is_deleted(&self) -> bool {
    self.deleted_at.is_some()
  }
}

/// Per-id result of a best-effort batched write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchWriteOutcome {
  /// Ids whose row was inserted or changed
  pub written: Vec<i64>,
  /// Ids the revision guard left alone because the stored rev is newer
  pub stale: Vec<i64>,
  /// Ids whose write failed, with the reason
  pub failed: Vec<(i64, String)>,
}

/// Persistent store for mirrored work items.
///
/// Every operation is atomic per item. Nothing here spans items except
/// `upsert_records`, which is best effort.
pub trait LocalStore: Send + Sync {
  /// Insert or update one record. Returns false when the stored revision
  /// is newer and the write was refused.
  fn upsert_record(&self, record: &WorkItemRecord) -> Result<bool>;

  /// Write many records, each in its own savepoint.
  fn upsert_records(&self, records: &[WorkItemRecord]) -> Result<BatchWriteOutcome>;

  /// Look up a record, tombstoned or not.
  fn find_by_id(&self, id: i64) -> Result<Option<StoredRecord>>;

  /// Ids of every live (not tombstoned) record, ascending.
  fn list_tracked_ids(&self) -> Result<Vec<i64>>;

  fn list_records(&self, include_deleted: bool) -> Result<Vec<StoredRecord>>;

  /// Tombstone a record and forget its cursor. Returns false if the id is
  /// unknown or already tombstoned.
  fn mark_deleted(&self, id: i64, at: DateTime<Utc>) -> Result<bool>;

  /// Physically remove records (and their comments) tombstoned before `older_than`.
  fn purge_tombstones(&self, older_than: DateTime<Utc>) -> Result<usize>;

  /// Stored content hash per comment id.
  fn comment_hashes(&self, work_item_id: i64) -> Result<HashMap<i64, String>>;

  fn upsert_comment(&self, comment: &CommentRecord) -> Result<()>;

  /// Drop stored comments of `work_item_id` whose id is not in `keep`.
  /// Returns how many were removed.
  fn remove_comments_except(&self, work_item_id: i64, keep: &[i64]) -> Result<usize>;

  fn list_comments(&self, work_item_id: i64) -> Result<Vec<CommentRecord>>;

  fn find_cursor(&self, work_item_id: i64) -> Result<Option<SyncCursor>>;

  fn advance_cursor(&self, cursor: &SyncCursor) -> Result<()>;

  /// Start time of the last completed pass, the global freshness marker.
  fn last_pass_at(&self) -> Result<Option<DateTime<Utc>>>;

  fn record_pass(&self, at: DateTime<Utc>) -> Result<()>;
}
