use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Full work item as mirrored locally
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItemRecord {
  pub id: i64,
  pub rev: i64,
  pub state: Option<String>,
  pub work_item_type: Option<String>,
  pub title: Option<String>,
  pub assignee: Option<String>,
  pub created: Option<DateTime<Utc>>,
  pub changed: Option<DateTime<Utc>>,
  pub comment_count: u32,
  /// Every remote field, including organization-specific custom fields
  pub fields: BTreeMap<String, Value>,
  /// The remote payload exactly as received
  pub raw: String,
}

impl WorkItemRecord {
  /// Signature over the mutable parts of the record.
  ///
  /// `fields` is a BTreeMap so its JSON form is stable across fetches.
  pub fn content_signature(&self) -> String {
    let fields = serde_json::to_string(&self.fields).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(self.rev.to_le_bytes());
    hasher.update(fields.as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// Reference returned by a query; ids only, no details
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItemRef {
  pub id: i64,
  pub url: Option<String>,
}

/// Discussion comment attached to a work item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentRecord {
  pub id: i64,
  pub work_item_id: i64,
  pub text: String,
  pub author: Option<String>,
  pub created: Option<DateTime<Utc>>,
  pub modified: Option<DateTime<Utc>>,
  pub content_hash: String,
}

/// Hash of comment text concatenated with its modified timestamp.
pub fn comment_content_hash(text: &str, modified: Option<&DateTime<Utc>>) -> String {
  let mut hasher = Sha256::new();
  hasher.update(text.as_bytes());
  if let Some(modified) = modified {
    hasher.update(format_timestamp(modified).as_bytes());
  }
  hex::encode(hasher.finalize())
}

/// Per-item sync bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
  pub work_item_id: i64,
  pub last_synced_at: DateTime<Utc>,
  pub signature: String,
  pub revision: i64,
}

/// Canonical timestamp form used for hashing and storage.
///
/// Fixed width and always UTC, so stored values sort lexicographically.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
  ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a remote or stored RFC 3339 timestamp.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .ok()
    .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn record(rev: i64, title: &str) -> WorkItemRecord {
    let mut fields = BTreeMap::new();
    fields.insert("System.Title".to_string(), json!(title));
    fields.insert("Custom.Score".to_string(), json!(3));
    WorkItemRecord {
      id: 1,
      rev,
      state: None,
      work_item_type: None,
      title: Some(title.to_string()),
      assignee: None,
      created: None,
      changed: None,
      comment_count: 0,
      fields,
      raw: "{}".to_string(),
    }
  }

  #[test]
  fn test_signature_stable_for_equal_content() {
    assert_eq!(
      record(3, "a").content_signature(),
      record(3, "a").content_signature()
    );
  }

  #[test]
  fn test_signature_changes_with_fields_or_rev() {
    let base = record(3, "a").content_signature();
    assert_ne!(base, record(4, "a").content_signature());
    assert_ne!(base, record(3, "b").content_signature());
  }

  #[test]
  fn test_comment_hash_tracks_modified_time() {
    let t1 = parse_timestamp("2024-05-01T10:00:00Z").unwrap();
    let t2 = parse_timestamp("2024-05-01T10:00:01Z").unwrap();
    assert_eq!(
      comment_content_hash("hello", Some(&t1)),
      comment_content_hash("hello", Some(&t1))
    );
    assert_ne!(
      comment_content_hash("hello", Some(&t1)),
      comment_content_hash("hello", Some(&t2))
    );
    assert_ne!(
      comment_content_hash("hello", Some(&t1)),
      comment_content_hash("hello!", Some(&t1))
    );
  }

  #[test]
  fn test_timestamp_format_sorts() {
    let early = parse_timestamp("2024-01-02T03:04:05+02:00").unwrap();
    let late = parse_timestamp("2024-01-02T03:04:06Z").unwrap();
    assert!(format_timestamp(&early) < format_timestamp(&late));
    assert_eq!(format_timestamp(&late), "2024-01-02T03:04:06.000000Z");
  }
}
