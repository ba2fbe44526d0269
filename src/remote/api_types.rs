//! Serde-deserializable types matching the work item REST API responses.
//!
//! These types are separate from domain types to allow clean deserialization
//! while keeping domain types focused on what the mirror stores.

use serde::Deserialize;
use serde_json::value::RawValue;
use serde_json::Value;
use std::collections::BTreeMap;

use super::types::{comment_content_hash, parse_timestamp, CommentRecord, WorkItemRecord, WorkItemRef};

// ============================================================================
// Well-known field reference names
// ============================================================================

pub const FIELD_STATE: &str = "System.State";
pub const FIELD_TYPE: &str = "System.WorkItemType";
pub const FIELD_TITLE: &str = "System.Title";
pub const FIELD_ASSIGNED_TO: &str = "System.AssignedTo";
pub const FIELD_CREATED: &str = "System.CreatedDate";
pub const FIELD_CHANGED: &str = "System.ChangedDate";
pub const FIELD_COMMENT_COUNT: &str = "System.CommentCount";

// ============================================================================
// Work items
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiWorkItem {
  pub id: i64,
  #[serde(default)]
  pub rev: i64,
  #[serde(default)]
  pub fields: BTreeMap<String, Value>,
}

impl ApiWorkItem {
  /// Parse one work item, keeping the payload text untouched.
  pub fn parse(raw: &str) -> serde_json::Result<WorkItemRecord> {
    let item: ApiWorkItem = serde_json::from_str(raw)?;
    Ok(item.into_record(raw.to_string()))
  }

  pub fn into_record(self, raw: String) -> WorkItemRecord {
    let text = |name: &str| self.fields.get(name).and_then(Value::as_str).map(String::from);
    let timestamp = |name: &str| {
      self
        .fields
        .get(name)
        .and_then(Value::as_str)
        .and_then(parse_timestamp)
    };

    WorkItemRecord {
      id: self.id,
      rev: self.rev,
      state: text(FIELD_STATE),
      work_item_type: text(FIELD_TYPE),
      title: text(FIELD_TITLE),
      assignee: self.fields.get(FIELD_ASSIGNED_TO).and_then(identity_name),
      created: timestamp(FIELD_CREATED),
      changed: timestamp(FIELD_CHANGED),
      comment_count: self
        .fields
        .get(FIELD_COMMENT_COUNT)
        .and_then(Value::as_u64)
        .map(|n| n.min(u32::MAX as u64) as u32)
        .unwrap_or(0),
      fields: self.fields,
      raw,
    }
  }
}

/// Identity fields come back either as a plain string or as an identity object.
fn identity_name(value: &Value) -> Option<String> {
  match value {
    Value::String(s) if !s.is_empty() => Some(s.clone()),
    Value::Object(obj) => obj
      .get("uniqueName")
      .or_else(|| obj.get("displayName"))
      .and_then(Value::as_str)
      .map(String::from),
    _ => None,
  }
}

/// Batch endpoint response. With `errorPolicy: omit` the slots of ids that
/// could not be read are `null`, in request order.
#[derive(Debug, Deserialize)]
pub struct ApiBatchResponse<'a> {
  #[serde(default, borrow)]
  pub value: Vec<Option<&'a RawValue>>,
}

// ============================================================================
// Queries
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiWorkItemRef {
  pub id: i64,
  pub url: Option<String>,
}

impl From<ApiWorkItemRef> for WorkItemRef {
  fn from(r: ApiWorkItemRef) -> Self {
    WorkItemRef { id: r.id, url: r.url }
  }
}

#[derive(Debug, Deserialize)]
pub struct ApiQueryResponse {
  #[serde(rename = "workItems", default)]
  pub work_items: Vec<ApiWorkItemRef>,
}

// ============================================================================
// Comments
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiIdentityRef {
  #[serde(rename = "uniqueName")]
  pub unique_name: Option<String>,
  #[serde(rename = "displayName")]
  pub display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApiComment {
  pub id: i64,
  #[serde(rename = "workItemId")]
  pub work_item_id: i64,
  #[serde(default)]
  pub text: String,
  #[serde(rename = "createdBy")]
  pub created_by: Option<ApiIdentityRef>,
  #[serde(rename = "createdDate")]
  pub created_date: Option<String>,
  #[serde(rename = "modifiedDate")]
  pub modified_date: Option<String>,
}

impl ApiComment {
  pub fn into_record(self) -> CommentRecord {
    let modified = self.modified_date.as_deref().and_then(parse_timestamp);
    CommentRecord {
      id: self.id,
      work_item_id: self.work_item_id,
      content_hash: comment_content_hash(&self.text, modified.as_ref()),
      author: self
        .created_by
        .and_then(|who| who.unique_name.or(who.display_name)),
      created: self.created_date.as_deref().and_then(parse_timestamp),
      modified,
      text: self.text,
    }
  }
}

#[derive(Debug, Deserialize)]
pub struct ApiCommentList {
  #[serde(default)]
  pub comments: Vec<ApiComment>,
  #[serde(rename = "continuationToken")]
  pub continuation_token: Option<String>,
}

// ============================================================================
// Errors
// ============================================================================

/// Error body shape used by the service for 4xx/5xx responses
#[derive(Debug, Deserialize)]
pub struct ApiErrorBody {
  pub message: Option<String>,
  #[serde(rename = "typeKey")]
  pub type_key: Option<String>,
}
