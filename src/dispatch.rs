//! Tool-call surface for automated callers.
//!
//! Reads are served from the local store only and never wait on a sync
//! pass. `trigger_sync` is the one tool that reaches the network.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::cache::{LocalStore, StoredRecord};
use crate::remote::types::CommentRecord;
use crate::sync::{SyncHandle, SyncMode, SyncReport, SyncStatus};

pub const TOOL_NAMES: [&str; 4] = ["trigger_sync", "get_sync_status", "get_work_item", "list_work_items"];

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TriggerSyncArgs {
  pub concurrency: Option<usize>,
  /// Run a full sweep (applies deletions) instead of an incremental pass
  pub full: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TriggerSyncResult {
  pub synced: usize,
  pub failed: usize,
  pub report: SyncReport,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GetWorkItemArgs {
  id: i64,
  #[serde(default)]
  include_deleted: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ListWorkItemsArgs {
  include_deleted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkItemView {
  #[serde(flatten)]
  pub stored: StoredRecord,
  pub comments: Vec<CommentRecord>,
}

pub struct ToolDispatcher<S> {
  store: Arc<S>,
  sync: SyncHandle<S>,
}

impl<S: LocalStore + 'static> ToolDispatcher<S> {
  pub fn new(store: Arc<S>, sync: SyncHandle<S>) -> Self {
    Self { store, sync }
  }

  /// Run a pass now and report how many items were synced and failed.
  pub async fn trigger_sync(&self, args: TriggerSyncArgs) -> Result<TriggerSyncResult> {
    if args.concurrency == Some(0) {
      return Err(eyre!("concurrency must be at least 1"));
    }
    let mode = if args.full {
      SyncMode::Full
    } else {
      SyncMode::Incremental
    };
    let report = self.sync.trigger_sync(mode, args.concurrency).await?;
    Ok(TriggerSyncResult {
      synced: report.written,
      failed: report.failed.len(),
      report,
    })
  }

  pub fn get_sync_status(&self) -> SyncStatus {
    self.sync.status()
  }

  /// A cached work item with its comments. Tombstoned items are hidden
  /// unless asked for.
  pub fn get_work_item(&self, id: i64, include_deleted: bool) -> Result<Option<WorkItemView>> {
    let Some(stored) = self.store.find_by_id(id)? else {
      return Ok(None);
    };
    if stored.is_deleted() && !include_deleted {
      return Ok(None);
    }
    let comments = self.store.list_comments(id)?;
    Ok(Some(WorkItemView { stored, comments }))
  }

  pub fn list_work_items(&self, include_deleted: bool) -> Result<Vec<StoredRecord>> {
    self.store.list_records(include_deleted)
  }

  /// Dispatch a tool call by name with JSON arguments.
  pub async fn dispatch(&self, tool: &str, args: Value) -> Result<Value> {
    // Tools without arguments accept null as well as {}
    let args = if args.is_null() {
      Value::Object(Default::default())
    } else {
      args
    };

    let result = match tool {
      "trigger_sync" => serde_json::to_value(self.trigger_sync(parse_args(tool, args)?).await?),
      "get_sync_status" => serde_json::to_value(self.get_sync_status()),
      "get_work_item" => {
        let args: GetWorkItemArgs = parse_args(tool, args)?;
        serde_json::to_value(self.get_work_item(args.id, args.include_deleted)?)
      }
      "list_work_items" => {
        let args: ListWorkItemsArgs = parse_args(tool, args)?;
        serde_json::to_value(self.list_work_items(args.include_deleted)?)
      }
      other => {
        return Err(eyre!(
          "Unknown tool '{}'; available tools: {}",
          other,
          TOOL_NAMES.join(", ")
        ))
      }
    };
    result.map_err(|e| eyre!("Failed to serialize {} result: {}", tool, e))
  }
}

fn parse_args<T: for<'de> Deserialize<'de>>(tool: &str, args: Value) -> Result<T> {
  serde_json::from_value(args).map_err(|e| eyre!("Invalid arguments for {}: {}", tool, e))
}
