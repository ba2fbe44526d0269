//! SQLite implementation of the local mirror.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::traits::{BatchWriteOutcome, LocalStore, StoredRecord};
use crate::remote::types::{format_timestamp, parse_timestamp, CommentRecord, SyncCursor, WorkItemRecord};

const LAST_PASS_KEY: &str = "last_pass_at";

/// SQLite-backed store. One connection, serialized by a mutex; every
/// call holds it for a single short statement or transaction.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open (or create) the database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;
    Self::with_connection(conn)
  }

  /// Open the database at the default location.
  pub fn open_default() -> Result<Self> {
    Self::open(&Self::default_path()?)
  }

  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::with_connection(conn)
  }

  /// Default database path under the user data directory.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("wisync").join("mirror.db"))
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    Ok(store)
  }

  fn run_migrations(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(SCHEMA)
      .map_err(|e| eyre!("Failed to run migrations: {}", e))
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS work_items (
    id INTEGER PRIMARY KEY,
    rev INTEGER NOT NULL,
    state TEXT,
    work_item_type TEXT,
    title TEXT,
    assignee TEXT,
    created TEXT,
    changed TEXT,
    comment_count INTEGER NOT NULL DEFAULT 0,
    fields TEXT NOT NULL,
    raw TEXT NOT NULL,
    synced_at TEXT NOT NULL,
    deleted_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_work_items_deleted ON work_items(deleted_at);

CREATE TABLE IF NOT EXISTS comments (
    id INTEGER PRIMARY KEY,
    work_item_id INTEGER NOT NULL,
    text TEXT NOT NULL,
    author TEXT,
    created TEXT,
    modified TEXT,
    content_hash TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_comments_work_item ON comments(work_item_id);

CREATE TABLE IF NOT EXISTS sync_cursors (
    work_item_id INTEGER PRIMARY KEY,
    last_synced_at TEXT NOT NULL,
    signature TEXT NOT NULL,
    revision INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

// The WHERE clause on the update arm keeps revisions monotonic; a refused
// write reports zero changed rows.
const UPSERT_RECORD: &str = r#"
INSERT INTO work_items
    (id, rev, state, work_item_type, title, assignee, created, changed,
     comment_count, fields, raw, synced_at, deleted_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, NULL)
ON CONFLICT(id) DO UPDATE SET
    rev = excluded.rev,
    state = excluded.state,
    work_item_type = excluded.work_item_type,
    title = excluded.title,
    assignee = excluded.assignee,
    created = excluded.created,
    changed = excluded.changed,
    comment_count = excluded.comment_count,
    fields = excluded.fields,
    raw = excluded.raw,
    synced_at = excluded.synced_at,
    deleted_at = NULL
WHERE excluded.rev >= work_items.rev
"#;

const SELECT_RECORD: &str = "SELECT id, rev, state, work_item_type, title, assignee, created, changed, \
   comment_count, fields, raw, synced_at, deleted_at FROM work_items";

fn write_record(conn: &Connection, record: &WorkItemRecord) -> Result<bool> {
  let fields =
    serde_json::to_string(&record.fields).map_err(|e| eyre!("Failed to serialize fields: {}", e))?;
  let changed = conn
    .execute(
      UPSERT_RECORD,
      params![
        record.id,
        record.rev,
        record.state,
        record.work_item_type,
        record.title,
        record.assignee,
        record.created.as_ref().map(format_timestamp),
        record.changed.as_ref().map(format_timestamp),
        record.comment_count,
        fields,
        record.raw,
        format_timestamp(&Utc::now()),
      ],
    )
    .map_err(|e| eyre!("Failed to store work item {}: {}", record.id, e))?;
  Ok(changed > 0)
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
  match row.get::<_, Option<String>>(idx)? {
    Some(s) => parse_timestamp(&s)
      .map(Some)
      .ok_or_else(|| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, format!("bad timestamp {:?}", s).into())),
    None => Ok(None),
  }
}

fn required_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
  timestamp_column(row, idx)?.ok_or(rusqlite::Error::InvalidColumnType(idx, "timestamp".into(), Type::Null))
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<StoredRecord> {
  let fields: String = row.get(9)?;
  let fields = serde_json::from_str(&fields)
    .map_err(|e| rusqlite::Error::FromSqlConversionFailure(9, Type::Text, Box::new(e)))?;

  Ok(StoredRecord {
    record: WorkItemRecord {
      id: row.get(0)?,
      rev: row.get(1)?,
      state: row.get(2)?,
      work_item_type: row.get(3)?,
      title: row.get(4)?,
      assignee: row.get(5)?,
      created: timestamp_column(row, 6)?,
      changed: timestamp_column(row, 7)?,
      comment_count: row.get(8)?,
      fields,
      raw: row.get(10)?,
    },
    synced_at: required_timestamp(row, 11)?,
    deleted_at: timestamp_column(row, 12)?,
  })
}

fn comment_from_row(row: &Row<'_>) -> rusqlite::Result<CommentRecord> {
  Ok(CommentRecord {
    id: row.get(0)?,
    work_item_id: row.get(1)?,
    text: row.get(2)?,
    author: row.get(3)?,
    created: timestamp_column(row, 4)?,
    modified: timestamp_column(row, 5)?,
    content_hash: row.get(6)?,
  })
}

impl LocalStore for SqliteStore {
  fn upsert_record(&self, record: &WorkItemRecord) -> Result<bool> {
    let conn = self.lock()?;
    write_record(&conn, record)
  }

  fn upsert_records(&self, records: &[WorkItemRecord]) -> Result<BatchWriteOutcome> {
    let mut conn = self.lock()?;
    let mut tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
    let mut outcome = BatchWriteOutcome::default();

    for record in records {
      let sp = tx
        .savepoint()
        .map_err(|e| eyre!("Failed to open savepoint: {}", e))?;
      // A dropped savepoint rolls back only this record
      match write_record(&sp, record) {
        Ok(written) => {
          sp.commit()
            .map_err(|e| eyre!("Failed to release savepoint: {}", e))?;
          if written {
            outcome.written.push(record.id);
          } else {
            outcome.stale.push(record.id);
          }
        }
        Err(e) => outcome.failed.push((record.id, e.to_string())),
      }
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(outcome)
  }

  fn find_by_id(&self, id: i64) -> Result<Option<StoredRecord>> {
    let conn = self.lock()?;
    conn
      .query_row(&format!("{} WHERE id = ?", SELECT_RECORD), params![id], record_from_row)
      .optional()
      .map_err(|e| eyre!("Failed to load work item {}: {}", id, e))
  }

  fn list_tracked_ids(&self) -> Result<Vec<i64>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT id FROM work_items WHERE deleted_at IS NULL ORDER BY id")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;
    let ids = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list work items: {}", e))?
      .collect::<rusqlite::Result<Vec<i64>>>()
      .map_err(|e| eyre!("Failed to read work item id: {}", e))?;
    Ok(ids)
  }

  fn list_records(&self, include_deleted: bool) -> Result<Vec<StoredRecord>> {
    let conn = self.lock()?;
    let sql = if include_deleted {
      format!("{} ORDER BY id", SELECT_RECORD)
    } else {
      format!("{} WHERE deleted_at IS NULL ORDER BY id", SELECT_RECORD)
    };
    let mut stmt = conn
      .prepare(&sql)
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;
    let records = stmt
      .query_map([], record_from_row)
      .map_err(|e| eyre!("Failed to list work items: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read work item: {}", e))?;
    Ok(records)
  }

  fn mark_deleted(&self, id: i64, at: DateTime<Utc>) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let changed = tx
      .execute(
        "UPDATE work_items SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL",
        params![format_timestamp(&at), id],
      )
      .map_err(|e| eyre!("Failed to tombstone work item {}: {}", id, e))?;
    tx.execute("DELETE FROM sync_cursors WHERE work_item_id = ?", params![id])
      .map_err(|e| eyre!("Failed to drop cursor for {}: {}", id, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(changed > 0)
  }

  fn purge_tombstones(&self, older_than: DateTime<Utc>) -> Result<usize> {
    let mut conn = self.lock()?;
    let cutoff = format_timestamp(&older_than);
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM comments WHERE work_item_id IN
         (SELECT id FROM work_items WHERE deleted_at IS NOT NULL AND deleted_at < ?)",
      params![cutoff],
    )
    .map_err(|e| eyre!("Failed to purge comments: {}", e))?;
    let purged = tx
      .execute(
        "DELETE FROM work_items WHERE deleted_at IS NOT NULL AND deleted_at < ?",
        params![cutoff],
      )
      .map_err(|e| eyre!("Failed to purge tombstones: {}", e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(purged)
  }

  fn comment_hashes(&self, work_item_id: i64) -> Result<HashMap<i64, String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT id, content_hash FROM comments WHERE work_item_id = ?")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;
    let hashes = stmt
      .query_map(params![work_item_id], |row| Ok((row.get(0)?, row.get(1)?)))
      .map_err(|e| eyre!("Failed to load comment hashes: {}", e))?
      .collect::<rusqlite::Result<HashMap<i64, String>>>()
      .map_err(|e| eyre!("Failed to read comment hash: {}", e))?;
    Ok(hashes)
  }

  fn upsert_comment(&self, comment: &CommentRecord) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO comments (id, work_item_id, text, author, created, modified, content_hash)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
          comment.id,
          comment.work_item_id,
          comment.text,
          comment.author,
          comment.created.as_ref().map(format_timestamp),
          comment.modified.as_ref().map(format_timestamp),
          comment.content_hash,
        ],
      )
      .map_err(|e| eyre!("Failed to store comment {}: {}", comment.id, e))?;
    Ok(())
  }

  fn remove_comments_except(&self, work_item_id: i64, keep: &[i64]) -> Result<usize> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let stored: Vec<i64> = {
      let mut stmt = tx
        .prepare("SELECT id FROM comments WHERE work_item_id = ?")
        .map_err(|e| eyre!("Failed to prepare query: {}", e))?;
      let ids = stmt
        .query_map(params![work_item_id], |row| row.get(0))
        .map_err(|e| eyre!("Failed to list comment ids: {}", e))?
        .collect::<rusqlite::Result<Vec<i64>>>()
        .map_err(|e| eyre!("Failed to read comment id: {}", e))?;
      ids
    };

    let mut removed = 0;
    for id in stored.into_iter().filter(|id| !keep.contains(id)) {
      removed += tx
        .execute(
          "DELETE FROM comments WHERE id = ? AND work_item_id = ?",
          params![id, work_item_id],
        )
        .map_err(|e| eyre!("Failed to remove comment {}: {}", id, e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(removed)
  }

  fn list_comments(&self, work_item_id: i64) -> Result<Vec<CommentRecord>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT id, work_item_id, text, author, created, modified, content_hash
         FROM comments WHERE work_item_id = ? ORDER BY id",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;
    let comments = stmt
      .query_map(params![work_item_id], comment_from_row)
      .map_err(|e| eyre!("Failed to list comments: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read comment: {}", e))?;
    Ok(comments)
  }

  fn find_cursor(&self, work_item_id: i64) -> Result<Option<SyncCursor>> {
    let conn = self.lock()?;
    conn
      .query_row(
        "SELECT work_item_id, last_synced_at, signature, revision FROM sync_cursors WHERE work_item_id = ?",
        params![work_item_id],
        |row| {
          Ok(SyncCursor {
            work_item_id: row.get(0)?,
            last_synced_at: required_timestamp(row, 1)?,
            signature: row.get(2)?,
            revision: row.get(3)?,
          })
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to load cursor for {}: {}", work_item_id, e))
  }

  fn advance_cursor(&self, cursor: &SyncCursor) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO sync_cursors (work_item_id, last_synced_at, signature, revision)
         VALUES (?, ?, ?, ?)",
        params![
          cursor.work_item_id,
          format_timestamp(&cursor.last_synced_at),
          cursor.signature,
          cursor.revision,
        ],
      )
      .map_err(|e| eyre!("Failed to advance cursor for {}: {}", cursor.work_item_id, e))?;
    Ok(())
  }

  fn last_pass_at(&self) -> Result<Option<DateTime<Utc>>> {
    let conn = self.lock()?;
    let value: Option<String> = conn
      .query_row(
        "SELECT value FROM sync_meta WHERE key = ?",
        params![LAST_PASS_KEY],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read last pass time: {}", e))?;

    match value {
      Some(s) => parse_timestamp(&s)
        .map(Some)
        .ok_or_else(|| eyre!("Failed to parse last pass time '{}'", s)),
      None => Ok(None),
    }
  }

  fn record_pass(&self, at: DateTime<Utc>) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO sync_meta (key, value) VALUES (?, ?)",
        params![LAST_PASS_KEY, format_timestamp(&at)],
      )
      .map_err(|e| eyre!("Failed to record pass time: {}", e))?;
    Ok(())
  }
}
