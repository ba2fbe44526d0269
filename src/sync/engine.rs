//! One sync pass: discover, fetch, diff, write, comments, cursors.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use color_eyre::Result;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::cache::LocalStore;
use crate::config::Config;
use crate::remote::resilience::BreakerSnapshot;
use crate::remote::types::{SyncCursor, WorkItemRecord};
use crate::remote::{BatchOptions, RestClient};

/// Incremental discovery looks this far behind the last pass to absorb clock skew
const CHANGED_SINCE_OVERLAP_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
  Idle,
  Discovering,
  Fetching,
  Diffing,
  Writing,
  Comments,
  Done,
  PartialFailure,
  Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
  /// Every id the discovery query lists; applies deletions
  Full,
  /// Only ids changed since the last completed pass
  #[default]
  Incremental,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
  /// Extra condition ANDed into the discovery query
  pub query_filter: Option<String>,
  pub tombstone_retention: Duration,
  /// Records per store transaction, so readers wait on one chunk at most
  pub write_chunk_size: usize,
}

impl SyncConfig {
  pub fn from_config(config: &Config) -> Self {
    Self {
      query_filter: config
        .sync
        .query_filter
        .clone()
        .filter(|f| !f.trim().is_empty()),
      tombstone_retention: Duration::days(config.sync.tombstone_retention_days.max(0)),
      write_chunk_size: config.limits.batch_size.max(1),
    }
  }
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      query_filter: None,
      tombstone_retention: Duration::days(30),
      write_chunk_size: 200,
    }
  }
}

/// What one pass did
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
  pub mode: SyncMode,
  pub started_at: DateTime<Utc>,
  pub finished_at: Option<DateTime<Utc>>,
  pub discovered: usize,
  pub fetched: usize,
  /// Records inserted or updated
  pub written: usize,
  /// Records whose signature matched their cursor
  pub skipped: usize,
  pub comments_written: usize,
  /// Local comments dropped because the service no longer lists them
  pub comments_removed: usize,
  /// Listed by discovery but gone by the time details were fetched
  pub missing: Vec<i64>,
  pub deleted: Vec<i64>,
  pub purged: usize,
  /// Items that will be retried next pass
  pub failed: Vec<i64>,
}

impl SyncReport {
  fn new(mode: SyncMode, started_at: DateTime<Utc>) -> Self {
    Self {
      mode,
      started_at,
      finished_at: None,
      discovered: 0,
      fetched: 0,
      written: 0,
      skipped: 0,
      comments_written: 0,
      comments_removed: 0,
      missing: Vec::new(),
      deleted: Vec::new(),
      purged: 0,
      failed: Vec::new(),
    }
  }

  pub fn is_partial(&self) -> bool {
    !self.failed.is_empty()
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
  pub phase: SyncPhase,
  /// Start of the last pass that completed without failures
  pub last_pass_at: Option<DateTime<Utc>>,
  pub last_report: Option<SyncReport>,
  pub last_error: Option<String>,
  pub passes_succeeded: u64,
  pub passes_failed: u64,
  pub items_synced: u64,
  pub items_failed: u64,
  pub breakers: Vec<BreakerSnapshot>,
}

#[derive(Debug, Clone)]
struct StatusInner {
  phase: SyncPhase,
  last_pass_at: Option<DateTime<Utc>>,
  last_report: Option<SyncReport>,
  last_error: Option<String>,
  passes_succeeded: u64,
  passes_failed: u64,
  items_synced: u64,
  items_failed: u64,
}

/// Mirrors remote work items into a local store, one pass at a time.
pub struct SyncEngine<S> {
  client: RestClient,
  store: Arc<S>,
  config: SyncConfig,
  status: RwLock<StatusInner>,
  pass_lock: Mutex<()>,
}

impl<S: LocalStore> SyncEngine<S> {
  pub fn new(client: RestClient, store: Arc<S>, config: SyncConfig) -> Result<Self> {
    let last_pass_at = store.last_pass_at()?;
    Ok(Self {
      client,
      store,
      config,
      status: RwLock::new(StatusInner {
        phase: SyncPhase::Idle,
        last_pass_at,
        last_report: None,
        last_error: None,
        passes_succeeded: 0,
        passes_failed: 0,
        items_synced: 0,
        items_failed: 0,
      }),
      pass_lock: Mutex::new(()),
    })
  }

  pub fn store(&self) -> &Arc<S> {
    &self.store
  }

  pub fn client(&self) -> &RestClient {
    &self.client
  }

  /// Whether a pass currently holds the engine
  pub fn is_running(&self) -> bool {
    self.pass_lock.try_lock().is_err()
  }

  pub fn status(&self) -> SyncStatus {
    let inner = self.status.read().unwrap_or_else(PoisonError::into_inner).clone();
    SyncStatus {
      phase: inner.phase,
      last_pass_at: inner.last_pass_at,
      last_report: inner.last_report,
      last_error: inner.last_error,
      passes_succeeded: inner.passes_succeeded,
      passes_failed: inner.passes_failed,
      items_synced: inner.items_synced,
      items_failed: inner.items_failed,
      breakers: self.client.breaker_states(),
    }
  }

  /// Run one pass. Passes never overlap; a second caller waits its turn.
  ///
  /// Per-item failures end up in the report. An error means the pass could
  /// not run at all (discovery failed, store unavailable).
  pub async fn run_pass(&self, mode: SyncMode, concurrency: Option<usize>) -> Result<SyncReport> {
    let _guard = self.pass_lock.lock().await;
    let started_at = Utc::now();

    match self.execute_pass(mode, concurrency, started_at).await {
      Ok(mut report) => {
        report.finished_at = Some(Utc::now());
        if !report.is_partial() {
          self.store.record_pass(started_at)?;
        }
        info!(
          mode = ?report.mode,
          discovered = report.discovered,
          written = report.written,
          skipped = report.skipped,
          comments = report.comments_written,
          deleted = report.deleted.len(),
          failed = report.failed.len(),
          "Sync pass complete"
        );
        self.update_status(|s| {
          s.phase = if report.is_partial() {
            SyncPhase::PartialFailure
          } else {
            s.last_pass_at = Some(started_at);
            SyncPhase::Done
          };
          s.passes_succeeded += 1;
          s.items_synced += report.written as u64;
          s.items_failed += report.failed.len() as u64;
          s.last_error = None;
          s.last_report = Some(report.clone());
        });
        Ok(report)
      }
      Err(err) => {
        error!(error = %err, "Sync pass failed");
        self.update_status(|s| {
          s.phase = SyncPhase::Failed;
          s.passes_failed += 1;
          s.last_error = Some(err.to_string());
        });
        Err(err)
      }
    }
  }

  async fn execute_pass(
    &self,
    mode: SyncMode,
    concurrency: Option<usize>,
    started_at: DateTime<Utc>,
  ) -> Result<SyncReport> {
    // Discovering
    self.set_phase(SyncPhase::Discovering);
    let (mode, since) = match mode {
      SyncMode::Full => (SyncMode::Full, None),
      SyncMode::Incremental => match self.store.last_pass_at()? {
        Some(last) => (SyncMode::Incremental, Some(last - Duration::seconds(CHANGED_SINCE_OVERLAP_SECS))),
        None => {
          info!("No completed pass on record, running a full pass instead");
          (SyncMode::Full, None)
        }
      },
    };
    let mut report = SyncReport::new(mode, started_at);

    let refs = self.client.run_query(&self.discovery_query(since)).await?;
    let discovered: Vec<i64> = refs.iter().map(|r| r.id).collect();
    report.discovered = discovered.len();
    info!(mode = ?mode, discovered = discovered.len(), "Discovery complete");

    // Fetching
    self.set_phase(SyncPhase::Fetching);
    let options = BatchOptions {
      concurrency,
      ..Default::default()
    };
    let fetched = self.client.get_batch(&discovered, &options).await?;
    report.fetched = fetched.items.len();
    report.missing = fetched.missing.clone();
    report.failed.extend(&fetched.failed);

    // Diffing
    self.set_phase(SyncPhase::Diffing);
    let mut changed = Vec::new();
    for record in fetched.items {
      let signature = record.content_signature();
      match self.store.find_cursor(record.id)? {
        Some(cursor) if cursor.signature == signature => report.skipped += 1,
        Some(cursor) if cursor.revision > record.rev => {
          warn!(
            id = record.id,
            stored = cursor.revision,
            fetched = record.rev,
            "Remote returned an older revision than already synced, skipping"
          );
          report.skipped += 1;
        }
        cursor => changed.push(Pending {
          last_synced_at: cursor.map(|c| c.last_synced_at),
          signature,
          record,
        }),
      }
    }
    debug!(changed = changed.len(), skipped = report.skipped, "Diff complete");

    // Writing
    self.set_phase(SyncPhase::Writing);
    let written = self.write_records(&changed, &mut report);

    // Comments
    self.set_phase(SyncPhase::Comments);
    let concurrency = concurrency.unwrap_or_else(|| self.client.max_concurrency()).max(1);
    let comment_failures = self.sync_comments(&written, concurrency, &mut report).await;

    // Cursors
    let synced_at = Utc::now();
    for pending in written {
      let id = pending.record.id;
      if comment_failures.contains(&id) {
        continue;
      }
      let cursor = SyncCursor {
        work_item_id: id,
        last_synced_at: synced_at,
        signature: pending.signature.clone(),
        revision: pending.record.rev,
      };
      if let Err(err) = self.store.advance_cursor(&cursor) {
        warn!(id, error = %err, "Failed to advance cursor");
        report.failed.push(id);
      }
    }

    if mode == SyncMode::Full {
      self.apply_deletions(&discovered, &fetched.missing, &mut report)?;
    }

    report.failed.sort_unstable();
    report.failed.dedup();
    Ok(report)
  }

  fn discovery_query(&self, changed_since: Option<DateTime<Utc>>) -> String {
    let mut query =
      String::from("SELECT [System.Id] FROM WorkItems WHERE [System.TeamProject] = @project");
    if let Some(filter) = &self.config.query_filter {
      query.push_str(&format!(" AND ({})", filter));
    }
    if let Some(since) = changed_since {
      query.push_str(&format!(
        " AND [System.ChangedDate] > '{}'",
        since.to_rfc3339_opts(SecondsFormat::Secs, true)
      ));
    }
    query.push_str(" ORDER BY [System.Id]");
    query
  }

  /// Write changed records chunk by chunk; returns those that made it to the store.
  fn write_records<'a>(&self, changed: &'a [Pending], report: &mut SyncReport) -> Vec<&'a Pending> {
    let mut written = HashSet::new();
    for chunk in changed.chunks(self.config.write_chunk_size.max(1)) {
      let records: Vec<WorkItemRecord> = chunk.iter().map(|p| p.record.clone()).collect();
      self.write_chunk(&records, &mut written, report);
    }

    report.written = written.len();
    changed.iter().filter(|p| written.contains(&p.record.id)).collect()
  }

  fn write_chunk(&self, records: &[WorkItemRecord], written: &mut HashSet<i64>, report: &mut SyncReport) {
    match self.store.upsert_records(records) {
      Ok(outcome) => {
        for (id, reason) in &outcome.failed {
          warn!(id, reason = %reason, "Failed to write work item");
          report.failed.push(*id);
        }
        for id in &outcome.stale {
          warn!(id, "Stored revision is newer, write refused");
          report.skipped += 1;
        }
        written.extend(outcome.written);
      }
      Err(err) => {
        warn!(error = %err, "Batched write failed, writing records one at a time");
        for record in records {
          match self.store.upsert_record(record) {
            Ok(true) => {
              written.insert(record.id);
            }
            Ok(false) => report.skipped += 1,
            Err(err) => {
              warn!(id = record.id, error = %err, "Failed to write work item");
              report.failed.push(record.id);
            }
          }
        }
      }
    }
  }

  /// Refresh comments for written items that have any and changed since their
  /// last sync. Returns the ids whose comment sync failed.
  async fn sync_comments(
    &self,
    written: &[&Pending],
    concurrency: usize,
    report: &mut SyncReport,
  ) -> HashSet<i64> {
    let mut failed = HashSet::new();
    for pending in written.iter().filter(|p| p.record.comment_count == 0) {
      let id = pending.record.id;
      match self.store.remove_comments_except(id, &[]) {
        Ok(removed) => report.comments_removed += removed,
        Err(err) => {
          warn!(id, error = %err, "Failed to clear comments, cursor left in place");
          report.failed.push(id);
          failed.insert(id);
        }
      }
    }

    let candidates: Vec<i64> = written
      .iter()
      .filter(|p| p.needs_comment_sync())
      .map(|p| p.record.id)
      .collect();
    if candidates.is_empty() {
      return failed;
    }

    let results: Vec<(i64, Result<(usize, usize)>)> = stream::iter(candidates)
      .map(|id| async move { (id, self.sync_item_comments(id).await) })
      .buffer_unordered(concurrency)
      .collect()
      .await;

    for (id, result) in results {
      match result {
        Ok((written, removed)) => {
          report.comments_written += written;
          report.comments_removed += removed;
        }
        Err(err) => {
          warn!(id, error = %err, "Comment sync failed, cursor left in place");
          report.failed.push(id);
          failed.insert(id);
        }
      }
    }
    failed
  }

  /// Returns (written, removed) comment counts.
  async fn sync_item_comments(&self, id: i64) -> Result<(usize, usize)> {
    let listing = self.client.list_comments(id).await?;
    let stored = self.store.comment_hashes(id)?;

    let mut written = 0;
    for comment in &listing.comments {
      if stored.get(&comment.id) == Some(&comment.content_hash) {
        continue;
      }
      self.store.upsert_comment(comment)?;
      written += 1;
    }

    // A truncated listing says nothing about the comments it did not reach
    let removed = if listing.complete {
      let listed: Vec<i64> = listing.comments.iter().map(|c| c.id).collect();
      self.store.remove_comments_except(id, &listed)?
    } else {
      0
    };
    debug!(id, written, removed, "Comments synced");
    Ok((written, removed))
  }

  /// Tombstone tracked ids the sweep no longer lists, then purge expired tombstones.
  fn apply_deletions(&self, discovered: &[i64], missing: &[i64], report: &mut SyncReport) -> Result<()> {
    let mut present: HashSet<i64> = discovered.iter().copied().collect();
    for id in missing {
      present.remove(id);
    }

    let now = Utc::now();
    for id in self.store.list_tracked_ids()? {
      if present.contains(&id) {
        continue;
      }
      match self.store.mark_deleted(id, now) {
        Ok(true) => report.deleted.push(id),
        Ok(false) => {}
        Err(err) => {
          warn!(id, error = %err, "Failed to tombstone work item");
          report.failed.push(id);
        }
      }
    }
    if !report.deleted.is_empty() {
      info!(count = report.deleted.len(), "Tombstoned work items no longer listed remotely");
    }

    report.purged = self.store.purge_tombstones(now - self.config.tombstone_retention)?;
    if report.purged > 0 {
      info!(count = report.purged, "Purged expired tombstones");
    }
    Ok(())
  }

  fn set_phase(&self, phase: SyncPhase) {
    self.update_status(|s| s.phase = phase);
  }

  fn update_status(&self, f: impl FnOnce(&mut StatusInner)) {
    let mut inner = self.status.write().unwrap_or_else(PoisonError::into_inner);
    f(&mut inner);
  }
}

/// A fetched record that differs from its cursor
struct Pending {
  record: WorkItemRecord,
  signature: String,
  last_synced_at: Option<DateTime<Utc>>,
}

impl Pending {
  fn needs_comment_sync(&self) -> bool {
    if self.record.comment_count == 0 {
      return false;
    }
    match (self.last_synced_at, self.record.changed) {
      (Some(synced), Some(changed)) => changed > synced,
      _ => true,
    }
  }
}
