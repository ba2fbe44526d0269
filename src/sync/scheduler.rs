//! Background timer loop driving sync passes.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::engine::{SyncEngine, SyncMode, SyncReport, SyncStatus};
use crate::cache::LocalStore;
use crate::config::Config;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
  pub interval: Duration,
  /// Skip the startup pass when the last pass is younger than this
  pub staleness_threshold: Duration,
  /// Every Nth scheduled pass is a full sweep; 0 disables sweeps
  pub full_sweep_every: u32,
}

impl SchedulerConfig {
  pub fn from_config(config: &Config) -> Self {
    Self {
      interval: Duration::from_secs(config.sync.interval_secs.max(1)),
      staleness_threshold: Duration::from_secs(config.sync.staleness_threshold_secs),
      full_sweep_every: config.sync.full_sweep_every,
    }
  }

  fn mode_for_tick(&self, tick: u64) -> SyncMode {
    let every = u64::from(self.full_sweep_every);
    if every > 0 && tick % every == 0 {
      SyncMode::Full
    } else {
      SyncMode::Incremental
    }
  }
}

/// What to do at process start, given the age of the last completed pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupDecision {
  /// Data is fresh; wait for the schedule
  Skip,
  /// Run this pass in the background right away
  Run(SyncMode),
}

pub fn startup_decision(
  last_pass_at: Option<DateTime<Utc>>,
  now: DateTime<Utc>,
  staleness_threshold: Duration,
) -> StartupDecision {
  let Some(last) = last_pass_at else {
    return StartupDecision::Run(SyncMode::Full);
  };
  match (now - last).to_std() {
    Ok(age) if age >= staleness_threshold => StartupDecision::Run(SyncMode::Incremental),
    Ok(_) => StartupDecision::Skip,
    // Last pass in the future: clock moved backwards, trust nothing
    Err(_) => StartupDecision::Run(SyncMode::Incremental),
  }
}

#[derive(Debug)]
pub enum SyncCommand {
  TriggerSync {
    mode: SyncMode,
    concurrency: Option<usize>,
    reply: oneshot::Sender<Result<SyncReport>>,
  },
  Stop,
}

/// Cheap, cloneable handle to a running scheduler.
pub struct SyncHandle<S> {
  commands: mpsc::Sender<SyncCommand>,
  engine: Arc<SyncEngine<S>>,
}

impl<S> Clone for SyncHandle<S> {
  fn clone(&self) -> Self {
    Self {
      commands: self.commands.clone(),
      engine: Arc::clone(&self.engine),
    }
  }
}

impl<S: LocalStore + 'static> SyncHandle<S> {
  /// Run a pass now and wait for its report.
  pub async fn trigger_sync(&self, mode: SyncMode, concurrency: Option<usize>) -> Result<SyncReport> {
    let (reply, rx) = oneshot::channel();
    self
      .commands
      .send(SyncCommand::TriggerSync {
        mode,
        concurrency,
        reply,
      })
      .await
      .map_err(|_| eyre!("Sync scheduler is not running"))?;
    rx.await
      .map_err(|_| eyre!("Sync pass was cancelled before it finished"))?
  }

  /// Never waits on a running pass.
  pub fn status(&self) -> SyncStatus {
    self.engine.status()
  }

  pub async fn stop(&self) -> Result<()> {
    self
      .commands
      .send(SyncCommand::Stop)
      .await
      .map_err(|_| eyre!("Sync scheduler is not running"))
  }
}

/// Owns the background loop task.
pub struct SyncScheduler<S> {
  handle: SyncHandle<S>,
  task: JoinHandle<()>,
}

impl<S: LocalStore + 'static> SyncScheduler<S> {
  /// Spawn the loop. Returns immediately; a startup pass, if needed, runs
  /// in the background and its failure is only logged.
  pub fn start(engine: Arc<SyncEngine<S>>, config: SchedulerConfig) -> Self {
    let (tx, rx) = mpsc::channel(16);
    let task = tokio::spawn(run_loop(Arc::clone(&engine), config, rx));
    Self {
      handle: SyncHandle {
        commands: tx,
        engine,
      },
      task,
    }
  }

  pub fn handle(&self) -> SyncHandle<S> {
    self.handle.clone()
  }

  /// Stop the loop and wait for it; in-flight passes are cancelled.
  pub async fn shutdown(self) -> Result<()> {
    // The loop may already be gone; joining below is what matters
    let _ = self.handle.stop().await;
    self
      .task
      .await
      .map_err(|e| eyre!("Sync scheduler task failed: {}", e))
  }
}

async fn run_loop<S: LocalStore + 'static>(
  engine: Arc<SyncEngine<S>>,
  config: SchedulerConfig,
  mut commands: mpsc::Receiver<SyncCommand>,
) {
  let mut passes = JoinSet::new();

  let last_pass_at = match engine.store().last_pass_at() {
    Ok(last) => last,
    Err(err) => {
      warn!(error = %err, "Could not read last pass time, treating data as stale");
      None
    }
  };
  match startup_decision(last_pass_at, Utc::now(), config.staleness_threshold) {
    StartupDecision::Skip => info!(?last_pass_at, "Local data is fresh, skipping startup pass"),
    StartupDecision::Run(mode) => {
      info!(?mode, ?last_pass_at, "Local data is empty or stale, starting background pass");
      let engine = Arc::clone(&engine);
      passes.spawn(async move {
        if let Err(err) = engine.run_pass(mode, None).await {
          error!(error = %err, "Startup sync pass failed; serving cached data until the next pass");
        }
      });
    }
  }

  let mut ticker = time::interval_at(Instant::now() + config.interval, config.interval);
  ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
  let mut tick: u64 = 0;

  loop {
    tokio::select! {
      _ = ticker.tick() => {
        tick += 1;
        if engine.is_running() {
          debug!(tick, "Previous pass still running, skipping scheduled pass");
          continue;
        }
        let mode = config.mode_for_tick(tick);
        let engine = Arc::clone(&engine);
        passes.spawn(async move {
          if let Err(err) = engine.run_pass(mode, None).await {
            warn!(error = %err, "Scheduled sync pass failed");
          }
        });
      }
      command = commands.recv() => match command {
        Some(SyncCommand::TriggerSync { mode, concurrency, reply }) => {
          info!(?mode, ?concurrency, "Manual sync triggered");
          let engine = Arc::clone(&engine);
          passes.spawn(async move {
            let result = engine.run_pass(mode, concurrency).await;
            // The caller may have stopped waiting
            let _ = reply.send(result);
          });
        }
        Some(SyncCommand::Stop) | None => break,
      },
      Some(joined) = passes.join_next(), if !passes.is_empty() => {
        if let Err(err) = joined {
          error!(error = %err, "Sync pass task panicked");
        }
      }
    }
  }

  passes.shutdown().await;
  info!("Sync scheduler stopped");
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStore;
  use crate::remote::resilience::ResilienceExecutor;
  use crate::remote::testing::{FakeRemote, FakeTransport};
  use crate::remote::transport::Method;
  use crate::remote::RestClient;
  use crate::sync::engine::SyncConfig;

  fn engine(remote: &FakeRemote, transport: Arc<FakeTransport>) -> Arc<SyncEngine<SqliteStore>> {
    let config = Config::from_yaml(
      "remote:\n  organization: acme\n  project: Widgets\n  credential: t\nlimits:\n  requests_per_second: 1000\n",
    )
    .unwrap();
    remote.install(&transport);
    let client = RestClient::with_parts(
      &config,
      transport,
      Arc::new(ResilienceExecutor::new(&config.breakers.by_key())),
    )
    .unwrap();
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    Arc::new(SyncEngine::new(client, store, SyncConfig::default()).unwrap())
  }

  /// Wait for the background startup pass to finish either way
  async fn settle(engine: &SyncEngine<SqliteStore>) {
    for _ in 0..500 {
      let status = engine.status();
      if status.passes_succeeded + status.passes_failed > 0 {
        return;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("startup pass never finished");
  }

  fn schedule(interval_secs: u64, full_sweep_every: u32) -> SchedulerConfig {
    SchedulerConfig {
      interval: Duration::from_secs(interval_secs),
      staleness_threshold: Duration::from_secs(900),
      full_sweep_every,
    }
  }

  #[test]
  fn test_startup_decision() {
    let now = Utc::now();
    let threshold = Duration::from_secs(900);
    assert_eq!(
      startup_decision(None, now, threshold),
      StartupDecision::Run(SyncMode::Full)
    );
    assert_eq!(
      startup_decision(Some(now - chrono::Duration::seconds(60)), now, threshold),
      StartupDecision::Skip
    );
    assert_eq!(
      startup_decision(Some(now - chrono::Duration::seconds(3600)), now, threshold),
      StartupDecision::Run(SyncMode::Incremental)
    );
    assert_eq!(
      startup_decision(Some(now + chrono::Duration::seconds(3600)), now, threshold),
      StartupDecision::Run(SyncMode::Incremental)
    );
  }

  #[test]
  fn test_full_sweep_cadence() {
    let config = schedule(60, 3);
    let modes: Vec<SyncMode> = (1..=6).map(|t| config.mode_for_tick(t)).collect();
    assert_eq!(
      modes,
      vec![
        SyncMode::Incremental,
        SyncMode::Incremental,
        SyncMode::Full,
        SyncMode::Incremental,
        SyncMode::Incremental,
        SyncMode::Full,
      ]
    );
    assert_eq!(schedule(60, 0).mode_for_tick(12), SyncMode::Incremental);
  }

  #[tokio::test]
  async fn test_empty_store_runs_startup_pass_in_background() {
    let remote = FakeRemote::new();
    remote.put(1, 1, "one");
    let transport = Arc::new(FakeTransport::new());
    let engine = engine(&remote, transport.clone());

    let scheduler = SyncScheduler::start(Arc::clone(&engine), schedule(3600, 0));
    settle(&engine).await;
    assert_eq!(engine.store().list_tracked_ids().unwrap(), vec![1]);

    let report = scheduler
      .handle()
      .trigger_sync(SyncMode::Incremental, None)
      .await
      .unwrap();
    assert_eq!(report.mode, SyncMode::Incremental);
    assert_eq!(report.skipped, 1);
    assert_eq!(transport.calls_to(Method::Post, "/wiql"), 2);

    scheduler.shutdown().await.unwrap();
  }

  #[tokio::test]
  async fn test_fresh_store_skips_startup_pass() {
    let remote = FakeRemote::new();
    let transport = Arc::new(FakeTransport::new());
    let engine = engine(&remote, transport.clone());
    engine.store().record_pass(Utc::now()).unwrap();

    let scheduler = SyncScheduler::start(Arc::clone(&engine), schedule(3600, 0));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.total_calls(), 0);

    let status = scheduler.handle().status();
    assert!(status.last_pass_at.is_some());
    scheduler.shutdown().await.unwrap();
  }

  #[tokio::test]
  async fn test_startup_failure_is_logged_not_propagated() {
    let remote = FakeRemote::new();
    let transport = Arc::new(FakeTransport::new());
    let engine = engine(&remote, transport.clone());
    transport.on(Method::Post, "/wiql", |_| {
      Ok(crate::remote::testing::json(403, serde_json::json!({ "message": "denied" })))
    });

    let scheduler = SyncScheduler::start(Arc::clone(&engine), schedule(3600, 0));
    settle(&engine).await;
    let handle = scheduler.handle();
    assert_eq!(handle.status().passes_failed, 1);
    assert!(handle.trigger_sync(SyncMode::Full, None).await.is_err());
    assert_eq!(handle.status().passes_failed, 2);
    scheduler.shutdown().await.unwrap();
  }

  #[tokio::test(start_paused = true)]
  async fn test_ticks_run_scheduled_passes() {
    let remote = FakeRemote::new();
    remote.put(1, 1, "one");
    let transport = Arc::new(FakeTransport::new());
    let engine = engine(&remote, transport.clone());
    engine.store().record_pass(Utc::now()).unwrap();

    let scheduler = SyncScheduler::start(Arc::clone(&engine), schedule(60, 2));
    tokio::time::sleep(Duration::from_secs(125)).await;
    // Let the second tick's pass finish
    let _ = scheduler.handle().trigger_sync(SyncMode::Incremental, None).await;

    assert_eq!(transport.calls_to(Method::Post, "/wiql"), 3);
    let status = scheduler.handle().status();
    assert_eq!(status.passes_succeeded, 3);
    scheduler.shutdown().await.unwrap();
  }

  #[tokio::test]
  async fn test_stopped_scheduler_rejects_triggers() {
    let remote = FakeRemote::new();
    let transport = Arc::new(FakeTransport::new());
    let engine = engine(&remote, transport);
    engine.store().record_pass(Utc::now()).unwrap();

    let scheduler = SyncScheduler::start(engine, schedule(3600, 0));
    let handle = scheduler.handle();
    scheduler.shutdown().await.unwrap();
    assert!(handle.trigger_sync(SyncMode::Full, None).await.is_err());
  }
}
