use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};

use wisync::cache::{LocalStore, SqliteStore};
use wisync::config::Config;
use wisync::dispatch::ToolDispatcher;
use wisync::logging;
use wisync::remote::RestClient;
use wisync::sync::{SchedulerConfig, SyncConfig, SyncEngine, SyncMode, SyncScheduler};

#[derive(Parser, Debug)]
#[command(name = "wisync")]
#[command(about = "Keep a local, queryable mirror of a remote work item tracker")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./wisync.yaml, then $XDG_CONFIG_HOME/wisync/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Sync in the background and answer tool calls (one JSON object per line on stdin)
  Serve,
  /// Run one sync pass in the foreground and print the report
  Sync {
    /// Full sweep: also tombstone items no longer listed remotely
    #[arg(long)]
    full: bool,
    /// Batches and comment fetches in flight at once
    #[arg(long, value_parser = clap::value_parser!(u16).range(1..))]
    concurrency: Option<u16>,
  },
  /// Show when the mirror was last synced and how much it holds
  Status,
  /// Print a cached work item as JSON
  Show {
    id: i64,
    /// Include the item even if it was deleted remotely
    #[arg(long)]
    include_deleted: bool,
  },
}

#[derive(Debug, Deserialize)]
struct ToolRequest {
  tool: String,
  #[serde(default)]
  args: Value,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&logging::default_log_dir()?)?;

  let store = Arc::new(SqliteStore::open(&config.database_path()?)?);

  match args.command {
    Command::Serve => serve(&config, store).await,
    Command::Sync { full, concurrency } => {
      let engine = build_engine(&config, store)?;
      let mode = if full { SyncMode::Full } else { SyncMode::Incremental };
      let report = engine
        .run_pass(mode, concurrency.map(usize::from))
        .await?;
      println!("{}", serde_json::to_string_pretty(&report)?);
      if report.is_partial() {
        return Err(eyre!(
          "{} item(s) failed to sync; they will be retried on the next pass",
          report.failed.len()
        ));
      }
      Ok(())
    }
    Command::Status => {
      let last_pass = store.last_pass_at()?;
      let tracked = store.list_tracked_ids()?.len();
      let total = store.list_records(true)?.len();
      println!(
        "{}",
        serde_json::to_string_pretty(&json!({
          "last_pass_at": last_pass,
          "tracked": tracked,
          "tombstoned": total - tracked,
        }))?
      );
      Ok(())
    }
    Command::Show { id, include_deleted } => {
      let stored = store
        .find_by_id(id)?
        .filter(|s| include_deleted || !s.is_deleted())
        .ok_or_else(|| eyre!("Work item {} is not in the local mirror", id))?;
      let comments = store.list_comments(id)?;
      println!(
        "{}",
        serde_json::to_string_pretty(&json!({ "item": stored, "comments": comments }))?
      );
      Ok(())
    }
  }
}

fn build_engine(config: &Config, store: Arc<SqliteStore>) -> Result<Arc<SyncEngine<SqliteStore>>> {
  let client = RestClient::new(config)?;
  client.spawn_credential_probe();
  Ok(Arc::new(SyncEngine::new(
    client,
    store,
    SyncConfig::from_config(config),
  )?))
}

async fn serve(config: &Config, store: Arc<SqliteStore>) -> Result<()> {
  let engine = build_engine(config, Arc::clone(&store))?;
  let scheduler = SyncScheduler::start(engine, SchedulerConfig::from_config(config));
  let dispatcher = ToolDispatcher::new(store, scheduler.handle());
  info!("Serving tool calls on stdin");

  let mut lines = BufReader::new(tokio::io::stdin()).lines();
  let mut stdout = tokio::io::stdout();

  loop {
    let line = tokio::select! {
      line = lines.next_line() => line?,
      _ = tokio::signal::ctrl_c() => {
        info!("Interrupted, shutting down");
        break;
      }
    };
    let Some(line) = line else { break };
    if line.trim().is_empty() {
      continue;
    }

    let response = match serde_json::from_str::<ToolRequest>(&line) {
      Ok(request) => match dispatcher.dispatch(&request.tool, request.args).await {
        Ok(result) => json!({ "ok": true, "result": result }),
        Err(err) => {
          warn!(tool = %request.tool, error = %err, "Tool call failed");
          json!({ "ok": false, "error": err.to_string() })
        }
      },
      Err(err) => json!({ "ok": false, "error": format!("Malformed request: {}", err) }),
    };

    let mut out = serde_json::to_vec(&response)?;
    out.push(b'\n');
    stdout.write_all(&out).await?;
    stdout.flush().await?;
  }

  scheduler.shutdown().await
}
