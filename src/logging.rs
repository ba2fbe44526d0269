use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "wisync=info";
const LOG_FILE_PREFIX: &str = "wisync.log";

/// Log directory under the user state (or data) directory.
pub fn default_log_dir() -> Result<PathBuf> {
  dirs::state_dir()
    .or_else(dirs::data_dir)
    .map(|dir| dir.join("wisync").join("logs"))
    .ok_or_else(|| eyre!("Could not determine log directory"))
}

/// Install the global subscriber: stderr plus a daily rolling file in `log_dir`.
///
/// `RUST_LOG` overrides the default filter. Keep the returned guard alive
/// for the life of the process or buffered file output is lost.
pub fn init(log_dir: &Path) -> Result<WorkerGuard> {
  std::fs::create_dir_all(log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let (file_writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX));

  tracing_subscriber::registry()
    .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)))
    .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
    .with(fmt::layer().with_writer(file_writer).with_ansi(false))
    .try_init()
    .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;

  Ok(guard)
}
