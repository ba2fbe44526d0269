use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::cache::SqliteStore;
use crate::remote::batch::BATCH_CEILING;
use crate::remote::rate_limit::RateLimiterConfig;
use crate::remote::resilience::BreakerConfig;

pub const DEFAULT_BASE_URL: &str = "https://dev.azure.com";
pub const DEFAULT_API_VERSION: &str = "7.1";
pub const DEFAULT_COMMENTS_API_VERSION: &str = "7.1-preview.4";

/// Fatal configuration problems, reported before any network access
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
  #[error("remote.{0} is required")]
  Missing(&'static str),
  #[error("remote.{field} contains characters that are not allowed in a URL path: {value:?}")]
  Malformed { field: &'static str, value: String },
  #[error("invalid remote.base_url {url:?}: {reason}")]
  BaseUrl { url: String, reason: String },
  #[error(
    "no credential configured. Set remote.credential, WISYNC_TOKEN or AZURE_DEVOPS_PAT"
  )]
  MissingCredential,
  #[error("limits.{field} is out of range: {reason}")]
  OutOfRange { field: &'static str, reason: String },
  #[error("could not initialize the HTTP client: {0}")]
  HttpClient(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub remote: RemoteConfig,
  #[serde(default)]
  pub limits: LimitsConfig,
  #[serde(default)]
  pub breakers: BreakersConfig,
  #[serde(default)]
  pub sync: SyncSettings,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthScheme {
  /// Personal access token sent as the password of a Basic credential
  #[default]
  Basic,
  /// OAuth / Entra access token sent as a Bearer credential
  Bearer,
}

#[derive(Clone, Deserialize)]
pub struct RemoteConfig {
  pub organization: String,
  pub project: String,
  /// Prefer the environment; kept here for service accounts
  pub credential: Option<String>,
  #[serde(default = "default_base_url")]
  pub base_url: String,
  #[serde(default = "default_api_version")]
  pub api_version: String,
  #[serde(default = "default_comments_api_version")]
  pub comments_api_version: String,
  #[serde(default)]
  pub auth_scheme: AuthScheme,
}

impl std::fmt::Debug for RemoteConfig {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RemoteConfig")
      .field("organization", &self.organization)
      .field("project", &self.project)
      .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
      .field("base_url", &self.base_url)
      .field("api_version", &self.api_version)
      .field("comments_api_version", &self.comments_api_version)
      .field("auth_scheme", &self.auth_scheme)
      .finish()
  }
}

fn default_base_url() -> String {
  DEFAULT_BASE_URL.to_string()
}

fn default_api_version() -> String {
  DEFAULT_API_VERSION.to_string()
}

fn default_comments_api_version() -> String {
  DEFAULT_COMMENTS_API_VERSION.to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
  pub batch_size: usize,
  pub max_concurrency: usize,
  pub requests_per_second: u32,
  /// Longest wait for a server-reported quota reset
  pub max_quota_wait_secs: u64,
}

impl Default for LimitsConfig {
  fn default() -> Self {
    Self {
      batch_size: BATCH_CEILING,
      max_concurrency: 4,
      requests_per_second: 10,
      max_quota_wait_secs: 60,
    }
  }
}

impl LimitsConfig {
  pub fn rate_limiter(&self) -> RateLimiterConfig {
    RateLimiterConfig {
      requests_per_second: self.requests_per_second,
      max_quota_wait: Duration::from_secs(self.max_quota_wait_secs),
    }
  }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BreakerSettings {
  pub failure_threshold: u32,
  pub sample_window_secs: u64,
  pub recovery_secs: u64,
}

impl Default for BreakerSettings {
  fn default() -> Self {
    Self {
      failure_threshold: 5,
      sample_window_secs: 60,
      recovery_secs: 30,
    }
  }
}

impl From<BreakerSettings> for BreakerConfig {
  fn from(s: BreakerSettings) -> Self {
    BreakerConfig {
      failure_threshold: s.failure_threshold,
      sample_window: Duration::from_secs(s.sample_window_secs),
      recovery_time: Duration::from_secs(s.recovery_secs),
    }
  }
}

/// Circuit breaker thresholds per operation class
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BreakersConfig {
  pub batch: BreakerSettings,
  pub single: BreakerSettings,
  pub query: BreakerSettings,
  pub comments: BreakerSettings,
  pub update: BreakerSettings,
}

impl BreakersConfig {
  /// Keyed by breaker key, as the resilience executor expects
  pub fn by_key(&self) -> HashMap<&'static str, BreakerConfig> {
    HashMap::from([
      ("batch", self.batch.into()),
      ("single", self.single.into()),
      ("query", self.query.into()),
      ("comments", self.comments.into()),
      ("update", self.update.into()),
    ])
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
  pub interval_secs: u64,
  /// Skip the startup pass when the last pass is younger than this
  pub staleness_threshold_secs: u64,
  /// Every Nth scheduled pass is a full sweep (0 = never)
  pub full_sweep_every: u32,
  pub tombstone_retention_days: i64,
  /// Extra WIQL condition ANDed into the discovery query
  pub query_filter: Option<String>,
  pub database_path: Option<PathBuf>,
}

impl Default for SyncSettings {
  fn default() -> Self {
    Self {
      interval_secs: 300,
      staleness_threshold_secs: 900,
      full_sweep_every: 12,
      tombstone_retention_days: 30,
      query_filter: None,
      database_path: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./wisync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/wisync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/wisync/config.yaml\n\
                 with at least remote.organization and remote.project."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("wisync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("wisync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }

  /// The credential, from the config file or the environment.
  ///
  /// Checks remote.credential, then WISYNC_TOKEN, then AZURE_DEVOPS_PAT.
  pub fn credential(&self) -> Result<String, ConfigError> {
    self
      .remote
      .credential
      .clone()
      .filter(|c| !c.trim().is_empty())
      .or_else(|| std::env::var("WISYNC_TOKEN").ok())
      .or_else(|| std::env::var("AZURE_DEVOPS_PAT").ok())
      .map(|c| c.trim().to_string())
      .filter(|c| !c.is_empty())
      .ok_or(ConfigError::MissingCredential)
  }

  /// Validate everything the client needs before it is built.
  pub fn validate(&self) -> Result<(), ConfigError> {
    check_segment("organization", &self.remote.organization)?;
    check_segment("project", &self.remote.project)?;
    if self.remote.api_version.trim().is_empty() {
      return Err(ConfigError::Missing("api_version"));
    }

    let base = Url::parse(&self.remote.base_url).map_err(|e| ConfigError::BaseUrl {
      url: self.remote.base_url.clone(),
      reason: e.to_string(),
    })?;
    if base.cannot_be_a_base() || !matches!(base.scheme(), "http" | "https") {
      return Err(ConfigError::BaseUrl {
        url: self.remote.base_url.clone(),
        reason: "must be an http(s) URL".to_string(),
      });
    }

    if self.limits.batch_size == 0 || self.limits.batch_size > BATCH_CEILING {
      return Err(ConfigError::OutOfRange {
        field: "batch_size",
        reason: format!("must be between 1 and {}", BATCH_CEILING),
      });
    }
    if self.limits.max_concurrency == 0 {
      return Err(ConfigError::OutOfRange {
        field: "max_concurrency",
        reason: "must be at least 1".to_string(),
      });
    }
    if self.limits.requests_per_second == 0 {
      return Err(ConfigError::OutOfRange {
        field: "requests_per_second",
        reason: "must be at least 1".to_string(),
      });
    }

    self.credential().map(|_| ())
  }

  /// Database location: configured path or the user data directory
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.sync.database_path {
      return Ok(path.clone());
    }
    SqliteStore::default_path()
  }
}

fn check_segment(field: &'static str, value: &str) -> Result<(), ConfigError> {
  let value = value.trim();
  if value.is_empty() {
    return Err(ConfigError::Missing(field));
  }
  if value.contains(['/', '\\', '?', '#', '%']) || value.chars().any(char::is_control) {
    return Err(ConfigError::Malformed {
      field,
      value: value.to_string(),
    });
  }
  Ok(())
}
