use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::fmt;
use url::Url;

use crate::config::{AuthScheme, Config, ConfigError};

/// Builds request headers and fully-qualified endpoint URLs.
///
/// Headers are computed once at construction; every URL carries the
/// configured `api-version`.
#[derive(Clone)]
pub struct Authenticator {
  base: Url,
  organization: String,
  project: String,
  api_version: String,
  comments_api_version: String,
  headers: Vec<(String, String)>,
}

impl fmt::Debug for Authenticator {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Authenticator")
      .field("base", &self.base.as_str())
      .field("organization", &self.organization)
      .field("project", &self.project)
      .field("api_version", &self.api_version)
      .finish_non_exhaustive()
  }
}

impl Authenticator {
  pub fn new(config: &Config) -> Result<Self, ConfigError> {
    config.validate()?;
    let credential = config.credential()?;
    let remote = &config.remote;

    let base = Url::parse(&remote.base_url).map_err(|e| ConfigError::BaseUrl {
      url: remote.base_url.clone(),
      reason: e.to_string(),
    })?;

    let authorization = match remote.auth_scheme {
      AuthScheme::Basic => format!("Basic {}", STANDARD.encode(format!(":{}", credential))),
      AuthScheme::Bearer => format!("Bearer {}", credential),
    };

    Ok(Self {
      base,
      organization: remote.organization.trim().to_string(),
      project: remote.project.trim().to_string(),
      api_version: remote.api_version.trim().to_string(),
      comments_api_version: remote.comments_api_version.trim().to_string(),
      headers: vec![
        ("Authorization".to_string(), authorization),
        ("Accept".to_string(), "application/json".to_string()),
      ],
    })
  }

  pub fn headers(&self) -> &[(String, String)] {
    &self.headers
  }

  pub fn project(&self) -> &str {
    &self.project
  }

  /// `{base}/{org}/{project}/_apis/{segments..}?api-version=..`
  pub fn project_url(&self, segments: &[&str]) -> Url {
    self.build(true, segments, &self.api_version)
  }

  /// `{base}/{org}/_apis/{segments..}?api-version=..`
  pub fn org_url(&self, segments: &[&str]) -> Url {
    self.build(false, segments, &self.api_version)
  }

  /// Comment endpoints are versioned separately
  pub fn comments_url(&self, work_item_id: i64) -> Url {
    let id = work_item_id.to_string();
    self.build(
      true,
      &["wit", "workItems", &id, "comments"],
      &self.comments_api_version,
    )
  }

  fn build(&self, in_project: bool, segments: &[&str], api_version: &str) -> Url {
    let mut url = self.base.clone();
    // The base was checked to be a hierarchical http(s) URL by Config::validate
    if let Ok(mut path) = url.path_segments_mut() {
      path.pop_if_empty().push(&self.organization);
      if in_project {
        path.push(&self.project);
      }
      path.push("_apis").extend(segments);
    }
    url.query_pairs_mut().append_pair("api-version", api_version);
    url
  }
}
