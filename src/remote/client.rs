use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{Config, ConfigError};
use crate::remote::api_types::{ApiBatchResponse, ApiComment, ApiCommentList, ApiQueryResponse, ApiWorkItem};
use crate::remote::auth::Authenticator;
use crate::remote::batch::{BatchProcessor, FailureMode};
use crate::remote::error::{check_response, decode_error, ApiError};
use crate::remote::rate_limit::{RateLimitState, RateLimiter};
use crate::remote::resilience::{
  Attempt, BreakerSnapshot, OperationKind, PolicyExecutor, PolicySet, ResilienceExecutor,
};
use crate::remote::transport::{HttpRequest, HttpResponse, Method, ReqwestTransport, Transport};
use crate::remote::types::{CommentRecord, WorkItemRecord, WorkItemRef};

/// Ceiling for any single HTTP exchange; per-operation timeouts are tighter
const TRANSPORT_TIMEOUT: Duration = Duration::from_secs(120);

/// Guard against a service that keeps handing out continuation tokens
const MAX_COMMENT_PAGES: usize = 100;

const JSON: &str = "application/json";
const JSON_PATCH: &str = "application/json-patch+json";

/// How much of each work item to return
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Expand {
  None,
  Relations,
  Fields,
  Links,
  #[default]
  All,
}

impl Expand {
  pub fn as_str(self) -> &'static str {
    match self {
      Expand::None => "None",
      Expand::Relations => "Relations",
      Expand::Fields => "Fields",
      Expand::Links => "Links",
      Expand::All => "All",
    }
  }
}

/// What a batch read does when some ids cannot be read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
  /// Fail the whole call on the first error
  Fail,
  /// Return what could be read; report the rest
  #[default]
  Omit,
}

#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
  pub expand: Expand,
  pub error_policy: ErrorPolicy,
  /// Overrides the configured concurrency cap for this call
  pub concurrency: Option<usize>,
}

/// Outcome of a batch read, sorted by id
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchResult {
  pub items: Vec<WorkItemRecord>,
  /// Ids the service returned no item for (deleted or not visible)
  pub missing: Vec<i64>,
  /// Ids whose chunk failed after retries
  pub failed: Vec<i64>,
}

/// Every comment on one work item as listed by the service
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommentListing {
  pub comments: Vec<CommentRecord>,
  /// False when pagination was cut off and later pages were never read
  pub complete: bool,
}

/// REST client for the work item service.
///
/// Every call passes through the rate limiter and runs under the
/// resilience policy of its operation class.
#[derive(Clone)]
pub struct RestClient {
  auth: Arc<Authenticator>,
  transport: Arc<dyn Transport>,
  limiter: Arc<RateLimiter>,
  executor: Arc<dyn PolicyExecutor>,
  policies: Arc<PolicySet>,
  batches: BatchProcessor,
}

impl RestClient {
  /// Build a client with the production transport and executor.
  ///
  /// Fails on invalid configuration; never touches the network.
  pub fn new(config: &Config) -> Result<Self, ConfigError> {
    let transport =
      ReqwestTransport::new(TRANSPORT_TIMEOUT).map_err(|e| ConfigError::HttpClient(e.to_string()))?;
    let executor = ResilienceExecutor::new(&config.breakers.by_key());
    Self::with_parts(config, Arc::new(transport), Arc::new(executor))
  }

  pub fn with_parts(
    config: &Config,
    transport: Arc<dyn Transport>,
    executor: Arc<dyn PolicyExecutor>,
  ) -> Result<Self, ConfigError> {
    let auth = Authenticator::new(config)?;
    Ok(Self {
      auth: Arc::new(auth),
      transport,
      limiter: Arc::new(RateLimiter::new(config.limits.rate_limiter())),
      executor,
      policies: Arc::new(PolicySet::default()),
      batches: BatchProcessor::new(config.limits.batch_size, config.limits.max_concurrency),
    })
  }

  pub fn breaker_states(&self) -> Vec<BreakerSnapshot> {
    self.executor.breaker_states()
  }

  pub fn rate_limit_state(&self, kind: OperationKind) -> Option<RateLimitState> {
    self.limiter.state(kind.breaker_key())
  }

  pub fn max_concurrency(&self) -> usize {
    self.batches.max_concurrency()
  }

  /// Lightweight authenticated call to check the credential.
  pub async fn probe(&self) -> Result<(), ApiError> {
    let url = self.auth.org_url(&["projects", self.auth.project()]);
    self.send(OperationKind::Probe, Method::Get, url, None).await?;
    Ok(())
  }

  /// Probe credentials in the background; only logs the outcome.
  pub fn spawn_credential_probe(&self) -> JoinHandle<()> {
    let client = self.clone();
    tokio::spawn(async move {
      match client.probe().await {
        Ok(()) => info!(project = client.auth.project(), "Credential check passed"),
        Err(err @ ApiError::Authentication { .. }) => {
          warn!(error = %err, "Credential check failed; syncs will fail until the credential is fixed")
        }
        Err(err) => warn!(error = %err, "Credential check could not reach the service"),
      }
    })
  }

  /// Get a single work item by id
  pub async fn get_one(&self, id: i64, expand: Option<Expand>) -> Result<WorkItemRecord, ApiError> {
    check_id(id)?;
    let id_str = id.to_string();
    let mut url = self.auth.project_url(&["wit", "workitems", &id_str]);
    if let Some(expand) = expand {
      url.query_pairs_mut().append_pair("$expand", expand.as_str());
    }

    let response = self.send(OperationKind::Single, Method::Get, url, None).await?;
    ApiWorkItem::parse(&response.body).map_err(|e| decode_error("work item", e))
  }

  /// Get many work items, chunked to the batch ceiling and fetched concurrently.
  pub async fn get_batch(&self, ids: &[i64], options: &BatchOptions) -> Result<BatchResult, ApiError> {
    if ids.is_empty() {
      return Ok(BatchResult::default());
    }
    for id in ids {
      check_id(*id)?;
    }

    let processor = match options.concurrency {
      Some(n) => self.batches.with_concurrency(n),
      None => self.batches.clone(),
    };
    let mode = match options.error_policy {
      ErrorPolicy::Omit => FailureMode::Isolate,
      ErrorPolicy::Fail => FailureMode::FailFast,
    };

    let outcome = processor
      .process(ids.iter().copied(), mode, |chunk| self.fetch_chunk(chunk, options))
      .await?;

    let mut result = BatchResult {
      failed: outcome.failed_items().copied().collect(),
      ..Default::default()
    };
    for entry in outcome.results {
      match entry {
        ChunkEntry::Found(record) => result.items.push(record),
        ChunkEntry::Missing(id) => result.missing.push(id),
      }
    }
    result.items.sort_by_key(|r| r.id);
    result.missing.sort_unstable();
    result.failed.sort_unstable();

    debug!(
      requested = ids.len(),
      found = result.items.len(),
      missing = result.missing.len(),
      failed = result.failed.len(),
      "Batch fetch complete"
    );
    Ok(result)
  }

  async fn fetch_chunk(&self, chunk: Vec<i64>, options: &BatchOptions) -> Result<Vec<ChunkEntry>, ApiError> {
    let url = self.auth.project_url(&["wit", "workitemsbatch"]);
    let body = json!({
      "ids": chunk,
      "$expand": options.expand.as_str(),
      "errorPolicy": match options.error_policy {
        ErrorPolicy::Omit => "omit",
        ErrorPolicy::Fail => "fail",
      },
    });

    let response = self
      .send(OperationKind::Batch, Method::Post, url, Some((JSON, body.to_string())))
      .await?;
    let parsed: ApiBatchResponse =
      serde_json::from_str(&response.body).map_err(|e| decode_error("batch", e))?;

    // Slot order is not guaranteed; match records to ids by their own id
    let mut found = HashMap::with_capacity(chunk.len());
    for raw in parsed.value.into_iter().flatten() {
      let record = ApiWorkItem::parse(raw.get()).map_err(|e| decode_error("batch item", e))?;
      found.insert(record.id, record);
    }

    let mut entries = Vec::with_capacity(chunk.len());
    for id in chunk {
      match found.remove(&id) {
        Some(record) => entries.push(ChunkEntry::Found(record)),
        None => entries.push(ChunkEntry::Missing(id)),
      }
    }
    if !found.is_empty() {
      let mut extra: Vec<i64> = found.into_keys().collect();
      extra.sort_unstable();
      warn!(?extra, "Batch response held ids that were not requested, ignoring them");
    }
    Ok(entries)
  }

  /// Run a query and return matching ids in query order
  pub async fn run_query(&self, query: &str) -> Result<Vec<WorkItemRef>, ApiError> {
    let query = query.trim();
    if query.is_empty() {
      return Err(ApiError::Validation("query text must not be empty".to_string()));
    }

    let mut url = self.auth.project_url(&["wit", "wiql"]);
    url.query_pairs_mut().append_pair("timePrecision", "true");
    let body = json!({ "query": query }).to_string();

    let response = self
      .send(OperationKind::Query, Method::Post, url, Some((JSON, body)))
      .await?;
    let parsed: ApiQueryResponse = decode(&response, "query")?;
    Ok(parsed.work_items.into_iter().map(WorkItemRef::from).collect())
  }

  /// All comments on a work item, following continuation tokens
  pub async fn get_comments(&self, id: i64) -> Result<Vec<CommentRecord>, ApiError> {
    Ok(self.list_comments(id).await?.comments)
  }

  /// Like [`get_comments`](Self::get_comments), also saying whether every page was read.
  pub async fn list_comments(&self, id: i64) -> Result<CommentListing, ApiError> {
    check_id(id)?;
    let mut comments = Vec::new();
    let mut token: Option<String> = None;

    for _ in 0..MAX_COMMENT_PAGES {
      let mut url = self.auth.comments_url(id);
      if let Some(token) = &token {
        url.query_pairs_mut().append_pair("continuationToken", token);
      }
      let response = self.send(OperationKind::Comments, Method::Get, url, None).await?;
      let page: ApiCommentList = decode(&response, "comments")?;
      comments.extend(page.comments.into_iter().map(ApiComment::into_record));

      match page.continuation_token.filter(|t| !t.is_empty()) {
        Some(next) => token = Some(next),
        None => {
          return Ok(CommentListing {
            comments,
            complete: true,
          })
        }
      }
    }

    warn!(id, pages = MAX_COMMENT_PAGES, "Comment pagination did not terminate, returning partial list");
    Ok(CommentListing {
      comments,
      complete: false,
    })
  }

  /// Add a comment. Not idempotent: a blind retry may post it twice.
  pub async fn add_comment(&self, id: i64, text: &str) -> Result<CommentRecord, ApiError> {
    check_id(id)?;
    if text.trim().is_empty() {
      return Err(ApiError::Validation("comment text must not be empty".to_string()));
    }

    let url = self.auth.comments_url(id);
    let body = json!({ "text": text }).to_string();
    let response = self
      .send(OperationKind::CommentCreate, Method::Post, url, Some((JSON, body)))
      .await?;
    let comment: ApiComment = decode(&response, "comment")?;
    Ok(comment.into_record())
  }

  /// Append a hyperlink relation without touching existing relations
  pub async fn link_to_external_resource(&self, id: i64, url: &str) -> Result<WorkItemRecord, ApiError> {
    check_id(id)?;
    let target = Url::parse(url.trim())
      .map_err(|e| ApiError::Validation(format!("invalid URL {:?}: {}", url, e)))?;
    if target.cannot_be_a_base() || target.host().is_none() {
      return Err(ApiError::Validation(format!("URL {:?} must be absolute", url)));
    }

    let id_str = id.to_string();
    let endpoint = self.auth.project_url(&["wit", "workitems", &id_str]);
    let patch = json!([{
      "op": "add",
      "path": "/relations/-",
      "value": { "rel": "Hyperlink", "url": target.as_str() },
    }])
    .to_string();

    let response = self
      .send(OperationKind::Update, Method::Patch, endpoint, Some((JSON_PATCH, patch)))
      .await?;
    ApiWorkItem::parse(&response.body).map_err(|e| decode_error("work item", e))
  }

  /// Send one request under the rate limiter and the operation's policy.
  async fn send(
    &self,
    operation: OperationKind,
    method: Method,
    url: Url,
    body: Option<(&'static str, String)>,
  ) -> Result<HttpResponse, ApiError> {
    let (content_type, body) = match body {
      Some((content_type, body)) => (Some(content_type), Some(body)),
      None => (None, None),
    };
    let request = HttpRequest {
      method,
      url,
      headers: self.auth.headers().to_vec(),
      content_type,
      body,
    };
    debug!(%operation, %method, url = %request.url, "Remote call");

    let transport = Arc::clone(&self.transport);
    let limiter = Arc::clone(&self.limiter);
    let resource = operation.breaker_key();
    let admission = Arc::clone(&limiter);
    let attempt = Attempt::new(move || {
      let transport = Arc::clone(&transport);
      let limiter = Arc::clone(&limiter);
      let request = request.clone();
      async move {
        let response = transport.send(request).await?;
        limiter.observe(resource, &response.headers);
        check_response(response)
      }
      .boxed()
    })
    .with_admission(move || {
      let limiter = Arc::clone(&admission);
      async move { limiter.acquire(resource).await }.boxed()
    });

    let policy = self.policies.for_operation(operation);
    self.executor.execute(policy, attempt).await
  }
}

enum ChunkEntry {
  Found(WorkItemRecord),
  Missing(i64),
}

fn check_id(id: i64) -> Result<(), ApiError> {
  if id <= 0 {
    return Err(ApiError::Validation(format!(
      "work item id must be a positive integer, got {}",
      id
    )));
  }
  Ok(())
}

fn decode<T: DeserializeOwned>(response: &HttpResponse, what: &str) -> Result<T, ApiError> {
  serde_json::from_str(&response.body).map_err(|e| decode_error(what, e))
}
