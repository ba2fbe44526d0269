//! Scripted transport for exercising the client and sync engine offline.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::transport::{Headers, HttpRequest, HttpResponse, Method, Transport, TransportError};
use super::types::format_timestamp;

type Handler = Box<dyn Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync>;

struct Route {
  method: Method,
  path_suffix: String,
  handler: Handler,
}

/// Routes requests by method and path suffix; later routes win.
/// Unrouted requests get a 404.
pub struct FakeTransport {
  routes: Mutex<Vec<Route>>,
  requests: Mutex<Vec<HttpRequest>>,
  delay: Duration,
  in_flight: AtomicUsize,
  peak: AtomicUsize,
}

impl FakeTransport {
  pub fn new() -> Self {
    Self {
      routes: Mutex::new(Vec::new()),
      requests: Mutex::new(Vec::new()),
      delay: Duration::ZERO,
      in_flight: AtomicUsize::new(0),
      peak: AtomicUsize::new(0),
    }
  }

  /// Every call takes this long, so overlapping calls can be observed
  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = delay;
    self
  }

  pub fn on<F>(&self, method: Method, path_suffix: &str, handler: F)
  where
    F: Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync + 'static,
  {
    self.routes.lock().unwrap().push(Route {
      method,
      path_suffix: path_suffix.to_string(),
      handler: Box::new(handler),
    });
  }

  pub fn requests(&self) -> Vec<HttpRequest> {
    self.requests.lock().unwrap().clone()
  }

  pub fn calls_to(&self, method: Method, path_suffix: &str) -> usize {
    self
      .requests
      .lock()
      .unwrap()
      .iter()
      .filter(|r| r.method == method && r.url.path().ends_with(path_suffix))
      .count()
  }

  pub fn total_calls(&self) -> usize {
    self.requests.lock().unwrap().len()
  }

  pub fn peak_in_flight(&self) -> usize {
    self.peak.load(Ordering::SeqCst)
  }

  fn respond(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
    let routes = self.routes.lock().unwrap();
    let route = routes
      .iter()
      .rev()
      .find(|r| r.method == request.method && request.url.path().ends_with(&r.path_suffix));
    match route {
      Some(route) => (route.handler)(request),
      None => Ok(json(404, serde_json::json!({ "message": "no route" }))),
    }
  }
}

#[async_trait]
impl Transport for FakeTransport {
  async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
    self.requests.lock().unwrap().push(request.clone());
    let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    self.peak.fetch_max(now, Ordering::SeqCst);
    if !self.delay.is_zero() {
      tokio::time::sleep(self.delay).await;
    }
    let response = self.respond(&request);
    self.in_flight.fetch_sub(1, Ordering::SeqCst);
    response
  }
}

pub fn json(status: u16, body: Value) -> HttpResponse {
  HttpResponse {
    status,
    headers: Headers::new(),
    body: body.to_string(),
  }
}

/// Parsed JSON body of a request
pub fn body(request: &HttpRequest) -> Value {
  request
    .body
    .as_deref()
    .and_then(|b| serde_json::from_str(b).ok())
    .unwrap_or(Value::Null)
}

/// Remote-shaped work item payload
pub fn work_item(id: i64, rev: i64, title: &str, comment_count: u32) -> Value {
  serde_json::json!({
    "id": id,
    "rev": rev,
    "fields": {
      "System.Id": id,
      "System.Title": title,
      "System.State": "Active",
      "System.WorkItemType": "Task",
      "System.CreatedDate": "2024-01-01T00:00:00Z",
      "System.ChangedDate": format!("2024-02-01T00:00:{:02}Z", rev.clamp(0, 59)),
      "System.CommentCount": comment_count,
    },
    "url": format!("https://example.invalid/_apis/wit/workItems/{}", id),
  })
}

#[derive(Debug, Clone)]
struct RemoteItem {
  rev: i64,
  title: String,
  changed: String,
}

/// In-memory work item service behind a `FakeTransport`.
///
/// Serves discovery, batch reads and comment listing from shared state that
/// tests mutate between passes. Discovery ignores the query text.
#[derive(Clone, Default)]
pub struct FakeRemote {
  items: Arc<Mutex<BTreeMap<i64, RemoteItem>>>,
  comments: Arc<Mutex<BTreeMap<i64, Vec<(i64, String)>>>>,
}

impl FakeRemote {
  pub fn new() -> Self {
    Self::default()
  }

  /// Create or replace an item; its changed date is the current time
  pub fn put(&self, id: i64, rev: i64, title: &str) {
    self.items.lock().unwrap().insert(
      id,
      RemoteItem {
        rev,
        title: title.to_string(),
        changed: format_timestamp(&Utc::now()),
      },
    );
  }

  pub fn remove(&self, id: i64) {
    self.items.lock().unwrap().remove(&id);
  }

  pub fn set_comments(&self, id: i64, comments: &[(i64, &str)]) {
    self.comments.lock().unwrap().insert(
      id,
      comments.iter().map(|(cid, text)| (*cid, text.to_string())).collect(),
    );
  }

  fn item_json(&self, id: i64) -> Option<Value> {
    let item = self.items.lock().unwrap().get(&id).cloned()?;
    let comment_count = self.comments.lock().unwrap().get(&id).map_or(0, Vec::len) as u32;
    let mut value = work_item(id, item.rev, &item.title, comment_count);
    value["fields"]["System.ChangedDate"] = Value::from(item.changed);
    Some(value)
  }

  pub fn install(&self, transport: &FakeTransport) {
    let remote = self.clone();
    transport.on(Method::Post, "/wiql", move |_| {
      let refs: Vec<Value> = remote
        .items
        .lock()
        .unwrap()
        .keys()
        .map(|id| serde_json::json!({ "id": id, "url": format!("https://example.invalid/{}", id) }))
        .collect();
      Ok(json(200, serde_json::json!({ "workItems": refs })))
    });

    let remote = self.clone();
    transport.on(Method::Post, "/workitemsbatch", move |req| {
      let ids: Vec<i64> = serde_json::from_value(body(req)["ids"].clone()).unwrap_or_default();
      let value: Vec<Value> = ids
        .iter()
        .map(|id| remote.item_json(*id).unwrap_or(Value::Null))
        .collect();
      Ok(json(200, serde_json::json!({ "count": value.len(), "value": value })))
    });

    let remote = self.clone();
    transport.on(Method::Get, "/comments", move |req| {
      let id: i64 = req
        .url
        .path_segments()
        .and_then(|segments| segments.rev().nth(1).map(str::to_string))
        .and_then(|s| s.parse().ok())
        .unwrap_or_default();
      let comments: Vec<Value> = remote
        .comments
        .lock()
        .unwrap()
        .get(&id)
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .map(|(cid, text)| {
          serde_json::json!({
            "id": cid,
            "workItemId": id,
            "text": text,
            "createdBy": { "uniqueName": "dana@example.com" },
            "modifiedDate": "2024-03-01T00:00:00Z",
          })
        })
        .collect();
      Ok(json(200, serde_json::json!({ "comments": comments })))
    });
  }
}
