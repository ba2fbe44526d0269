//! HTTP transport seam.
//!
//! The REST client only speaks to the network through [`Transport`], so the
//! whole acquisition stack can run against a scripted fake in tests.

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
  Get,
  Post,
  Patch,
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Method::Get => "GET",
      Method::Post => "POST",
      Method::Patch => "PATCH",
    })
  }
}

/// Response headers with case-insensitive lookup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
    self.0.push((name.into(), value.into()));
  }

  pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.insert(name, value);
    self
  }

  pub fn get(&self, name: &str) -> Option<&str> {
    self
      .0
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.trim())
  }
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
  pub method: Method,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub content_type: Option<&'static str>,
  pub body: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
  pub status: u16,
  pub headers: Headers,
  pub body: String,
}

impl HttpResponse {
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// Failures below the HTTP layer: no status code was received.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
  #[error("request timed out")]
  Timeout,
  #[error("connection failed: {0}")]
  Connect(String),
  #[error("{0}")]
  Other(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
  async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Production transport backed by reqwest
#[derive(Clone)]
pub struct ReqwestTransport {
  client: reqwest::Client,
}

impl ReqwestTransport {
  /// `timeout` is a hard ceiling; per-operation timeouts are applied above this.
  pub fn new(timeout: Duration) -> Result<Self, TransportError> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .user_agent(concat!("wisync/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| TransportError::Other(format!("Failed to build HTTP client: {}", e)))?;
    Ok(Self { client })
  }
}

impl From<reqwest::Error> for TransportError {
  fn from(e: reqwest::Error) -> Self {
    if e.is_timeout() {
      TransportError::Timeout
    } else if e.is_connect() {
      TransportError::Connect(e.to_string())
    } else {
      TransportError::Other(e.to_string())
    }
  }
}

#[async_trait]
impl Transport for ReqwestTransport {
  async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
    let method = match request.method {
      Method::Get => reqwest::Method::GET,
      Method::Post => reqwest::Method::POST,
      Method::Patch => reqwest::Method::PATCH,
    };

    let mut builder = self.client.request(method, request.url);
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(content_type) = request.content_type {
      builder = builder.header(reqwest::header::CONTENT_TYPE, content_type);
    }
    if let Some(body) = request.body {
      builder = builder.body(body);
    }

    let response = builder.send().await?;
    let status = response.status().as_u16();
    let mut headers = Headers::new();
    for (name, value) in response.headers() {
      if let Ok(value) = value.to_str() {
        headers.insert(name.as_str(), value);
      }
    }
    let body = response.text().await?;

    Ok(HttpResponse {
      status,
      headers,
      body,
    })
  }
}
