//! Failure taxonomy for remote calls.
//!
//! Every transport failure or non-success response is mapped onto one
//! [`ApiError`] variant. The variant decides whether the resilience layer may
//! retry and how long it should wait first.

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use super::api_types::ApiErrorBody;
use super::resilience::OperationKind;
use super::transport::{Headers, HttpResponse, TransportError};

/// Longest body excerpt kept in an error message
const MAX_MESSAGE_LEN: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
  Authentication,
  Validation,
  NotFound,
  RateLimit,
  Timeout,
  Network,
  Server,
  Unknown,
  RetryExhausted,
  CircuitOpen,
}

#[derive(Debug, Clone, Error)]
pub enum ApiError {
  #[error(
    "authentication rejected (HTTP {status}): {message}. \
     Check that the credential is valid, unexpired and has work item read/write scope"
  )]
  Authentication { status: u16, message: String },

  #[error("invalid request: {0}")]
  Validation(String),

  #[error("not found: {0}")]
  NotFound(String),

  #[error("rate limited: {message}")]
  RateLimit {
    message: String,
    retry_after: Option<Duration>,
  },

  #[error("timed out: {0}")]
  Timeout(String),

  #[error("network error: {0}")]
  Network(String),

  #[error("server error (HTTP {status}): {message}")]
  Server {
    status: u16,
    message: String,
    retry_after: Option<Duration>,
  },

  #[error("unexpected failure{}: {message}", .status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default())]
  Unknown { status: Option<u16>, message: String },

  #[error("{operation} gave up after {attempts} attempts: {last}")]
  RetryExhausted {
    operation: OperationKind,
    attempts: u32,
    last: Box<ApiError>,
  },

  #[error("circuit breaker '{0}' is open")]
  CircuitOpen(&'static str),
}

impl ApiError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      ApiError::Authentication { .. } => ErrorKind::Authentication,
      ApiError::Validation(_) => ErrorKind::Validation,
      ApiError::NotFound(_) => ErrorKind::NotFound,
      ApiError::RateLimit { .. } => ErrorKind::RateLimit,
      ApiError::Timeout(_) => ErrorKind::Timeout,
      ApiError::Network(_) => ErrorKind::Network,
      ApiError::Server { .. } => ErrorKind::Server,
      ApiError::Unknown { .. } => ErrorKind::Unknown,
      ApiError::RetryExhausted { .. } => ErrorKind::RetryExhausted,
      ApiError::CircuitOpen(_) => ErrorKind::CircuitOpen,
    }
  }

  /// Unknown failures are retried too; they are logged loudly by the executor.
  pub fn is_retryable(&self) -> bool {
    matches!(
      self.kind(),
      ErrorKind::RateLimit
        | ErrorKind::Timeout
        | ErrorKind::Network
        | ErrorKind::Server
        | ErrorKind::Unknown
    )
  }

  /// Whether this failure says something about the health of the remote side.
  ///
  /// Caller mistakes and missing items prove the service answered.
  pub fn counts_toward_breaker(&self) -> bool {
    self.is_retryable()
  }

  /// Server-specified delay before the next attempt
  pub fn retry_after(&self) -> Option<Duration> {
    match self {
      ApiError::RateLimit { retry_after, .. } | ApiError::Server { retry_after, .. } => *retry_after,
      _ => None,
    }
  }

  /// The failure behind a retry-exhausted wrapper, or the error itself.
  pub fn root(&self) -> &ApiError {
    match self {
      ApiError::RetryExhausted { last, .. } => last.root(),
      other => other,
    }
  }
}

impl From<TransportError> for ApiError {
  fn from(err: TransportError) -> Self {
    match err {
      TransportError::Timeout => ApiError::Timeout("no response from server".to_string()),
      TransportError::Connect(msg) => ApiError::Network(msg),
      TransportError::Other(msg) => ApiError::Unknown {
        status: None,
        message: msg,
      },
    }
  }
}

/// Pass successful responses through, classify everything else.
pub fn check_response(response: HttpResponse) -> Result<HttpResponse, ApiError> {
  // 203 is what the service returns (with an HTML sign-in page) for a bad credential
  if response.is_success() && response.status != 203 {
    return Ok(response);
  }
  Err(classify_response(&response))
}

pub fn classify_response(response: &HttpResponse) -> ApiError {
  let status = response.status;
  let message = error_message(&response.body);
  let retry_after = parse_retry_after(&response.headers);

  match status {
    203 | 401 | 403 => ApiError::Authentication { status, message },
    400 | 409 | 412 | 422 => ApiError::Validation(message),
    404 | 410 => ApiError::NotFound(message),
    408 => ApiError::Timeout(message),
    429 => ApiError::RateLimit {
      message,
      retry_after,
    },
    500..=599 => ApiError::Server {
      status,
      message,
      retry_after,
    },
    _ => ApiError::Unknown {
      status: Some(status),
      message,
    },
  }
}

/// Map a body that could not be decoded into the expected shape.
pub fn decode_error(what: &str, err: serde_json::Error) -> ApiError {
  ApiError::Unknown {
    status: None,
    message: format!("unexpected {} response body: {}", what, err),
  }
}

fn error_message(body: &str) -> String {
  if let Ok(parsed) = serde_json::from_str::<ApiErrorBody>(body) {
    if let Some(message) = parsed.message {
      return match parsed.type_key {
        Some(key) => format!("{} ({})", message, key),
        None => message,
      };
    }
  }
  let trimmed = body.trim();
  if trimmed.is_empty() {
    return "empty response body".to_string();
  }
  trimmed.chars().take(MAX_MESSAGE_LEN).collect()
}

fn parse_retry_after(headers: &Headers) -> Option<Duration> {
  headers
    .get("Retry-After")
    .and_then(|v| v.parse::<f64>().ok())
    .filter(|secs| secs.is_finite() && *secs >= 0.0)
    .map(Duration::from_secs_f64)
}
