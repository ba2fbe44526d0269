//! Retry, timeout and circuit-breaker policy per operation class.
//!
//! The REST client hands each unit of work to a [`PolicyExecutor`] together
//! with the [`Policy`] for its operation class. [`ResilienceExecutor`] is the
//! production implementation; tests may substitute their own.

use async_trait::async_trait;
use futures::future::BoxFuture;
use rand::Rng;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::error::{ApiError, ErrorKind};
use super::transport::HttpResponse;

/// Operation classes. Each maps to its own policy and breaker key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
  Batch,
  Single,
  Query,
  Comments,
  CommentCreate,
  Update,
  Probe,
}

impl OperationKind {
  pub fn as_str(self) -> &'static str {
    match self {
      OperationKind::Batch => "batch",
      OperationKind::Single => "single",
      OperationKind::Query => "query",
      OperationKind::Comments => "comments",
      OperationKind::CommentCreate => "comment_create",
      OperationKind::Update => "update",
      OperationKind::Probe => "probe",
    }
  }

  /// Circuit breaker (and rate-limit resource) this operation reports to
  pub fn breaker_key(self) -> &'static str {
    match self {
      OperationKind::Batch => "batch",
      OperationKind::Single | OperationKind::Probe => "single",
      OperationKind::Query => "query",
      OperationKind::Comments | OperationKind::CommentCreate => "comments",
      OperationKind::Update => "update",
    }
  }
}

impl fmt::Display for OperationKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

pub const BREAKER_KEYS: [&str; 5] = ["batch", "single", "query", "comments", "update"];

/// Which failures an operation may retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryScope {
  /// Any retryable failure
  Retryable,
  /// Only failures where the server refused before doing any work.
  /// Used for non-idempotent writes.
  RejectedOnly,
}

#[derive(Debug, Clone)]
pub struct Policy {
  pub operation: OperationKind,
  pub max_attempts: u32,
  pub timeout: Duration,
  pub base_delay: Duration,
  pub max_delay: Duration,
  pub retry_scope: RetryScope,
}

impl Policy {
  fn new(operation: OperationKind, max_attempts: u32, timeout_secs: u64) -> Self {
    Self {
      operation,
      max_attempts,
      timeout: Duration::from_secs(timeout_secs),
      base_delay: Duration::from_millis(500),
      max_delay: Duration::from_secs(30),
      retry_scope: RetryScope::Retryable,
    }
  }

  pub fn should_retry(&self, err: &ApiError) -> bool {
    match self.retry_scope {
      RetryScope::Retryable => err.is_retryable(),
      RetryScope::RejectedOnly => err.kind() == ErrorKind::RateLimit,
    }
  }

  /// Exponential backoff with up to 50% jitter, capped at `max_delay`.
  pub fn backoff(&self, attempt: u32) -> Duration {
    let exp = self
      .base_delay
      .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
    let jitter = rand::thread_rng().gen_range(0.0..0.5);
    exp.mul_f64(1.0 + jitter).min(self.max_delay)
  }

  /// Delay before the next attempt, honoring a server-specified wait.
  pub fn delay_for(&self, err: &ApiError, attempt: u32) -> Duration {
    err
      .retry_after()
      .map(|d| d.min(self.max_delay))
      .unwrap_or_else(|| self.backoff(attempt))
  }
}

/// Policies for every operation class
#[derive(Debug, Clone)]
pub struct PolicySet {
  pub batch: Policy,
  pub single: Policy,
  pub query: Policy,
  pub comments: Policy,
  pub comment_create: Policy,
  pub update: Policy,
  pub probe: Policy,
}

impl Default for PolicySet {
  fn default() -> Self {
    Self {
      batch: Policy::new(OperationKind::Batch, 5, 60),
      single: Policy::new(OperationKind::Single, 3, 15),
      query: Policy::new(OperationKind::Query, 3, 30),
      comments: Policy::new(OperationKind::Comments, 3, 20),
      // Creating a comment twice duplicates it: only retry outright refusals
      comment_create: Policy {
        retry_scope: RetryScope::RejectedOnly,
        ..Policy::new(OperationKind::CommentCreate, 2, 15)
      },
      update: Policy::new(OperationKind::Update, 3, 20),
      probe: Policy::new(OperationKind::Probe, 1, 10),
    }
  }
}

impl PolicySet {
  pub fn for_operation(&self, kind: OperationKind) -> &Policy {
    match kind {
      OperationKind::Batch => &self.batch,
      OperationKind::Single => &self.single,
      OperationKind::Query => &self.query,
      OperationKind::Comments => &self.comments,
      OperationKind::CommentCreate => &self.comment_create,
      OperationKind::Update => &self.update,
      OperationKind::Probe => &self.probe,
    }
  }
}

// ============================================================================
// Circuit breaker
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
  pub failure_threshold: u32,
  pub sample_window: Duration,
  pub recovery_time: Duration,
}

impl Default for BreakerConfig {
  fn default() -> Self {
    Self {
      failure_threshold: 5,
      sample_window: Duration::from_secs(60),
      recovery_time: Duration::from_secs(30),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
  Closed,
  Open,
  HalfOpen,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
  pub name: &'static str,
  pub state: BreakerState,
  pub recent_failures: usize,
}

#[derive(Debug, Clone, Copy)]
enum Circuit {
  Closed,
  Open { until: Instant },
  /// The single probe call is in flight
  HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
  circuit: Circuit,
  failures: VecDeque<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
  name: &'static str,
  config: BreakerConfig,
  inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
  pub fn new(name: &'static str, config: BreakerConfig) -> Self {
    Self {
      name,
      config,
      inner: Mutex::new(BreakerInner {
        circuit: Circuit::Closed,
        failures: VecDeque::new(),
      }),
    }
  }

  /// Permission to make one call. Fails fast while open.
  ///
  /// After the recovery window the first caller gets the half-open probe.
  /// A probe permit dropped without an outcome reopens the breaker.
  pub fn try_acquire(&self) -> Result<BreakerPermit<'_>, ApiError> {
    let now = Instant::now();
    let mut inner = self.lock();
    let circuit = inner.circuit;
    match circuit {
      Circuit::Closed => Ok(BreakerPermit::new(self, false)),
      Circuit::Open { until } if now < until => Err(ApiError::CircuitOpen(self.name)),
      Circuit::Open { .. } => {
        info!(breaker = self.name, "Circuit breaker half-open, allowing one probe call");
        inner.circuit = Circuit::HalfOpen;
        Ok(BreakerPermit::new(self, true))
      }
      Circuit::HalfOpen => Err(ApiError::CircuitOpen(self.name)),
    }
  }

  /// A call got an answer from the service. Closes a half-open breaker;
  /// failures already counted in the window stay counted.
  pub fn record_success(&self) {
    let mut inner = self.lock();
    if !matches!(inner.circuit, Circuit::Closed) {
      info!(breaker = self.name, "Circuit breaker closed");
      inner.circuit = Circuit::Closed;
      inner.failures.clear();
    }
  }

  pub fn record_failure(&self) {
    let now = Instant::now();
    let mut inner = self.lock();
    let circuit = inner.circuit;
    match circuit {
      Circuit::HalfOpen => {
        warn!(breaker = self.name, "Probe call failed, circuit breaker reopened");
        inner.circuit = Circuit::Open {
          until: now + self.config.recovery_time,
        };
      }
      Circuit::Closed => {
        inner.failures.push_back(now);
        let window = self.config.sample_window;
        while inner.failures.front().is_some_and(|t| now.duration_since(*t) > window) {
          inner.failures.pop_front();
        }
        if inner.failures.len() >= self.config.failure_threshold.max(1) as usize {
          warn!(
            breaker = self.name,
            failures = inner.failures.len(),
            "Circuit breaker opened"
          );
          inner.circuit = Circuit::Open {
            until: now + self.config.recovery_time,
          };
          inner.failures.clear();
        }
      }
      Circuit::Open { .. } => {}
    }
  }

  fn abandon_probe(&self) {
    let mut inner = self.lock();
    if matches!(inner.circuit, Circuit::HalfOpen) {
      warn!(breaker = self.name, "Probe call abandoned, circuit breaker reopened");
      inner.circuit = Circuit::Open {
        until: Instant::now() + self.config.recovery_time,
      };
    }
  }

  pub fn snapshot(&self) -> BreakerSnapshot {
    let inner = self.lock();
    BreakerSnapshot {
      name: self.name,
      state: match inner.circuit {
        Circuit::Closed => BreakerState::Closed,
        Circuit::Open { .. } => BreakerState::Open,
        Circuit::HalfOpen => BreakerState::HalfOpen,
      },
      recent_failures: inner.failures.len(),
    }
  }

  fn lock(&self) -> MutexGuard<'_, BreakerInner> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

/// One call's claim on a breaker. Report the outcome with
/// [`success`](Self::success) or [`failure`](Self::failure).
#[must_use = "a dropped probe permit reopens the breaker"]
pub struct BreakerPermit<'a> {
  breaker: &'a CircuitBreaker,
  probe: bool,
  settled: bool,
}

impl<'a> BreakerPermit<'a> {
  fn new(breaker: &'a CircuitBreaker, probe: bool) -> Self {
    Self {
      breaker,
      probe,
      settled: false,
    }
  }

  pub fn is_probe(&self) -> bool {
    self.probe
  }

  pub fn success(mut self) {
    self.settled = true;
    self.breaker.record_success();
  }

  pub fn failure(mut self) {
    self.settled = true;
    self.breaker.record_failure();
  }
}

impl Drop for BreakerPermit<'_> {
  fn drop(&mut self) {
    if self.probe && !self.settled {
      self.breaker.abandon_probe();
    }
  }
}

// ============================================================================
// Executor
// ============================================================================

type CallFn = dyn Fn() -> BoxFuture<'static, Result<HttpResponse, ApiError>> + Send + Sync;
type AdmitFn = dyn Fn() -> BoxFuture<'static, ()> + Send + Sync;

/// One attempt at a unit of work, invoked again for every retry.
///
/// The admission wait (rate limiting) runs before the per-attempt timeout
/// starts and never counts against the breaker.
pub struct Attempt {
  admit: Option<Box<AdmitFn>>,
  call: Box<CallFn>,
}

impl Attempt {
  pub fn new<F>(call: F) -> Self
  where
    F: Fn() -> BoxFuture<'static, Result<HttpResponse, ApiError>> + Send + Sync + 'static,
  {
    Self {
      admit: None,
      call: Box::new(call),
    }
  }

  pub fn with_admission<F>(mut self, admit: F) -> Self
  where
    F: Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static,
  {
    self.admit = Some(Box::new(admit));
    self
  }

  async fn admit(&self) {
    if let Some(admit) = &self.admit {
      admit().await;
    }
  }
}

/// Runs an attempt under a policy.
#[async_trait]
pub trait PolicyExecutor: Send + Sync {
  async fn execute(&self, policy: &Policy, attempt: Attempt) -> Result<HttpResponse, ApiError>;

  fn breaker_states(&self) -> Vec<BreakerSnapshot> {
    Vec::new()
  }
}

/// Retry + timeout + per-class circuit breakers
#[derive(Debug)]
pub struct ResilienceExecutor {
  breakers: HashMap<&'static str, CircuitBreaker>,
}

impl ResilienceExecutor {
  /// `configs` is looked up by breaker key; missing keys use the default.
  pub fn new(configs: &HashMap<&'static str, BreakerConfig>) -> Self {
    let breakers = BREAKER_KEYS
      .iter()
      .map(|key| {
        let config = configs.get(key).copied().unwrap_or_default();
        (*key, CircuitBreaker::new(key, config))
      })
      .collect();
    Self { breakers }
  }

  pub fn breaker(&self, key: &str) -> Option<&CircuitBreaker> {
    self.breakers.get(key)
  }
}

impl Default for ResilienceExecutor {
  fn default() -> Self {
    Self::new(&HashMap::new())
  }
}

#[async_trait]
impl PolicyExecutor for ResilienceExecutor {
  async fn execute(&self, policy: &Policy, attempt: Attempt) -> Result<HttpResponse, ApiError> {
    let operation = policy.operation;
    let breaker = self.breaker(operation.breaker_key());
    let mut attempts = 0;

    loop {
      attempts += 1;
      let permit = match breaker {
        Some(breaker) => Some(breaker.try_acquire()?),
        None => None,
      };

      attempt.admit().await;
      let outcome = match tokio::time::timeout(policy.timeout, (attempt.call)()).await {
        Ok(outcome) => outcome,
        Err(_) => Err(ApiError::Timeout(format!(
          "{} did not complete within {:?}",
          operation, policy.timeout
        ))),
      };

      let err = match outcome {
        Ok(response) => {
          if let Some(permit) = permit {
            permit.success();
          }
          return Ok(response);
        }
        Err(err) => err,
      };

      if let Some(permit) = permit {
        if err.counts_toward_breaker() {
          permit.failure();
        } else {
          permit.success();
        }
      }
      if err.kind() == ErrorKind::Unknown {
        error!(%operation, attempt = attempts, error = %err, "Unmapped failure from remote call");
      }

      if !policy.should_retry(&err) {
        return Err(err);
      }
      if attempts >= policy.max_attempts {
        warn!(%operation, attempts, error = %err, "Retry budget exhausted");
        return Err(ApiError::RetryExhausted {
          operation,
          attempts,
          last: Box::new(err),
        });
      }

      let delay = policy.delay_for(&err, attempts);
      warn!(
        %operation,
        attempt = attempts,
        delay_ms = delay.as_millis() as u64,
        error = %err,
        "Retrying remote call"
      );
      tokio::time::sleep(delay).await;
    }
  }

  fn breaker_states(&self) -> Vec<BreakerSnapshot> {
    BREAKER_KEYS
      .iter()
      .filter_map(|key| self.breakers.get(key))
      .map(CircuitBreaker::snapshot)
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::remote::transport::Headers;
  use futures::FutureExt;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::sync::Arc;

  fn ok() -> HttpResponse {
    HttpResponse {
      status: 200,
      headers: Headers::new(),
      body: "{}".to_string(),
    }
  }

  fn server_error() -> ApiError {
    ApiError::Server {
      status: 503,
      message: "unavailable".into(),
      retry_after: None,
    }
  }

  /// Attempt that fails `failures` times, then succeeds; counts calls
  fn flaky(failures: u32, calls: Arc<AtomicU32>, err: ApiError) -> Attempt {
    Attempt::new(move || {
      let calls = calls.clone();
      let err = err.clone();
      async move {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        if n < failures {
          Err(err)
        } else {
          Ok(ok())
        }
      }
      .boxed()
    })
  }

  fn breaker_config(threshold: u32) -> HashMap<&'static str, BreakerConfig> {
    BREAKER_KEYS
      .iter()
      .map(|k| {
        (
          *k,
          BreakerConfig {
            failure_threshold: threshold,
            sample_window: Duration::from_secs(60),
            recovery_time: Duration::from_secs(30),
          },
        )
      })
      .collect()
  }

  #[tokio::test(start_paused = true)]
  async fn test_retries_until_success() {
    let executor = ResilienceExecutor::default();
    let calls = Arc::new(AtomicU32::new(0));
    let policies = PolicySet::default();
    let result = executor
      .execute(&policies.single, flaky(2, calls.clone(), server_error()))
      .await;
    assert!(result.is_ok());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_exhaustion_reports_attempts() {
    let executor = ResilienceExecutor::default();
    let calls = Arc::new(AtomicU32::new(0));
    let policies = PolicySet::default();
    let err = executor
      .execute(&policies.single, flaky(10, calls.clone(), server_error()))
      .await
      .unwrap_err();
    assert!(matches!(err, ApiError::RetryExhausted { attempts: 3, .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_non_retryable_surfaces_immediately() {
    let executor = ResilienceExecutor::default();
    let calls = Arc::new(AtomicU32::new(0));
    let policies = PolicySet::default();
    let err = executor
      .execute(
        &policies.batch,
        flaky(
          10,
          calls.clone(),
          ApiError::Authentication {
            status: 401,
            message: "bad token".into(),
          },
        ),
      )
      .await
      .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authentication);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_comment_create_does_not_retry_server_errors() {
    let executor = ResilienceExecutor::default();
    let calls = Arc::new(AtomicU32::new(0));
    let policies = PolicySet::default();
    let err = executor
      .execute(&policies.comment_create, flaky(10, calls.clone(), server_error()))
      .await
      .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Server);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let calls = Arc::new(AtomicU32::new(0));
    let throttled = ApiError::RateLimit {
      message: "slow down".into(),
      retry_after: Some(Duration::from_secs(1)),
    };
    let result = executor
      .execute(&policies.comment_create, flaky(1, calls.clone(), throttled))
      .await;
    assert!(result.is_ok());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_timeout_is_applied_per_attempt() {
    let executor = ResilienceExecutor::default();
    let policy = Policy {
      max_attempts: 1,
      timeout: Duration::from_secs(2),
      ..PolicySet::default().single
    };
    let attempt = Attempt::new(|| {
      async {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(ok())
      }
      .boxed()
    });
    let err = executor.execute(&policy, attempt).await.unwrap_err();
    assert_eq!(err.root().kind(), ErrorKind::Timeout);
  }

  #[tokio::test(start_paused = true)]
  async fn test_admission_wait_is_not_timed() {
    let executor = ResilienceExecutor::new(&breaker_config(1));
    let policy = Policy {
      max_attempts: 1,
      timeout: Duration::from_secs(2),
      ..PolicySet::default().single
    };
    let calls = Arc::new(AtomicU32::new(0));
    let attempt = flaky(0, calls.clone(), server_error()).with_admission(|| {
      tokio::time::sleep(Duration::from_secs(45)).boxed()
    });

    let started = Instant::now();
    executor.execute(&policy, attempt).await.unwrap();
    assert!(started.elapsed() >= Duration::from_secs(45));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let single = executor.breaker("single").unwrap().snapshot();
    assert_eq!(single.state, BreakerState::Closed);
    assert_eq!(single.recent_failures, 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_cancelled_half_open_call_reopens_breaker() {
    let executor = ResilienceExecutor::new(&breaker_config(1));
    let policy = Policy {
      max_attempts: 1,
      ..PolicySet::default().batch
    };
    let calls = Arc::new(AtomicU32::new(0));
    let _ = executor
      .execute(&policy, flaky(1, calls.clone(), server_error()))
      .await;
    assert_eq!(executor.breaker("batch").unwrap().snapshot().state, BreakerState::Open);

    tokio::time::advance(Duration::from_secs(31)).await;
    let hanging = Attempt::new(|| {
      async {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(ok())
      }
      .boxed()
    });
    let cancelled = tokio::time::timeout(Duration::from_secs(1), executor.execute(&policy, hanging)).await;
    assert!(cancelled.is_err());
    assert_eq!(executor.breaker("batch").unwrap().snapshot().state, BreakerState::Open);

    tokio::time::advance(Duration::from_secs(31)).await;
    executor
      .execute(&policy, flaky(0, calls.clone(), server_error()))
      .await
      .unwrap();
    assert_eq!(executor.breaker("batch").unwrap().snapshot().state, BreakerState::Closed);
  }

  #[tokio::test(start_paused = true)]
  async fn test_breaker_opens_and_fails_fast() {
    let executor = ResilienceExecutor::new(&breaker_config(3));
    let policy = Policy {
      max_attempts: 1,
      ..PolicySet::default().query
    };
    let calls = Arc::new(AtomicU32::new(0));
    for _ in 0..3 {
      let _ = executor
        .execute(&policy, flaky(100, calls.clone(), server_error()))
        .await;
    }
    assert_eq!(executor.breaker("query").unwrap().snapshot().state, BreakerState::Open);

    let err = executor
      .execute(&policy, flaky(100, calls.clone(), server_error()))
      .await
      .unwrap_err();
    assert!(matches!(err, ApiError::CircuitOpen("query")));
    assert_eq!(calls.load(Ordering::SeqCst), 3, "no network attempt while open");

    // Other operation classes are unaffected
    assert_eq!(executor.breaker("batch").unwrap().snapshot().state, BreakerState::Closed);
  }

  #[tokio::test(start_paused = true)]
  async fn test_half_open_allows_single_probe() {
    let breaker = CircuitBreaker::new(
      "single",
      BreakerConfig {
        failure_threshold: 2,
        sample_window: Duration::from_secs(60),
        recovery_time: Duration::from_secs(30),
      },
    );
    breaker.record_failure();
    breaker.record_failure();
    assert!(breaker.try_acquire().is_err());

    tokio::time::advance(Duration::from_secs(31)).await;
    let probe = breaker.try_acquire().unwrap();
    assert!(probe.is_probe());
    assert_eq!(breaker.snapshot().state, BreakerState::HalfOpen);
    assert!(breaker.try_acquire().is_err(), "only one probe at a time");

    probe.failure();
    assert_eq!(breaker.snapshot().state, BreakerState::Open);
    assert!(breaker.try_acquire().is_err());

    tokio::time::advance(Duration::from_secs(31)).await;
    breaker.try_acquire().unwrap().success();
    assert_eq!(breaker.snapshot().state, BreakerState::Closed);
    let permit = breaker.try_acquire().unwrap();
    assert!(!permit.is_probe());
    drop(permit);
    assert_eq!(breaker.snapshot().state, BreakerState::Closed);
  }

  #[tokio::test(start_paused = true)]
  async fn test_dropped_half_open_permit_reopens() {
    let breaker = CircuitBreaker::new(
      "batch",
      BreakerConfig {
        failure_threshold: 1,
        sample_window: Duration::from_secs(60),
        recovery_time: Duration::from_secs(30),
      },
    );
    breaker.record_failure();
    tokio::time::advance(Duration::from_secs(31)).await;

    drop(breaker.try_acquire().unwrap());
    assert_eq!(breaker.snapshot().state, BreakerState::Open);
    assert!(breaker.try_acquire().is_err());

    tokio::time::advance(Duration::from_secs(31)).await;
    assert!(breaker.try_acquire().unwrap().is_probe());
  }

  #[tokio::test(start_paused = true)]
  async fn test_failures_outside_window_do_not_trip() {
    let breaker = CircuitBreaker::new(
      "batch",
      BreakerConfig {
        failure_threshold: 2,
        sample_window: Duration::from_secs(10),
        recovery_time: Duration::from_secs(30),
      },
    );
    breaker.record_failure();
    tokio::time::advance(Duration::from_secs(11)).await;
    breaker.record_failure();
    assert_eq!(breaker.snapshot().state, BreakerState::Closed);
    assert_eq!(breaker.snapshot().recent_failures, 1);
  }

  #[test]
  fn test_backoff_grows_and_is_capped() {
    let policy = PolicySet::default().batch;
    assert!(policy.backoff(1) >= Duration::from_millis(500));
    assert!(policy.backoff(1) <= Duration::from_millis(750));
    assert!(policy.backoff(3) >= Duration::from_secs(2));
    assert_eq!(policy.backoff(20), policy.max_delay);
  }
}
