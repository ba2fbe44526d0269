//! Client-side admission control.
//!
//! Calls are admitted under a local requests-per-second budget and, when the
//! server reports that a resource's quota is nearly spent, held back until
//! the reported reset time. Slots are reserved under a short lock and waited
//! for outside it, so concurrent callers queue up in reservation order.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::transport::{Headers, HttpResponse, TransportError};

const WINDOW: Duration = Duration::from_secs(1);

/// Calls with this much quota left (or less) wait for the reset
const LOW_WATER_MARK: u64 = 1;

/// Most recent quota observation for one resource.
///
/// Replaced wholesale on every response; never merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitState {
  /// Resource name reported by the server, or the caller's key
  pub resource: String,
  pub remaining: Option<u64>,
  pub reset_at: Option<Instant>,
}

impl RateLimitState {
  /// Read quota headers. Returns None when no usable quota header is present.
  pub fn from_headers(
    resource: &str,
    headers: &Headers,
    now: Instant,
    wall_now: DateTime<Utc>,
  ) -> Option<Self> {
    let remaining = headers
      .get("X-RateLimit-Remaining")
      .and_then(|v| v.parse::<f64>().ok())
      .filter(|v| v.is_finite() && *v >= 0.0)
      .map(|v| v as u64);

    let retry_after = headers
      .get("Retry-After")
      .and_then(|v| v.parse::<f64>().ok())
      .filter(|v| v.is_finite() && *v >= 0.0)
      .map(Duration::from_secs_f64);

    let reset = headers
      .get("X-RateLimit-Reset")
      .and_then(|v| v.parse::<f64>().ok())
      .filter(|v| v.is_finite() && *v >= 0.0)
      .map(|epoch_secs| {
        let wall_secs = wall_now.timestamp_millis() as f64 / 1000.0;
        now + Duration::from_secs_f64((epoch_secs - wall_secs).max(0.0))
      });

    if remaining.is_none() && retry_after.is_none() {
      return None;
    }

    // Retry-After means the server already refused: treat the quota as spent.
    let remaining = if retry_after.is_some() {
      Some(remaining.unwrap_or(0))
    } else {
      remaining
    };
    let reset_at = match (reset, retry_after) {
      (Some(reset), Some(after)) => Some(reset.max(now + after)),
      (Some(reset), None) => Some(reset),
      (None, Some(after)) => Some(now + after),
      (None, None) => None,
    };

    Some(Self {
      resource: headers
        .get("X-RateLimit-Resource")
        .filter(|r| !r.is_empty())
        .unwrap_or(resource)
        .to_string(),
      remaining,
      reset_at,
    })
  }

  pub fn is_exhausted(&self) -> bool {
    self.remaining.is_some_and(|r| r <= LOW_WATER_MARK)
  }
}

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
  pub requests_per_second: u32,
  /// Upper bound on how long a server-reported reset may hold a call back
  pub max_quota_wait: Duration,
}

impl Default for RateLimiterConfig {
  fn default() -> Self {
    Self {
      requests_per_second: 10,
      max_quota_wait: Duration::from_secs(60),
    }
  }
}

#[derive(Debug, Default)]
struct LimiterInner {
  /// Reserved start times within the rolling window, oldest first
  window: VecDeque<Instant>,
  last_slot: Option<Instant>,
  quotas: HashMap<String, RateLimitState>,
}

#[derive(Debug)]
pub struct RateLimiter {
  config: RateLimiterConfig,
  min_interval: Duration,
  inner: Mutex<LimiterInner>,
}

impl RateLimiter {
  pub fn new(config: RateLimiterConfig) -> Self {
    let rps = config.requests_per_second.max(1);
    Self {
      min_interval: WINDOW / rps,
      config: RateLimiterConfig {
        requests_per_second: rps,
        ..config
      },
      inner: Mutex::new(LimiterInner::default()),
    }
  }

  /// Run one network call under admission control and learn from its headers.
  pub async fn execute<F, Fut>(&self, resource: &str, operation: F) -> Result<HttpResponse, TransportError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<HttpResponse, TransportError>>,
  {
    self.acquire(resource).await;
    let result = operation().await;
    if let Ok(response) = &result {
      self.observe(resource, &response.headers);
    }
    result
  }

  /// Wait until a call against `resource` may start.
  pub async fn acquire(&self, resource: &str) {
    let now = Instant::now();
    let slot = self.reserve(resource, now);
    if slot > now {
      debug!(resource, wait_ms = (slot - now).as_millis() as u64, "Rate limiter delaying call");
      tokio::time::sleep_until(slot).await;
    }
  }

  /// Replace the cached quota state for `resource` with what these headers say.
  pub fn observe(&self, resource: &str, headers: &Headers) {
    let state = RateLimitState::from_headers(resource, headers, Instant::now(), Utc::now());
    let mut inner = self.lock();
    match state {
      Some(state) => {
        if state.is_exhausted() {
          warn!(
            resource = %state.resource,
            remaining = ?state.remaining,
            "Server quota nearly exhausted, holding further calls until reset"
          );
        }
        inner.quotas.insert(resource.to_string(), state);
      }
      None => {
        inner.quotas.remove(resource);
      }
    }
  }

  pub fn state(&self, resource: &str) -> Option<RateLimitState> {
    self.lock().quotas.get(resource).cloned()
  }

  fn reserve(&self, resource: &str, now: Instant) -> Instant {
    let mut inner = self.lock();
    let cap = self.config.requests_per_second as usize;

    let mut slot = now;
    if let Some(last) = inner.last_slot {
      slot = slot.max(last + self.min_interval);
    }

    while inner.window.front().is_some_and(|t| *t + WINDOW <= slot) {
      inner.window.pop_front();
    }
    if inner.window.len() >= cap {
      let oldest_counted = inner.window[inner.window.len() - cap];
      slot = slot.max(oldest_counted + WINDOW);
    }

    if let Some(quota) = inner.quotas.get(resource) {
      if quota.is_exhausted() {
        if let Some(reset_at) = quota.reset_at {
          slot = slot.max(reset_at.min(now + self.config.max_quota_wait));
        }
      }
    }

    inner.window.push_back(slot);
    while inner.window.len() > cap {
      inner.window.pop_front();
    }
    inner.last_slot = Some(slot);
    slot
  }

  fn lock(&self) -> MutexGuard<'_, LimiterInner> {
    // Nothing is awaited under this lock, so a poisoned guard is still consistent.
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }
}
