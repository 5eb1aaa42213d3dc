//! Retry with exponential backoff.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::Result;

/// Configuration for retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
  /// Retries after the first attempt; total attempts is `max_retries + 1`.
  pub max_retries: u32,
  #[serde(with = "crate::serde_millis", rename = "base_delay_ms")]
  pub base_delay: Duration,
  #[serde(with = "crate::serde_millis", rename = "max_delay_ms")]
  pub max_delay: Duration,
  pub backoff_multiplier: f64,
  /// Scale each delay by a random factor in `[0.5, 1.0]`.
  pub jitter: bool,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_retries: 3,
      base_delay: Duration::from_millis(1000),
      max_delay: Duration::from_millis(10_000),
      backoff_multiplier: 2.0,
      jitter: false,
    }
  }
}

impl RetryPolicy {
  pub fn with_max_retries(mut self, max: u32) -> Self {
    self.max_retries = max;
    self
  }

  pub fn with_base_delay(mut self, delay: Duration) -> Self {
    self.base_delay = delay;
    self
  }

  pub fn with_max_delay(mut self, delay: Duration) -> Self {
    self.max_delay = delay;
    self
  }

  pub fn with_multiplier(mut self, multiplier: f64) -> Self {
    self.backoff_multiplier = multiplier;
    self
  }

  pub fn with_jitter(mut self, jitter: bool) -> Self {
    self.jitter = jitter;
    self
  }

  /// Delay to wait after failed attempt number `attempt` (0-based).
  pub fn delay_for(&self, attempt: u32) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let base_ms = self.base_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
    let capped_ms = base_ms.min(self.max_delay.as_millis() as f64).max(0.0);

    let delay_ms = if self.jitter {
      capped_ms * (0.5 + fastrand::f64() * 0.5)
    } else {
      capped_ms
    };

    Duration::from_millis(delay_ms.round() as u64)
  }
}

/// Run `operation` until it succeeds or the policy is exhausted.
///
/// This is not a blind policy: only errors for which
/// [`Error::is_retryable`](crate::error::Error::is_retryable) holds (transport
/// failures, timeouts, non-2xx answers) use up the `max_retries + 1`
/// attempts. Anything else (open circuit, missing configuration, decode or
/// encode failures, cancellation, duplicate mutations) is returned after the
/// first attempt without sleeping.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T>>,
{
  let mut attempt = 0;
  loop {
    match operation().await {
      Ok(value) => return Ok(value),
      Err(error) if !error.is_retryable() || attempt >= policy.max_retries => return Err(error),
      Err(error) => {
        let delay = policy.delay_for(attempt);
        warn!(
          attempt = attempt + 1,
          max_attempts = policy.max_retries + 1,
          delay_ms = delay.as_millis() as u64,
          %error,
          "attempt failed, retrying"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::Error;
  use parking_lot::Mutex;
  use std::sync::atomic::{AtomicU32, Ordering};
  use tokio::time::Instant;

  #[test]
  fn test_delays_double_and_cap() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.delay_for(0), Duration::from_millis(1000));
    assert_eq!(policy.delay_for(1), Duration::from_millis(2000));
    assert_eq!(policy.delay_for(2), Duration::from_millis(4000));
    assert_eq!(policy.delay_for(3), Duration::from_millis(8000));
    assert_eq!(policy.delay_for(4), Duration::from_millis(10_000));
    assert_eq!(policy.delay_for(40), Duration::from_millis(10_000));
  }

  #[test]
  fn test_jitter_stays_within_bounds() {
    let policy = RetryPolicy::default().with_jitter(true);
    for _ in 0..100 {
      let delay = policy.delay_for(1);
      assert!(delay >= Duration::from_millis(1000));
      assert!(delay <= Duration::from_millis(2000));
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_gives_up_after_max_retries_with_backoff() {
    let policy = RetryPolicy::default();
    let starts = Mutex::new(Vec::new());
    let origin = Instant::now();

    let result: Result<()> = with_retry(&policy, || {
      starts.lock().push(origin.elapsed());
      async { Err(Error::Transport("unreachable".into())) }
    })
    .await;

    assert_eq!(result, Err(Error::Transport("unreachable".into())));
    let starts = starts.into_inner();
    assert_eq!(
      starts,
      vec![
        Duration::ZERO,
        Duration::from_millis(1000),
        Duration::from_millis(3000),
        Duration::from_millis(7000),
      ]
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_returns_first_success() {
    let attempts = AtomicU32::new(0);
    let result = with_retry(&RetryPolicy::default(), || {
      let n = attempts.fetch_add(1, Ordering::SeqCst);
      async move {
        if n < 2 {
          Err(Error::Http {
            status: 503,
            message: "unavailable".into(),
          })
        } else {
          Ok(n)
        }
      }
    })
    .await;

    assert_eq!(result, Ok(2));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_open_circuit_is_not_retried() {
    let attempts = AtomicU32::new(0);
    let result: Result<()> = with_retry(&RetryPolicy::default(), || {
      attempts.fetch_add(1, Ordering::SeqCst);
      async { Err(Error::CircuitOpen) }
    })
    .await;

    assert_eq!(result, Err(Error::CircuitOpen));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_decode_failure_returns_without_backoff() {
    let attempts = AtomicU32::new(0);
    let origin = Instant::now();
    let result: Result<()> = with_retry(&RetryPolicy::default(), || {
      attempts.fetch_add(1, Ordering::SeqCst);
      async { Err(Error::Decode("expected a list".into())) }
    })
    .await;

    assert_eq!(result, Err(Error::Decode("expected a list".into())));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(origin.elapsed(), Duration::ZERO);
  }

  #[tokio::test]
  async fn test_zero_retries_means_one_attempt() {
    let attempts = AtomicU32::new(0);
    let policy = RetryPolicy::default().with_max_retries(0);
    let result: Result<()> = with_retry(&policy, || {
      attempts.fetch_add(1, Ordering::SeqCst);
      async { Err(Error::Transport("nope".into())) }
    })
    .await;

    assert!(result.is_err());
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
  }
}
