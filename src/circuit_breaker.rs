//! Circuit breaker guarding the transport.
//!
//! After `failure_threshold` consecutive failures the circuit opens and calls
//! fail immediately with [`Error::CircuitOpen`]. Once `reset_timeout` has
//! passed since the last failure a single probe is let through: success
//! closes the circuit, failure reopens it and restarts the timer.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
  /// Number of consecutive failures before opening the circuit.
  pub failure_threshold: u32,
  /// How long the circuit stays open before a probe is allowed.
  #[serde(with = "crate::serde_millis", rename = "reset_timeout_ms")]
  pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
  fn default() -> Self {
    Self {
      failure_threshold: 5,
      reset_timeout: Duration::from_secs(30),
    }
  }
}

impl CircuitBreakerConfig {
  pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
    self.failure_threshold = threshold;
    self
  }

  pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
    self.reset_timeout = timeout;
    self
  }
}

/// Current mode of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
  /// Requests flow normally.
  Closed,
  /// Requests are rejected.
  Open,
  /// One probe request is being allowed through.
  HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
  consecutive_failures: u32,
  last_failure_at: Option<Instant>,
  mode: CircuitState,
  probe_in_flight: bool,
}

pub struct CircuitBreaker {
  config: CircuitBreakerConfig,
  state: Mutex<BreakerState>,
}

impl CircuitBreaker {
  pub fn new(config: CircuitBreakerConfig) -> Self {
    Self {
      config,
      state: Mutex::new(BreakerState {
        consecutive_failures: 0,
        last_failure_at: None,
        mode: CircuitState::Closed,
        probe_in_flight: false,
      }),
    }
  }

  pub fn config(&self) -> &CircuitBreakerConfig {
    &self.config
  }

  /// Run `operation` through the breaker.
  ///
  /// The operation is never invoked while the circuit is open.
  pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    let mut permit = self.acquire()?;

    let result = operation().await;
    permit.settled = true;
    match &result {
      Ok(_) => self.on_success(permit.probe),
      Err(_) => self.on_failure(permit.probe),
    }
    result
  }

  fn acquire(&self) -> Result<Permit<'_>> {
    let mut state = self.state.lock();

    match state.mode {
      CircuitState::Closed => Ok(Permit::new(self, false)),
      CircuitState::HalfOpen => Err(Error::CircuitOpen),
      CircuitState::Open => {
        let cooled_down = state
          .last_failure_at
          .map(|at| Instant::now().duration_since(at) > self.config.reset_timeout)
          .unwrap_or(true);
        if !cooled_down || state.probe_in_flight {
          return Err(Error::CircuitOpen);
        }
        info!("circuit half-open, allowing probe");
        state.mode = CircuitState::HalfOpen;
        state.probe_in_flight = true;
        Ok(Permit::new(self, true))
      }
    }
  }

  fn on_success(&self, probe: bool) {
    let mut state = self.state.lock();
    if probe {
      state.probe_in_flight = false;
    }
    if state.mode != CircuitState::Closed {
      info!("circuit closed");
    }
    state.mode = CircuitState::Closed;
    state.consecutive_failures = 0;
  }

  fn on_failure(&self, probe: bool) {
    let mut state = self.state.lock();
    state.consecutive_failures = state.consecutive_failures.saturating_add(1);

    if probe {
      state.probe_in_flight = false;
      state.mode = CircuitState::Open;
      state.last_failure_at = Some(Instant::now());
      warn!("probe failed, circuit reopened");
      return;
    }

    match state.mode {
      CircuitState::Closed if state.consecutive_failures >= self.config.failure_threshold => {
        state.mode = CircuitState::Open;
        state.last_failure_at = Some(Instant::now());
        warn!(
          failures = state.consecutive_failures,
          "failure threshold reached, circuit opened"
        );
      }
      // A call admitted before the circuit opened failed late; the backend
      // is still down, so the reset window starts over.
      CircuitState::Open => state.last_failure_at = Some(Instant::now()),
      _ => {}
    }
  }

  /// A probe that was dropped before settling gives the slot back so the
  /// next caller can probe instead.
  fn on_abandoned_probe(&self) {
    let mut state = self.state.lock();
    state.probe_in_flight = false;
    if state.mode == CircuitState::HalfOpen {
      state.mode = CircuitState::Open;
    }
  }

  pub fn state(&self) -> CircuitState {
    self.state.lock().mode
  }

  pub fn consecutive_failures(&self) -> u32 {
    self.state.lock().consecutive_failures
  }

  /// Force the circuit closed and forget past failures.
  pub fn reset(&self) {
    let mut state = self.state.lock();
    state.mode = CircuitState::Closed;
    state.consecutive_failures = 0;
    state.last_failure_at = None;
    state.probe_in_flight = false;
  }
}

impl Default for CircuitBreaker {
  fn default() -> Self {
    Self::new(CircuitBreakerConfig::default())
  }
}

struct Permit<'a> {
  breaker: &'a CircuitBreaker,
  probe: bool,
  settled: bool,
}

impl<'a> Permit<'a> {
  fn new(breaker: &'a CircuitBreaker, probe: bool) -> Self {
    Self {
      breaker,
      probe,
      settled: false,
    }
  }
}

impl Drop for Permit<'_> {
  fn drop(&mut self) {
    if self.probe && !self.settled {
      self.breaker.on_abandoned_probe();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;
  use tokio::time::advance;

  fn breaker(threshold: u32) -> CircuitBreaker {
    CircuitBreaker::new(
      CircuitBreakerConfig::default()
        .with_failure_threshold(threshold)
        .with_reset_timeout(Duration::from_secs(30)),
    )
  }

  async fn fail(cb: &CircuitBreaker) -> Result<()> {
    cb.execute(|| async { Err(Error::Transport("down".into())) })
      .await
  }

  async fn succeed(cb: &CircuitBreaker) -> Result<()> {
    cb.execute(|| async { Ok(()) }).await
  }

  #[tokio::test]
  async fn test_starts_closed() {
    let cb = breaker(3);
    assert_eq!(cb.state(), CircuitState::Closed);
    assert!(succeed(&cb).await.is_ok());
  }

  #[tokio::test]
  async fn test_opens_after_threshold() {
    let cb = breaker(3);
    for _ in 0..2 {
      assert_eq!(fail(&cb).await, Err(Error::Transport("down".into())));
    }
    assert_eq!(cb.state(), CircuitState::Closed);

    let _ = fail(&cb).await;
    assert_eq!(cb.state(), CircuitState::Open);
    assert_eq!(cb.consecutive_failures(), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_open_circuit_does_not_invoke_operation() {
    let cb = breaker(2);
    let _ = fail(&cb).await;
    let _ = fail(&cb).await;

    let calls = AtomicUsize::new(0);
    let result = cb
      .execute(|| async {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
      })
      .await;

    assert_eq!(result, Err(Error::CircuitOpen));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_success_resets_failure_count() {
    let cb = breaker(3);
    let _ = fail(&cb).await;
    let _ = fail(&cb).await;
    succeed(&cb).await.unwrap();
    assert_eq!(cb.consecutive_failures(), 0);

    let _ = fail(&cb).await;
    let _ = fail(&cb).await;
    assert_eq!(cb.state(), CircuitState::Closed);
    let _ = fail(&cb).await;
    assert_eq!(cb.state(), CircuitState::Open);
  }

  #[tokio::test(start_paused = true)]
  async fn test_probe_success_closes() {
    let cb = breaker(1);
    let _ = fail(&cb).await;

    advance(Duration::from_secs(30)).await;
    assert_eq!(succeed(&cb).await, Err(Error::CircuitOpen));

    advance(Duration::from_millis(1)).await;
    assert!(succeed(&cb).await.is_ok());
    assert_eq!(cb.state(), CircuitState::Closed);
    assert_eq!(cb.consecutive_failures(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_probe_failure_reopens_and_restarts_timer() {
    let cb = breaker(1);
    let _ = fail(&cb).await;

    advance(Duration::from_secs(31)).await;
    let _ = fail(&cb).await;
    assert_eq!(cb.state(), CircuitState::Open);

    advance(Duration::from_secs(20)).await;
    assert_eq!(succeed(&cb).await, Err(Error::CircuitOpen));

    advance(Duration::from_secs(11)).await;
    assert!(succeed(&cb).await.is_ok());
  }

  #[tokio::test(start_paused = true)]
  async fn test_late_failure_while_open_restarts_timer() {
    let cb = breaker(1);
    let slow = cb.execute(|| async {
      tokio::time::sleep(Duration::from_secs(20)).await;
      Err::<(), _>(Error::Timeout(Duration::from_secs(20)))
    });

    // The fast call opens the circuit at t=0; the slow one, admitted while
    // closed, fails at t=20.
    let (slow, fast) = futures::join!(slow, fail(&cb));
    assert!(slow.is_err());
    assert!(fast.is_err());
    assert_eq!(cb.state(), CircuitState::Open);

    advance(Duration::from_secs(11)).await;
    assert_eq!(succeed(&cb).await, Err(Error::CircuitOpen));

    advance(Duration::from_secs(20)).await;
    assert!(succeed(&cb).await.is_ok());
    assert_eq!(cb.state(), CircuitState::Closed);
  }

  #[tokio::test(start_paused = true)]
  async fn test_only_one_probe_at_a_time() {
    let cb = Arc::new(breaker(1));
    let _ = fail(&cb).await;
    advance(Duration::from_secs(31)).await;

    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
    let probe = {
      let cb = Arc::clone(&cb);
      tokio::spawn(async move {
        cb.execute(|| async move {
          let _ = release_rx.await;
          Ok(())
        })
        .await
      })
    };
    tokio::task::yield_now().await;
    assert_eq!(cb.state(), CircuitState::HalfOpen);

    let calls = AtomicUsize::new(0);
    let second = cb
      .execute(|| async {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
      })
      .await;
    assert_eq!(second, Err(Error::CircuitOpen));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    release_tx.send(()).unwrap();
    assert!(probe.await.unwrap().is_ok());
    assert_eq!(cb.state(), CircuitState::Closed);
  }

  #[tokio::test(start_paused = true)]
  async fn test_abandoned_probe_frees_the_slot() {
    let cb = breaker(1);
    let _ = fail(&cb).await;
    advance(Duration::from_secs(31)).await;

    {
      let probe = cb.execute(|| std::future::pending::<Result<()>>());
      let _ = tokio::time::timeout(Duration::from_millis(10), probe).await;
    }

    assert_eq!(cb.state(), CircuitState::Open);
    assert!(succeed(&cb).await.is_ok());
  }

  #[test]
  fn test_reset_closes() {
    let cb = breaker(1);
    {
      let mut state = cb.state.lock();
      state.mode = CircuitState::Open;
      state.consecutive_failures = 4;
    }
    cb.reset();
    assert_eq!(cb.state(), CircuitState::Closed);
    assert_eq!(cb.consecutive_failures(), 0);
  }
}
