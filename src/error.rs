//! Error type shared by every layer of the request path.
//!
//! Errors are `Clone` so that a single failed call can be handed to every
//! caller that joined it through the deduplicator.

use std::time::Duration;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
  /// No provider or base URL configured; nothing was sent.
  #[error("backend is not configured")]
  NotConfigured,
  /// Network-level failure (connection refused, reset, DNS, ...).
  #[error("transport error: {0}")]
  Transport(String),
  /// The transport call did not settle within the configured timeout.
  #[error("request timed out after {0:?}")]
  Timeout(Duration),
  /// The backend answered with a non-2xx status.
  #[error("HTTP {status}: {message}")]
  Http { status: u16, message: String },
  /// The circuit breaker refused the call.
  #[error("circuit breaker is open")]
  CircuitOpen,
  /// A queued operation was removed before it started.
  #[error("operation cancelled before it started")]
  Cancelled,
  /// An identical mutation is already in flight.
  #[error("operation already in progress: {0}")]
  DuplicateOperation(String),
  #[error("failed to decode response: {0}")]
  Decode(String),
  #[error("failed to encode request body: {0}")]
  Encode(String),
  #[error("storage error: {0}")]
  Storage(String),
  #[error("invalid url: {0}")]
  InvalidUrl(String),
}

impl Error {
  /// Status code reported in an `ApiResponse` for this error.
  ///
  /// Only HTTP errors carry a real status; everything else never got an
  /// answer from the backend and reports 0.
  pub fn status(&self) -> u16 {
    match self {
      Error::Http { status, .. } => *status,
      _ => 0,
    }
  }

  /// Whether a retry could plausibly change the outcome.
  pub fn is_retryable(&self) -> bool {
    matches!(
      self,
      Error::Transport(_) | Error::Timeout(_) | Error::Http { .. }
    )
  }

  /// Failures that happened before or at the transport level, i.e. the
  /// backend was unreachable. These are the ones worth parking offline.
  pub fn is_offline(&self) -> bool {
    matches!(
      self,
      Error::Transport(_) | Error::Timeout(_) | Error::CircuitOpen
    )
  }
}

impl From<rusqlite::Error> for Error {
  fn from(e: rusqlite::Error) -> Self {
    Error::Storage(e.to_string())
  }
}

impl From<url::ParseError> for Error {
  fn from(e: url::ParseError) -> Self {
    Error::InvalidUrl(e.to_string())
  }
}
