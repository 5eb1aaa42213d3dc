//! Collapses concurrent identical requests into a single underlying call.

use futures::future::{BoxFuture, FutureExt, Shared};
use futures::ready;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::debug;

use crate::error::{Error, Result};

type SharedResult<T> = Shared<BoxFuture<'static, Result<T>>>;
type Registry<T> = Arc<Mutex<HashMap<String, SharedResult<T>>>>;

/// Map from request key to the pending shared result.
///
/// The entry is removed when the underlying call settles, before any waiter
/// sees the outcome, so the next call for the same key starts fresh. It is
/// also removed when every waiter gives up before the call settles; the
/// call itself is dropped with it.
pub struct Deduplicator<T> {
  in_flight: Registry<T>,
}

impl<T> Default for Deduplicator<T> {
  fn default() -> Self {
    Self {
      in_flight: Arc::new(Mutex::new(HashMap::new())),
    }
  }
}

impl<T> Deduplicator<T>
where
  T: Clone + Send + Sync + 'static,
{
  pub fn new() -> Self {
    Self::default()
  }

  /// Run `producer` unless a call for `key` is already in flight, in which
  /// case wait for that call and return its outcome.
  pub async fn dedupe<F, Fut>(&self, key: &str, producer: F) -> Result<T>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let shared = {
      let mut in_flight = self.in_flight.lock();
      match in_flight.get(key) {
        Some(existing) => {
          debug!(key, "joining in-flight request");
          existing.clone()
        }
        None => {
          let registry = Arc::clone(&self.in_flight);
          let owned_key = key.to_string();
          let call = producer();
          let shared = async move {
            let result = call.await;
            registry.lock().remove(&owned_key);
            result
          }
          .boxed()
          .shared();
          in_flight.insert(key.to_string(), shared.clone());
          shared
        }
      }
    };

    Waiter {
      key,
      registry: &self.in_flight,
      shared: Some(shared),
    }
    .await
  }

  /// Number of keys with a call currently in flight.
  pub fn in_flight(&self) -> usize {
    self.in_flight.lock().len()
  }
}

/// One caller's handle on a shared call. Dropping the last unsettled handle
/// removes the entry so it is not reported as in flight forever.
struct Waiter<'a, T: Clone> {
  key: &'a str,
  registry: &'a Registry<T>,
  shared: Option<SharedResult<T>>,
}

impl<T: Clone> Future for Waiter<'_, T> {
  type Output = Result<T>;

  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let Some(shared) = self.shared.as_mut() else {
      return Poll::Ready(Err(Error::Cancelled));
    };
    let result = ready!(shared.poll_unpin(cx));
    // Settled: the call already removed its own entry.
    self.shared = None;
    Poll::Ready(result)
  }
}

impl<T: Clone> Drop for Waiter<'_, T> {
  fn drop(&mut self) {
    let Some(shared) = self.shared.take() else {
      return;
    };
    // Clones are only made under this lock, so the count is stable here.
    let mut in_flight = self.registry.lock();
    drop(shared);
    let abandoned = in_flight
      .get(self.key)
      .is_some_and(|entry| entry.strong_count() == Some(1));
    if abandoned {
      in_flight.remove(self.key);
      debug!(key = self.key, "all waiters gone, dropping in-flight request");
    }
  }
}
