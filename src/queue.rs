//! Concurrency-limited priority queue for admission control.
//!
//! Operations start in priority order (highest first, FIFO within a
//! priority) and at most `concurrency` run at the same time. Completion
//! order is whatever the operations take.

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  /// Maximum number of operations running at once.
  pub concurrency: usize,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self { concurrency: 6 }
  }
}

type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct QueuedRequest {
  priority: i32,
  seq: u64,
  job: Job,
}

impl PartialEq for QueuedRequest {
  fn eq(&self, other: &Self) -> bool {
    self.cmp(other) == Ordering::Equal
  }
}

impl Eq for QueuedRequest {}

impl PartialOrd for QueuedRequest {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for QueuedRequest {
  // Max-heap: higher priority first, then earlier arrival.
  fn cmp(&self, other: &Self) -> Ordering {
    self
      .priority
      .cmp(&other.priority)
      .then_with(|| other.seq.cmp(&self.seq))
  }
}

struct QueueState {
  pending: BinaryHeap<QueuedRequest>,
  running: usize,
  next_seq: u64,
}

struct Shared {
  state: Mutex<QueueState>,
  concurrency: usize,
}

/// Handle to a request queue. Clones share the same queue.
#[derive(Clone)]
pub struct RequestQueue {
  shared: Arc<Shared>,
}

impl RequestQueue {
  pub fn new(config: QueueConfig) -> Self {
    Self {
      shared: Arc::new(Shared {
        state: Mutex::new(QueueState {
          pending: BinaryHeap::new(),
          running: 0,
          next_seq: 0,
        }),
        concurrency: config.concurrency.max(1),
      }),
    }
  }

  /// Enqueue `operation` and return a handle resolving to its result.
  ///
  /// The operation is queued immediately, not when the handle is first
  /// polled. Must be called from within a tokio runtime.
  pub fn add<T, F, Fut>(&self, operation: F, priority: i32) -> Ticket<T>
  where
    T: Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let (tx, rx) = oneshot::channel();
    let job: Job = Box::new(move || {
      async move {
        // The caller may have stopped waiting; nothing to do then.
        let _ = tx.send(operation().await);
      }
      .boxed()
    });

    {
      let mut state = self.shared.state.lock();
      let seq = state.next_seq;
      state.next_seq += 1;
      state.pending.push(QueuedRequest {
        priority,
        seq,
        job,
      });
    }
    self.pump();

    Ticket { rx }
  }

  /// Reject every operation that has not started yet.
  ///
  /// Running operations are not interrupted.
  pub fn clear(&self) -> usize {
    let dropped = std::mem::take(&mut self.shared.state.lock().pending);
    let count = dropped.len();
    if count > 0 {
      debug!(count, "cancelled queued requests");
    }
    // Dropping the jobs drops their senders, which resolves each ticket
    // with `Error::Cancelled`.
    drop(dropped);
    count
  }

  pub fn pending(&self) -> usize {
    self.shared.state.lock().pending.len()
  }

  pub fn running(&self) -> usize {
    self.shared.state.lock().running
  }

  pub fn concurrency(&self) -> usize {
    self.shared.concurrency
  }

  /// Start queued work while there are free slots.
  fn pump(&self) {
    loop {
      let job = {
        let mut state = self.shared.state.lock();
        if state.running >= self.shared.concurrency {
          return;
        }
        match state.pending.pop() {
          Some(next) => {
            state.running += 1;
            next.job
          }
          None => return,
        }
      };

      let slot = Slot {
        queue: self.clone(),
      };
      tokio::spawn(async move {
        let _slot = slot;
        job().await;
      });
    }
  }

  fn release(&self) {
    {
      let mut state = self.shared.state.lock();
      state.running = state.running.saturating_sub(1);
    }
    self.pump();
  }
}

impl Default for RequestQueue {
  fn default() -> Self {
    Self::new(QueueConfig::default())
  }
}

/// Frees the running slot when the job finishes, panics included.
struct Slot {
  queue: RequestQueue,
}

impl Drop for Slot {
  fn drop(&mut self) {
    self.queue.release();
  }
}

/// Deferred result of a queued operation.
pub struct Ticket<T> {
  rx: oneshot::Receiver<Result<T>>,
}

impl<T> Future for Ticket<T> {
  type Output = Result<T>;

  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    Pin::new(&mut self.rx)
      .poll(cx)
      .map(|received| received.unwrap_or(Err(Error::Cancelled)))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
  use std::time::Duration;

  fn queue(concurrency: usize) -> RequestQueue {
    RequestQueue::new(QueueConfig { concurrency })
  }

  #[tokio::test]
  async fn test_returns_operation_result() {
    let q = queue(2);
    assert_eq!(q.add(|| async { Ok(7) }, 0).await, Ok(7));
    assert_eq!(
      q.add(|| async { Err::<(), _>(Error::CircuitOpen) }, 0).await,
      Err(Error::CircuitOpen)
    );
  }

  #[tokio::test]
  async fn test_starts_by_priority_then_arrival() {
    let q = queue(1);
    let order = Arc::new(Mutex::new(Vec::new()));
    let (gate_tx, gate_rx) = oneshot::channel::<()>();

    let blocker = q.add(
      move || async move {
        let _ = gate_rx.await;
        Ok(())
      },
      0,
    );

    let record = |name: &'static str, priority: i32| {
      let order = Arc::clone(&order);
      q.add(
        move || async move {
          order.lock().push(name);
          Ok(())
        },
        priority,
      )
    };
    let low = record("low", 0);
    let high = record("high", 10);
    let high_later = record("high-later", 10);
    let mid = record("mid", 5);

    assert_eq!(q.pending(), 4);
    gate_tx.send(()).unwrap();

    let (a, b, c, d, e) = futures::join!(blocker, low, high, high_later, mid);
    for result in [a, b, c, d, e] {
      assert!(result.is_ok());
    }
    assert_eq!(*order.lock(), vec!["high", "high-later", "mid", "low"]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_never_exceeds_concurrency() {
    let q = queue(3);
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let tickets: Vec<_> = (0..10)
      .map(|_| {
        let active = Arc::clone(&active);
        let peak = Arc::clone(&peak);
        q.add(
          move || async move {
            let now = active.fetch_add(1, AtomicOrdering::SeqCst) + 1;
            peak.fetch_max(now, AtomicOrdering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            active.fetch_sub(1, AtomicOrdering::SeqCst);
            Ok(())
          },
          0,
        )
      })
      .collect();

    for result in futures::future::join_all(tickets).await {
      assert!(result.is_ok());
    }
    assert_eq!(peak.load(AtomicOrdering::SeqCst), 3);
    assert_eq!(q.running(), 0);
  }

  #[tokio::test]
  async fn test_clear_cancels_only_unstarted_work() {
    let q = queue(1);
    let (gate_tx, gate_rx) = oneshot::channel::<()>();

    let running = q.add(
      move || async move {
        let _ = gate_rx.await;
        Ok("done")
      },
      0,
    );
    let queued_a = q.add(|| async { Ok("a") }, 0);
    let queued_b = q.add(|| async { Ok("b") }, 3);

    assert_eq!(q.clear(), 2);
    assert_eq!(queued_a.await, Err(Error::Cancelled));
    assert_eq!(queued_b.await, Err(Error::Cancelled));

    gate_tx.send(()).unwrap();
    assert_eq!(running.await, Ok("done"));
  }
}
