//! Durable queue of mutation intents that could not be delivered.
//!
//! The in-memory list is the source of truth during a session. Every
//! mutation writes the whole list back to the key-value store before
//! returning, and the store is only read again by `initialize()`.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::store::KeyValueStore;

/// Storage key holding the persisted queue.
pub const OFFLINE_QUEUE_KEY: &str = "offline_queue";

/// Failed attempts after which an action is dropped.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Current layout of the persisted envelope.
const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
  /// SQLite file; defaults to the platform data directory.
  pub database: Option<PathBuf>,
  pub max_retries: u32,
  /// Keep the queue in memory only (nothing survives a restart).
  pub in_memory: bool,
}

impl Default for OfflineConfig {
  fn default() -> Self {
    Self {
      database: None,
      max_retries: DEFAULT_MAX_RETRIES,
      in_memory: false,
    }
  }
}

/// A mutation waiting to be replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineAction<P> {
  pub id: String,
  pub action_type: String,
  pub payload: P,
  pub enqueued_at: DateTime<Utc>,
  pub retry_count: u32,
}

/// Outcome of one `process_queue` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessSummary {
  pub processed: usize,
  pub failed: usize,
}

#[derive(Serialize)]
struct EnvelopeRef<'a, P> {
  version: u32,
  actions: &'a [OfflineAction<P>],
}

#[derive(Deserialize)]
struct Envelope<P> {
  version: u32,
  actions: Vec<OfflineAction<P>>,
}

/// Just the version of a persisted envelope, whatever its actions look like.
#[derive(Deserialize)]
struct EnvelopeHeader {
  version: u32,
}

/// Everything we know how to read back.
#[derive(Deserialize)]
#[serde(untagged)]
enum Persisted<P> {
  Versioned(Envelope<P>),
  /// Version 0: a bare array, written before the envelope existed.
  Legacy(Vec<OfflineAction<P>>),
}

struct QueueState<P> {
  actions: Vec<OfflineAction<P>>,
  loaded: bool,
  /// Set when the store holds a queue from a newer schema. Writes are
  /// refused so that data is not silently replaced.
  newer_version: Option<u32>,
}

pub struct OfflineQueue<P> {
  store: Arc<dyn KeyValueStore>,
  state: Mutex<QueueState<P>>,
  /// Serializes `process_queue` passes.
  processing: tokio::sync::Mutex<()>,
  max_retries: u32,
}

impl<P> OfflineQueue<P>
where
  P: Clone + Serialize + DeserializeOwned + Send + Sync,
{
  pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
    Self::with_max_retries(store, DEFAULT_MAX_RETRIES)
  }

  pub fn with_max_retries(store: Arc<dyn KeyValueStore>, max_retries: u32) -> Self {
    Self {
      store,
      state: Mutex::new(QueueState {
        actions: Vec::new(),
        loaded: false,
        newer_version: None,
      }),
      processing: tokio::sync::Mutex::new(()),
      max_retries: max_retries.max(1),
    }
  }

  /// Load the persisted queue. Safe to call more than once; only the first
  /// call reads the store.
  ///
  /// Missing, unreadable or corrupt data yields an empty queue. A queue
  /// written by a newer schema also reads as empty, and every later write
  /// fails with `Error::Storage` instead of replacing it.
  pub fn initialize(&self) {
    let mut state = self.state.lock();
    self.load_into(&mut state);
  }

  fn load_into(&self, state: &mut QueueState<P>) {
    if state.loaded {
      return;
    }
    state.loaded = true;
    let actions = self.read_persisted(state);
    state.actions = actions;
    debug!(count = state.actions.len(), "offline queue loaded");
  }

  fn read_persisted(&self, state: &mut QueueState<P>) -> Vec<OfflineAction<P>> {
    let raw = match self.store.get(OFFLINE_QUEUE_KEY) {
      Ok(Some(raw)) => raw,
      Ok(None) => return Vec::new(),
      Err(e) => {
        warn!(error = %e, "failed to read offline queue, starting empty");
        return Vec::new();
      }
    };

    // Checked before the full parse: a newer layout may not decode at all.
    if let Ok(header) = serde_json::from_str::<EnvelopeHeader>(&raw) {
      if header.version > SCHEMA_VERSION {
        warn!(
          version = header.version,
          supported = SCHEMA_VERSION,
          bytes = raw.len(),
          "offline queue written by a newer version, leaving it untouched and refusing writes"
        );
        state.newer_version = Some(header.version);
        return Vec::new();
      }
    }

    match serde_json::from_str::<Persisted<P>>(&raw) {
      Ok(Persisted::Versioned(envelope)) => {
        debug!(version = envelope.version, "reading versioned offline queue");
        envelope.actions
      }
      Ok(Persisted::Legacy(actions)) => {
        info!(count = actions.len(), "migrating unversioned offline queue");
        actions
      }
      Err(e) => {
        warn!(error = %e, "offline queue is corrupt, starting empty");
        Vec::new()
      }
    }
  }

  /// Persist `next` and make it the current list. On failure the in-memory
  /// list is left untouched.
  fn commit(&self, state: &mut QueueState<P>, next: Vec<OfflineAction<P>>) -> Result<()> {
    if let Some(version) = state.newer_version {
      return Err(Error::Storage(format!(
        "offline queue was written by schema version {} (this build reads up to {}); refusing to overwrite it",
        version, SCHEMA_VERSION
      )));
    }
    let envelope = EnvelopeRef {
      version: SCHEMA_VERSION,
      actions: &next,
    };
    let json = serde_json::to_string(&envelope).map_err(|e| Error::Encode(e.to_string()))?;
    self.store.set(OFFLINE_QUEUE_KEY, &json)?;
    state.actions = next;
    Ok(())
  }

  /// Append an action and return its id.
  pub fn add(&self, action_type: impl Into<String>, payload: P) -> Result<String> {
    let action = OfflineAction {
      id: uuid::Uuid::new_v4().to_string(),
      action_type: action_type.into(),
      payload,
      enqueued_at: Utc::now(),
      retry_count: 0,
    };
    let id = action.id.clone();

    let mut state = self.state.lock();
    self.load_into(&mut state);
    let mut next = state.actions.clone();
    next.push(action);
    self.commit(&mut state, next)?;

    debug!(%id, "offline action queued");
    Ok(id)
  }

  /// Remove an action by id. Returns whether it was present.
  pub fn remove(&self, id: &str) -> Result<bool> {
    let mut state = self.state.lock();
    self.load_into(&mut state);
    if !state.actions.iter().any(|a| a.id == id) {
      return Ok(false);
    }
    let next = state.actions.iter().filter(|a| a.id != id).cloned().collect();
    self.commit(&mut state, next)?;
    Ok(true)
  }

  pub fn get_all(&self) -> Vec<OfflineAction<P>> {
    let mut state = self.state.lock();
    self.load_into(&mut state);
    state.actions.clone()
  }

  pub fn len(&self) -> usize {
    let mut state = self.state.lock();
    self.load_into(&mut state);
    state.actions.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn clear(&self) -> Result<()> {
    let mut state = self.state.lock();
    self.load_into(&mut state);
    self.commit(&mut state, Vec::new())
  }

  /// Offer every queued action to `processor`, in insertion order.
  ///
  /// `true` removes the action. `false` bumps its retry count and counts as
  /// a failure; once the count reaches the ceiling the action is dropped.
  /// Passes never overlap: a second caller waits for the first to finish.
  pub async fn process_queue<F, Fut>(&self, mut processor: F) -> Result<ProcessSummary>
  where
    F: FnMut(OfflineAction<P>) -> Fut,
    Fut: Future<Output = bool>,
  {
    let _pass = self.processing.lock().await;
    let snapshot = self.get_all();
    let mut summary = ProcessSummary::default();

    for action in snapshot {
      let id = action.id.clone();
      if processor(action).await {
        summary.processed += 1;
        self.settle(&id, true)?;
      } else {
        summary.failed += 1;
        self.settle(&id, false)?;
      }
    }

    info!(
      processed = summary.processed,
      failed = summary.failed,
      remaining = self.len(),
      "offline queue pass finished"
    );
    Ok(summary)
  }

  fn settle(&self, id: &str, succeeded: bool) -> Result<()> {
    let mut state = self.state.lock();
    // The processor may have removed it already.
    let Some(pos) = state.actions.iter().position(|a| a.id == id) else {
      return Ok(());
    };

    let mut next = state.actions.clone();
    if succeeded {
      next.remove(pos);
    } else {
      next[pos].retry_count += 1;
      if next[pos].retry_count >= self.max_retries {
        warn!(
          %id,
          action_type = %next[pos].action_type,
          retries = next[pos].retry_count,
          "offline action exhausted its retries, dropping"
        );
        next.remove(pos);
      }
    }
    self.commit(&mut state, next)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::MemoryStore;
  use serde_json::json;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  struct Note {
    text: String,
  }

  fn note(text: &str) -> Note {
    Note { text: text.into() }
  }

  fn queue(store: &MemoryStore) -> OfflineQueue<Note> {
    let queue = OfflineQueue::new(Arc::new(store.clone()));
    queue.initialize();
    queue
  }

  #[test]
  fn test_actions_survive_restart() {
    let store = MemoryStore::new();
    let id = queue(&store).add("create_note", note("hello")).unwrap();

    let reopened = queue(&store);
    let actions = reopened.get_all();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].id, id);
    assert_eq!(actions[0].action_type, "create_note");
    assert_eq!(actions[0].payload, note("hello"));
    assert_eq!(actions[0].retry_count, 0);
  }

  #[test]
  fn test_persisted_envelope_is_versioned() {
    let store = MemoryStore::new();
    queue(&store).add("x", note("a")).unwrap();

    let raw = store.get(OFFLINE_QUEUE_KEY).unwrap().unwrap();
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(value["version"], json!(1));
    assert_eq!(value["actions"][0]["actionType"], json!("x"));
  }

  #[test]
  fn test_legacy_array_is_migrated() {
    let store = MemoryStore::new();
    let legacy = json!([{
      "id": "legacy-1",
      "actionType": "create_note",
      "payload": { "text": "old" },
      "enqueuedAt": "2024-01-01T00:00:00Z",
      "retryCount": 2
    }]);
    store
      .set(OFFLINE_QUEUE_KEY, &legacy.to_string())
      .unwrap();

    let q = queue(&store);
    let actions = q.get_all();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].retry_count, 2);

    q.add("x", note("new")).unwrap();
    let raw = store.get(OFFLINE_QUEUE_KEY).unwrap().unwrap();
    assert!(raw.contains("\"version\":1"));
  }

  #[test]
  fn test_corrupt_data_starts_empty() {
    let store = MemoryStore::new();
    store.set(OFFLINE_QUEUE_KEY, "{not json").unwrap();

    let q = queue(&store);
    assert!(q.is_empty());
    q.add("x", note("a")).unwrap();
    assert_eq!(queue(&store).len(), 1);
  }

  #[test]
  fn test_newer_schema_is_never_overwritten() {
    let store = MemoryStore::new();
    let newer = json!({ "version": 2, "entries": [{ "kind": "unknown" }] }).to_string();
    store.set(OFFLINE_QUEUE_KEY, &newer).unwrap();

    let q = queue(&store);
    assert!(q.is_empty());
    assert!(matches!(q.add("x", note("a")), Err(Error::Storage(_))));
    assert!(matches!(q.clear(), Err(Error::Storage(_))));
    assert!(q.is_empty());

    assert_eq!(store.get(OFFLINE_QUEUE_KEY).unwrap(), Some(newer));
  }

  #[test]
  fn test_remove_and_clear_persist() {
    let store = MemoryStore::new();
    let q = queue(&store);
    let a = q.add("x", note("a")).unwrap();
    q.add("x", note("b")).unwrap();

    assert!(q.remove(&a).unwrap());
    assert!(!q.remove(&a).unwrap());
    assert_eq!(queue(&store).len(), 1);

    q.clear().unwrap();
    assert!(queue(&store).is_empty());
  }

  #[test]
  fn test_lazy_initialization() {
    let store = MemoryStore::new();
    queue(&store).add("x", note("a")).unwrap();

    let q: OfflineQueue<Note> = OfflineQueue::new(Arc::new(store.clone()));
    q.add("x", note("b")).unwrap();
    assert_eq!(q.len(), 2);
  }

  #[tokio::test]
  async fn test_process_removes_successes_in_order() {
    let store = MemoryStore::new();
    let q = queue(&store);
    q.add("x", note("first")).unwrap();
    q.add("x", note("second")).unwrap();
    q.add("x", note("third")).unwrap();

    let mut seen = Vec::new();
    let summary = q
      .process_queue(|action| {
        seen.push(action.payload.text.clone());
        let ok = action.payload.text != "second";
        async move { ok }
      })
      .await
      .unwrap();

    assert_eq!(seen, vec!["first", "second", "third"]);
    assert_eq!(summary, ProcessSummary { processed: 2, failed: 1 });
    let left = queue(&store).get_all();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].payload, note("second"));
    assert_eq!(left[0].retry_count, 1);
  }

  #[tokio::test]
  async fn test_action_dropped_after_five_failures() {
    let store = MemoryStore::new();
    let q = queue(&store);
    q.add("x", note("poison")).unwrap();

    for pass in 1..=5 {
      let summary = q.process_queue(|_| async { false }).await.unwrap();
      assert_eq!(summary.failed, 1);
      let expected = if pass < 5 { 1 } else { 0 };
      assert_eq!(queue(&store).len(), expected, "after pass {pass}");
    }

    let summary = q.process_queue(|_| async { false }).await.unwrap();
    assert_eq!(summary, ProcessSummary::default());
  }

  #[tokio::test]
  async fn test_processor_may_enqueue_more_work() {
    let store = MemoryStore::new();
    let q = Arc::new(queue(&store));
    q.add("x", note("a")).unwrap();

    let calls = AtomicUsize::new(0);
    let inner = Arc::clone(&q);
    let summary = q
      .process_queue(|_| {
        calls.fetch_add(1, Ordering::SeqCst);
        inner.add("follow_up", note("b")).unwrap();
        async { true }
      })
      .await
      .unwrap();

    // Only the snapshot taken at the start is processed
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(summary.processed, 1);
    let left = q.get_all();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].action_type, "follow_up");
  }
}
