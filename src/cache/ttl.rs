//! Bounded TTL cache with oldest-first eviction and tag invalidation.

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Smallest TTL we accept; keeps `expires_at > inserted_at`.
const MIN_TTL: Duration = Duration::from_millis(1);

/// A cached value together with its bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
  pub data: V,
  pub inserted_at: Instant,
  pub expires_at: Instant,
  /// Resource tags used for invalidation
  pub tags: BTreeSet<String>,
  /// Insertion order, breaks ties between equal `inserted_at`
  seq: u64,
}

impl<V> CacheEntry<V> {
  fn is_expired(&self, now: Instant) -> bool {
    now > self.expires_at
  }
}

struct Inner<V> {
  entries: HashMap<String, CacheEntry<V>>,
  next_seq: u64,
}

/// Key → value store with per-entry expiry.
///
/// Reads never refresh recency: when the cache is full the entry that was
/// inserted first goes, whether or not it was read recently.
pub struct TtlCache<V> {
  inner: Mutex<Inner<V>>,
  max_size: usize,
  default_ttl: Duration,
}

impl<V: Clone> TtlCache<V> {
  /// Create a cache holding at most `max_size` entries.
  pub fn new(max_size: usize, default_ttl: Duration) -> Self {
    Self {
      inner: Mutex::new(Inner {
        entries: HashMap::new(),
        next_seq: 0,
      }),
      max_size: max_size.max(1),
      default_ttl,
    }
  }

  pub fn max_size(&self) -> usize {
    self.max_size
  }

  pub fn default_ttl(&self) -> Duration {
    self.default_ttl
  }

  /// Insert a value. `None` uses the default TTL.
  pub fn set(&self, key: impl Into<String>, value: V, ttl: Option<Duration>) {
    self.set_tagged(key, value, ttl, std::iter::empty::<String>());
  }

  /// Insert a value carrying invalidation tags.
  pub fn set_tagged<I, T>(&self, key: impl Into<String>, value: V, ttl: Option<Duration>, tags: I)
  where
    I: IntoIterator<Item = T>,
    T: Into<String>,
  {
    let key = key.into();
    let ttl = ttl.unwrap_or(self.default_ttl).max(MIN_TTL);
    let now = Instant::now();

    let mut inner = self.inner.lock();

    // Overwrites never evict; only a new key can push the cache over capacity.
    if !inner.entries.contains_key(&key) && inner.entries.len() >= self.max_size {
      let oldest = inner
        .entries
        .iter()
        .min_by_key(|(_, entry)| (entry.inserted_at, entry.seq))
        .map(|(k, _)| k.clone());
      if let Some(oldest) = oldest {
        debug!(key = %oldest, "evicting oldest cache entry");
        inner.entries.remove(&oldest);
      }
    }

    let seq = inner.next_seq;
    inner.next_seq += 1;
    inner.entries.insert(
      key,
      CacheEntry {
        data: value,
        inserted_at: now,
        expires_at: now + ttl,
        tags: tags.into_iter().map(Into::into).collect(),
        seq,
      },
    );
  }

  /// Look up a value, dropping it if it has expired.
  pub fn get(&self, key: &str) -> Option<V> {
    let now = Instant::now();
    let mut inner = self.inner.lock();

    match inner.entries.get(key) {
      Some(entry) if entry.is_expired(now) => {
        debug!(key, "cache entry expired");
        inner.entries.remove(key);
        None
      }
      Some(entry) => Some(entry.data.clone()),
      None => None,
    }
  }

  /// Whether a live entry exists for `key`. Expired entries are removed.
  pub fn has(&self, key: &str) -> bool {
    let now = Instant::now();
    let mut inner = self.inner.lock();

    match inner.entries.get(key) {
      Some(entry) if entry.is_expired(now) => {
        inner.entries.remove(key);
        false
      }
      Some(_) => true,
      None => false,
    }
  }

  /// Remove a single key. Returns whether it was present.
  pub fn delete(&self, key: &str) -> bool {
    self.inner.lock().entries.remove(key).is_some()
  }

  pub fn clear(&self) {
    self.inner.lock().entries.clear();
  }

  /// Remove every key containing `pattern`. An empty pattern clears the cache.
  pub fn invalidate_pattern(&self, pattern: &str) -> usize {
    let mut inner = self.inner.lock();
    let before = inner.entries.len();
    inner.entries.retain(|key, _| !key.contains(pattern));
    before - inner.entries.len()
  }

  /// Remove every entry tagged with exactly `tag`.
  pub fn invalidate_tag(&self, tag: &str) -> usize {
    let mut inner = self.inner.lock();
    let before = inner.entries.len();
    inner.entries.retain(|_, entry| !entry.tags.contains(tag));
    before - inner.entries.len()
  }

  /// Number of stored entries, including expired ones not yet looked up.
  pub fn len(&self) -> usize {
    self.inner.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}
