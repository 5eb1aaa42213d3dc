//! Guard against submitting the same mutation twice while the first one is
//! still in flight (double taps, re-entrant submits).

use parking_lot::Mutex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use crate::adapter::Params;
use crate::error::{Error, Result};
use crate::transport::Method;

#[derive(Clone, Default)]
pub struct MutationGuard {
  locked: Arc<Mutex<HashSet<String>>>,
}

impl MutationGuard {
  pub fn new() -> Self {
    Self::default()
  }

  /// Claim `key`. Fails with `DuplicateOperation` while another token for
  /// the same key is alive.
  pub fn acquire(&self, key: impl Into<String>) -> Result<GuardToken> {
    let key = key.into();
    if !self.locked.lock().insert(key.clone()) {
      debug!(%key, "rejected duplicate mutation");
      return Err(Error::DuplicateOperation(key));
    }
    Ok(GuardToken {
      key,
      locked: Arc::clone(&self.locked),
    })
  }

  pub fn is_locked(&self, key: &str) -> bool {
    self.locked.lock().contains(key)
  }

  pub fn len(&self) -> usize {
    self.locked.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.locked.lock().is_empty()
  }

  /// Stable key for a mutation: method, endpoint, query and body hashed
  /// together.
  pub fn fingerprint(method: Method, endpoint: &str, params: &Params, body: Option<&Value>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_str().as_bytes());
    hasher.update(b"\0");
    hasher.update(endpoint.as_bytes());
    hasher.update(b"\0");
    hasher.update(params.serialize().as_bytes());
    hasher.update(b"\0");
    if let Some(body) = body {
      // serde_json keeps object keys sorted, so equal bodies hash equally.
      hasher.update(body.to_string().as_bytes());
    }
    hex::encode(hasher.finalize())
  }
}

/// Releases its key when dropped.
#[must_use = "the key is released as soon as the token is dropped"]
pub struct GuardToken {
  key: String,
  locked: Arc<Mutex<HashSet<String>>>,
}

impl GuardToken {
  pub fn key(&self) -> &str {
    &self.key
  }
}

impl Drop for GuardToken {
  fn drop(&mut self) {
    self.locked.lock().remove(&self.key);
  }
}
