//! Resilient adapter: the single entry point for outbound requests.
//!
//! A request flows through the layers in this order:
//!
//! 1. fail fast if no backend is configured
//! 2. cache lookup (GET only)
//! 3. dedupe of identical in-flight reads (GET, opt-in)
//! 4. admission through the priority queue
//! 5. retry with backoff (opt-in)
//! 6. circuit breaker
//! 7. transport call under the configured timeout
//!
//! Successful reads are cached with resource tags; successful writes drop
//! every cached read carrying the tags they touch. Callers always get an
//! [`ApiResponse`], never an error.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::cache::TtlCache;
use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::config::{BackendConfig, Config};
use crate::dedupe::Deduplicator;
use crate::error::{Error, Result};
use crate::offline::OfflineAction;
use crate::queue::RequestQueue;
use crate::retry::{with_retry, RetryPolicy};
use crate::transport::{Method, Transport, TransportRequest, TransportResponse};

/// Normalized result of every adapter call.
///
/// Exactly one of `data` and `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiResponse<T> {
  pub data: Option<T>,
  pub error: Option<String>,
  pub status: u16,
}

impl<T> ApiResponse<T> {
  pub fn ok(data: T, status: u16) -> Self {
    Self {
      data: Some(data),
      error: None,
      status,
    }
  }

  pub fn err(message: impl Into<String>, status: u16) -> Self {
    Self {
      data: None,
      error: Some(message.into()),
      status,
    }
  }

  pub fn from_error(error: &Error) -> Self {
    Self::err(error.to_string(), error.status())
  }

  pub fn is_ok(&self) -> bool {
    self.error.is_none()
  }

  pub fn into_result(self) -> std::result::Result<T, String> {
    match (self.data, self.error) {
      (Some(data), None) => Ok(data),
      (_, Some(error)) => Err(error),
      (None, None) => Err("empty response".to_string()),
    }
  }
}

/// Query parameters, kept sorted so equal maps serialize identically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Params(BTreeMap<String, String>);

impl Params {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
    self.insert(key, value);
    self
  }

  pub fn insert(&mut self, key: impl Into<String>, value: impl fmt::Display) {
    self.0.insert(key.into(), value.to_string());
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
  }

  /// `a=1&b=x%20y`, keys sorted.
  pub fn serialize(&self) -> String {
    url::form_urlencoded::Serializer::new(String::new())
      .extend_pairs(self.iter())
      .finish()
  }
}

/// Per-request policy switches.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOptions {
  /// Serve and store GET responses through the cache.
  pub use_cache: bool,
  /// TTL for this response; the cache default otherwise.
  pub cache_ttl: Option<Duration>,
  pub use_retry: bool,
  /// Overrides the configured retry count.
  pub max_retries: Option<u32>,
  /// Collapse identical concurrent GETs into one call.
  pub dedupe: bool,
  /// Queue priority; higher starts first.
  pub priority: i32,
  /// Extra invalidation tags. Attached to cached reads and invalidated by
  /// successful writes.
  pub tags: Vec<String>,
}

impl Default for RequestOptions {
  fn default() -> Self {
    Self {
      use_cache: true,
      cache_ttl: None,
      use_retry: false,
      max_retries: None,
      dedupe: false,
      priority: 0,
      tags: Vec::new(),
    }
  }
}

impl RequestOptions {
  pub fn no_cache(mut self) -> Self {
    self.use_cache = false;
    self
  }

  pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
    self.cache_ttl = Some(ttl);
    self
  }

  pub fn with_retry(mut self) -> Self {
    self.use_retry = true;
    self
  }

  pub fn with_max_retries(mut self, max_retries: u32) -> Self {
    self.use_retry = true;
    self.max_retries = Some(max_retries);
    self
  }

  pub fn deduped(mut self) -> Self {
    self.dedupe = true;
    self
  }

  pub fn with_priority(mut self, priority: i32) -> Self {
    self.priority = priority;
    self
  }

  pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
    self.tags.push(tag.into());
    self
  }
}

/// Snapshot of adapter health and counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdapterStats {
  pub cache_size: usize,
  pub queue_pending: usize,
  pub queue_running: usize,
  pub in_flight: usize,
  pub circuit_state: CircuitState,
  pub consecutive_failures: u32,
  pub cache_hits: u64,
  pub cache_misses: u64,
  pub total_requests: u64,
}

/// Payload of an offline action that replays a mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
  pub method: Method,
  pub endpoint: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub body: Option<Value>,
  #[serde(default, skip_serializing_if = "Params::is_empty")]
  pub params: Params,
}

impl PendingMutation {
  /// Action type recorded in the offline queue.
  pub fn action_type(&self) -> String {
    format!("{} {}", self.method, self.endpoint)
  }
}

struct Inner {
  backend: BackendConfig,
  headers: Vec<(String, String)>,
  transport: Arc<dyn Transport>,
  cache: TtlCache<TransportResponse>,
  dedupe: Deduplicator<TransportResponse>,
  breaker: CircuitBreaker,
  queue: RequestQueue,
  retry: RetryPolicy,
  hits: AtomicU64,
  misses: AtomicU64,
  total: AtomicU64,
}

/// Handle to the adapter. Clones share caches, breaker and queue.
#[derive(Clone)]
pub struct Adapter {
  inner: Arc<Inner>,
}

impl Adapter {
  pub fn new(config: &Config, transport: Arc<dyn Transport>) -> Self {
    Self {
      inner: Arc::new(Inner {
        headers: config.backend.headers(),
        backend: config.backend.clone(),
        transport,
        cache: TtlCache::new(config.cache.max_size, config.cache.ttl),
        dedupe: Deduplicator::new(),
        breaker: CircuitBreaker::new(config.circuit_breaker),
        queue: RequestQueue::new(config.queue),
        retry: config.retry,
        hits: AtomicU64::new(0),
        misses: AtomicU64::new(0),
        total: AtomicU64::new(0),
      }),
    }
  }

  pub fn is_configured(&self) -> bool {
    self.inner.backend.is_configured()
  }

  pub async fn get<T: DeserializeOwned>(
    &self,
    endpoint: &str,
    params: &Params,
    options: &RequestOptions,
  ) -> ApiResponse<T> {
    self.request(Method::Get, endpoint, None, params, options).await
  }

  pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
    &self,
    endpoint: &str,
    data: &B,
    params: &Params,
    options: &RequestOptions,
  ) -> ApiResponse<T> {
    self.request_with_body(Method::Post, endpoint, data, params, options).await
  }

  pub async fn put<T: DeserializeOwned, B: Serialize + ?Sized>(
    &self,
    endpoint: &str,
    data: &B,
    params: &Params,
    options: &RequestOptions,
  ) -> ApiResponse<T> {
    self.request_with_body(Method::Put, endpoint, data, params, options).await
  }

  pub async fn patch<T: DeserializeOwned, B: Serialize + ?Sized>(
    &self,
    endpoint: &str,
    data: &B,
    params: &Params,
    options: &RequestOptions,
  ) -> ApiResponse<T> {
    self.request_with_body(Method::Patch, endpoint, data, params, options).await
  }

  pub async fn delete<T: DeserializeOwned>(
    &self,
    endpoint: &str,
    params: &Params,
    options: &RequestOptions,
  ) -> ApiResponse<T> {
    self.request(Method::Delete, endpoint, None, params, options).await
  }

  async fn request_with_body<T: DeserializeOwned, B: Serialize + ?Sized>(
    &self,
    method: Method,
    endpoint: &str,
    data: &B,
    params: &Params,
    options: &RequestOptions,
  ) -> ApiResponse<T> {
    match serde_json::to_value(data) {
      Ok(body) => self.request(method, endpoint, Some(body), params, options).await,
      Err(e) => ApiResponse::from_error(&Error::Encode(e.to_string())),
    }
  }

  /// Issue a request and normalize the outcome.
  pub async fn request<T: DeserializeOwned>(
    &self,
    method: Method,
    endpoint: &str,
    body: Option<Value>,
    params: &Params,
    options: &RequestOptions,
  ) -> ApiResponse<T> {
    let response = match self.send(method, endpoint, body, params, options).await {
      Ok(response) => response,
      Err(error) => {
        debug!(%method, endpoint, %error, "request failed");
        return ApiResponse::from_error(&error);
      }
    };

    match serde_json::from_value::<T>(response.body) {
      Ok(data) => ApiResponse::ok(data, response.status),
      Err(e) => ApiResponse::err(Error::Decode(e.to_string()).to_string(), response.status),
    }
  }

  /// Issue a request and return the raw outcome, errors included.
  ///
  /// This is the layer `request` normalizes; it is public for callers that
  /// need to tell failure kinds apart (e.g. to park a mutation offline).
  pub async fn send(
    &self,
    method: Method,
    endpoint: &str,
    body: Option<Value>,
    params: &Params,
    options: &RequestOptions,
  ) -> Result<TransportResponse> {
    self.inner.total.fetch_add(1, Ordering::Relaxed);

    if !self.is_configured() {
      return Err(Error::NotConfigured);
    }

    let key = cache_key(method, endpoint, params);
    let cacheable = method == Method::Get && options.use_cache;

    if cacheable {
      if let Some(hit) = self.inner.cache.get(&key) {
        self.inner.hits.fetch_add(1, Ordering::Relaxed);
        debug!(%key, "cache hit");
        return Ok(hit);
      }
      self.inner.misses.fetch_add(1, Ordering::Relaxed);
      debug!(%key, "cache miss");
    }

    let request = TransportRequest {
      method,
      url: self.build_url(endpoint, params)?,
      headers: self.inner.headers.clone(),
      body,
    };
    let tags = tags_for(endpoint, options);

    let response = if method == Method::Get && options.dedupe {
      let this = self.clone();
      let options = options.clone();
      self
        .inner
        .dedupe
        .dedupe(&key, move || async move { this.dispatch(request, &options).await })
        .await?
    } else {
      self.dispatch(request, options).await?
    };

    if cacheable {
      self
        .inner
        .cache
        .set_tagged(key, response.clone(), options.cache_ttl, tags.iter().cloned());
    } else if method.is_mutation() {
      let removed: usize = tags.iter().map(|tag| self.inner.cache.invalidate_tag(tag)).sum();
      if removed > 0 {
        debug!(%method, endpoint, removed, "invalidated cached reads");
      }
    }

    Ok(response)
  }

  /// Queue → retry → breaker → transport.
  async fn dispatch(&self, request: TransportRequest, options: &RequestOptions) -> Result<TransportResponse> {
    let this = self.clone();
    let policy = options
      .max_retries
      .map(|max| self.inner.retry.with_max_retries(max))
      .unwrap_or(self.inner.retry);
    let use_retry = options.use_retry;

    self
      .inner
      .queue
      .add(
        move || async move {
          if use_retry {
            with_retry(&policy, || {
              let this = this.clone();
              let request = request.clone();
              async move { this.call(request).await }
            })
            .await
          } else {
            this.call(request).await
          }
        },
        options.priority,
      )
      .await
  }

  /// One attempt through the circuit breaker.
  async fn call(&self, request: TransportRequest) -> Result<TransportResponse> {
    let timeout = self.inner.backend.timeout;
    let transport = Arc::clone(&self.inner.transport);

    self
      .inner
      .breaker
      .execute(|| async move {
        let response = tokio::time::timeout(timeout, transport.send(request))
          .await
          .map_err(|_| Error::Timeout(timeout))??;

        if response.is_success() {
          Ok(response)
        } else {
          Err(Error::Http {
            status: response.status,
            message: response.error_message(),
          })
        }
      })
      .await
  }

  fn build_url(&self, endpoint: &str, params: &Params) -> Result<Url> {
    let base = self.inner.backend.base_url.trim_end_matches('/');
    let path = endpoint.trim_start_matches('/');
    let mut url = Url::parse(&format!("{}/{}", base, path))?;

    if !params.is_empty() {
      url.query_pairs_mut().extend_pairs(params.iter());
    }
    Ok(url)
  }

  /// Replay a parked mutation. Returns whether it went through, which is
  /// what the offline queue expects from a processor.
  pub async fn replay(&self, action: &OfflineAction<PendingMutation>) -> bool {
    let mutation = &action.payload;
    let response: ApiResponse<Value> = self
      .request(
        mutation.method,
        &mutation.endpoint,
        mutation.body.clone(),
        &mutation.params,
        &RequestOptions::default(),
      )
      .await;

    if let Some(error) = &response.error {
      debug!(id = %action.id, %error, "replay failed");
    }
    response.is_ok()
  }

  /// Drop cached reads whose key contains `pattern`; everything when `None`.
  pub fn invalidate_cache(&self, pattern: Option<&str>) -> usize {
    match pattern {
      Some(pattern) => self.inner.cache.invalidate_pattern(pattern),
      None => {
        let count = self.inner.cache.len();
        self.inner.cache.clear();
        count
      }
    }
  }

  /// Drop cached reads carrying `tag`.
  pub fn invalidate_tag(&self, tag: &str) -> usize {
    self.inner.cache.invalidate_tag(tag)
  }

  pub fn stats(&self) -> AdapterStats {
    AdapterStats {
      cache_size: self.inner.cache.len(),
      queue_pending: self.inner.queue.pending(),
      queue_running: self.inner.queue.running(),
      in_flight: self.inner.dedupe.in_flight(),
      circuit_state: self.inner.breaker.state(),
      consecutive_failures: self.inner.breaker.consecutive_failures(),
      cache_hits: self.inner.hits.load(Ordering::Relaxed),
      cache_misses: self.inner.misses.load(Ordering::Relaxed),
      total_requests: self.inner.total.load(Ordering::Relaxed),
    }
  }

  pub fn circuit_breaker(&self) -> &CircuitBreaker {
    &self.inner.breaker
  }

  pub fn queue(&self) -> &RequestQueue {
    &self.inner.queue
  }

  /// Cancel queued requests and empty the cache.
  pub fn dispose(&self) {
    let cancelled = self.inner.queue.clear();
    self.inner.cache.clear();
    debug!(cancelled, "adapter disposed");
  }
}

/// `METHOD:endpoint:params`
fn cache_key(method: Method, endpoint: &str, params: &Params) -> String {
  format!("{}:{}:{}", method, endpoint, params.serialize())
}

/// First path segment: `/projects/42?x=1` → `projects`.
pub fn resource_tag(endpoint: &str) -> Option<String> {
  endpoint
    .trim_start_matches('/')
    .split(['/', '?', '#'])
    .next()
    .filter(|segment| !segment.is_empty())
    .map(String::from)
}

fn tags_for(endpoint: &str, options: &RequestOptions) -> Vec<String> {
  let mut tags: Vec<String> = resource_tag(endpoint).into_iter().collect();
  for tag in &options.tags {
    if !tags.contains(tag) {
      tags.push(tag.clone());
    }
  }
  tags
}
