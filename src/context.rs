//! Application-wide wiring: one adapter, one offline queue and one mutation
//! guard built from a single [`Config`].

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::adapter::{Adapter, ApiResponse, Params, PendingMutation, RequestOptions};
use crate::config::Config;
use crate::error::Result;
use crate::guard::MutationGuard;
use crate::offline::{OfflineQueue, ProcessSummary};
use crate::store::{KeyValueStore, MemoryStore, SqliteStore};
use crate::transport::{HttpTransport, Method, Transport};

/// Outcome of [`AppContext::submit_or_enqueue`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Submission {
  pub response: ApiResponse<Value>,
  /// Set when the backend was unreachable and the mutation was parked.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub offline_id: Option<String>,
}

impl Submission {
  pub fn is_queued(&self) -> bool {
    self.offline_id.is_some()
  }
}

#[derive(Clone)]
pub struct AppContext {
  config: Arc<Config>,
  adapter: Adapter,
  offline: Arc<OfflineQueue<PendingMutation>>,
  guard: MutationGuard,
}

impl AppContext {
  /// Build the context with the HTTP transport and the configured store.
  pub fn init(config: Config) -> Result<Self> {
    let transport = Arc::new(HttpTransport::new()?);
    Self::with_transport(config, transport)
  }

  /// Build the context over a custom transport.
  pub fn with_transport(config: Config, transport: Arc<dyn Transport>) -> Result<Self> {
    let store: Arc<dyn KeyValueStore> = if config.offline.in_memory {
      Arc::new(MemoryStore::new())
    } else {
      let path = match &config.offline.database {
        Some(path) => path.clone(),
        None => SqliteStore::default_path()?,
      };
      debug!(path = %path.display(), "opening offline store");
      Arc::new(SqliteStore::open_at(&path)?)
    };
    Ok(Self::with_parts(config, transport, store))
  }

  pub fn with_parts(config: Config, transport: Arc<dyn Transport>, store: Arc<dyn KeyValueStore>) -> Self {
    let adapter = Adapter::new(&config, transport);
    let offline = OfflineQueue::with_max_retries(store, config.offline.max_retries);
    offline.initialize();

    if !adapter.is_configured() {
      warn!("no backend configured, requests will fail until one is set");
    }

    Self {
      config: Arc::new(config),
      adapter,
      offline: Arc::new(offline),
      guard: MutationGuard::new(),
    }
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn adapter(&self) -> &Adapter {
    &self.adapter
  }

  pub fn offline(&self) -> &OfflineQueue<PendingMutation> {
    &self.offline
  }

  pub fn guard(&self) -> &MutationGuard {
    &self.guard
  }

  /// Send a mutation, parking it in the offline queue when the backend
  /// cannot be reached.
  ///
  /// Rejected HTTP answers are returned as-is and not queued: replaying a
  /// request the server refused would not change its mind. Fails with
  /// `DuplicateOperation` while an identical mutation is still in flight.
  pub async fn submit_or_enqueue(
    &self,
    method: Method,
    endpoint: &str,
    data: Option<Value>,
    params: &Params,
    options: &RequestOptions,
  ) -> Result<Submission> {
    let key = MutationGuard::fingerprint(method, endpoint, params, data.as_ref());
    let _token = self.guard.acquire(key)?;

    let error = match self
      .adapter
      .send(method, endpoint, data.clone(), params, options)
      .await
    {
      Ok(response) => {
        return Ok(Submission {
          response: ApiResponse::ok(response.body, response.status),
          offline_id: None,
        })
      }
      Err(error) => error,
    };

    if !(method.is_mutation() && error.is_offline()) {
      return Ok(Submission {
        response: ApiResponse::from_error(&error),
        offline_id: None,
      });
    }

    let mutation = PendingMutation {
      method,
      endpoint: endpoint.to_string(),
      body: data,
      params: params.clone(),
    };
    let id = self.offline.add(mutation.action_type(), mutation)?;
    info!(%id, %method, endpoint, %error, "backend unreachable, mutation queued offline");

    Ok(Submission {
      response: ApiResponse::from_error(&error),
      offline_id: Some(id),
    })
  }

  /// Replay every parked mutation once.
  pub async fn sync_offline(&self) -> Result<ProcessSummary> {
    self
      .offline
      .process_queue(|action| {
        let adapter = self.adapter.clone();
        async move { adapter.replay(&action).await }
      })
      .await
  }

  /// Cancel queued requests and drop cached data. Parked mutations stay.
  pub fn dispose(&self) {
    self.adapter.dispose();
  }
}
