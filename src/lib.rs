//! Resilient client-side data access.
//!
//! Every request goes through one [`Adapter`] that layers a TTL cache,
//! in-flight deduplication, a priority queue, retries with backoff and a
//! circuit breaker over a pluggable [`Transport`]. Mutations that cannot
//! reach the backend can be parked in a durable [`OfflineQueue`] and
//! replayed later. [`AppContext`] wires all of it from one [`Config`].

pub mod adapter;
pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod context;
pub mod dedupe;
pub mod error;
pub mod guard;
pub mod offline;
pub mod queue;
pub mod retry;
mod serde_millis;
pub mod store;
pub mod transport;

pub use adapter::{Adapter, AdapterStats, ApiResponse, Params, PendingMutation, RequestOptions};
pub use cache::TtlCache;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use config::{Config, Provider};
pub use context::{AppContext, Submission};
pub use dedupe::Deduplicator;
pub use error::{Error, Result};
pub use guard::{GuardToken, MutationGuard};
pub use offline::{OfflineAction, OfflineQueue, ProcessSummary};
pub use queue::{QueueConfig, RequestQueue};
pub use retry::{with_retry, RetryPolicy};
pub use store::{KeyValueStore, MemoryStore, SqliteStore};
pub use transport::{HttpTransport, Method, Transport};
