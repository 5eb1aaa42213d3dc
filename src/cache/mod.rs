//! In-memory response cache.
//!
//! Entries expire lazily: nothing sweeps the map in the background, an
//! expired entry is only dropped when it is next looked up. Capacity is
//! bounded and the oldest insertion is evicted first.

mod ttl;

pub use ttl::{CacheEntry, TtlCache};
