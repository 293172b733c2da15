//! # Query caching infrastructure
//!
//! Consumers tend to ask for the same handful of analytics queries over and over, from multiple
//! views and auto-refresh timers at once. This module contains the store that turns those into a
//! bounded set of remote fetches.
//!
//! ## Cache Layers
//!
//! - An in-memory layer, which serves every read. Entries are keyed by [`CacheKey`] and carry
//!   their own TTL. An entry past its TTL is *stale*: it is still returned by the store, and it
//!   is up to the caller to decide whether it is good enough.
//! - An optional durable layer on the file system, enabled by [`Config::cache_dir`]. Every
//!   change to the memory layer is mirrored to it in the background, and it is read exactly once
//!   on startup to warm the memory layer. Durable entries past their TTL are loaded as stale,
//!   entries older than [`CacheConfig::max_stale_age`] are deleted instead.
//!
//! Failures of the durable layer are logged and otherwise ignored, the in-memory layer never
//! waits for it.
//!
//! ## Eviction
//!
//! Entries leave the cache through explicit invalidation, through the durable layer dropping
//! them on load, or, with [`CacheConfig::max_entries`] set, by capacity. Capacity eviction
//! drops the least-recently-stored entry first.
//!
//! ### Metrics
//!
//! - `caches.access`: All accesses.
//! - `caches.memory.hit`: Accesses served fresh from memory.
//! - `caches.memory.stale`: Accesses served stale while being refreshed.
//! - `caches.fetch`: Remote fetches, tagged with their outcome `status`.
//! - `caches.fetch.coalesced`: Accesses that attached to a fetch already in flight.
//! - `caches.fetch.duration`: Time taken by remote fetches.
//! - `caches.revalidate`: Background refreshes started.
//! - `caches.evicted`: Entries dropped by capacity.
//! - `caches.memory.size`: The number of entries in memory.
//! - `caches.durable.write`: Operations applied to the durable layer, tagged with `op` and
//!   `status`.
//! - `caches.durable.load`: Entries loaded from the durable layer on startup.
//!
//! [`Config::cache_dir`]: crate::config::Config::cache_dir
//! [`CacheConfig::max_stale_age`]: crate::config::CacheConfig::max_stale_age
//! [`CacheConfig::max_entries`]: crate::config::CacheConfig::max_entries

mod cache_key;
pub mod durable;
mod store;

pub use cache_key::{CacheKey, CacheKeyBuilder, Params};
pub use durable::{DurableStorage, FsStorage, SerializedEntry};
pub use store::{CacheEntry, CacheStats, CacheStore, Payload};
