use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::clock::Clock;
use crate::config::Config;

use super::CacheKey;
use super::durable::{DurableStorage, FsStorage, SerializedEntry};

/// The opaque response of a remote fetch. The cache never looks inside.
pub type Payload = Bytes;

/// A cached payload together with the time it was stored and its TTL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub value: Payload,
    pub stored_at: SystemTime,
    pub ttl: Duration,
}

impl CacheEntry {
    /// The age of this entry at `now`.
    ///
    /// A `now` before [`stored_at`](Self::stored_at) counts as age zero.
    pub fn age_at(&self, now: SystemTime) -> Duration {
        now.duration_since(self.stored_at).unwrap_or_default()
    }

    /// An entry is fresh on `[stored_at, stored_at + ttl)`.
    pub fn is_fresh_at(&self, now: SystemTime) -> bool {
        self.age_at(now) < self.ttl
    }

    pub fn is_stale_at(&self, now: SystemTime) -> bool {
        !self.is_fresh_at(now)
    }
}

/// A snapshot of the contents of a [`CacheStore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub fresh: usize,
    pub stale: usize,
    pub in_flight: usize,
}

#[derive(Debug)]
struct Stored {
    entry: CacheEntry,
    /// Position in the store order, used for least-recently-stored eviction.
    seq: u64,
}

#[derive(Debug, Default)]
struct MemoryTier {
    entries: HashMap<CacheKey, Stored>,
    order: BTreeMap<u64, CacheKey>,
    next_seq: u64,
}

impl MemoryTier {
    fn insert(&mut self, key: CacheKey, entry: CacheEntry) {
        let seq = self.next_seq;
        self.next_seq += 1;

        self.order.insert(seq, key.clone());
        if let Some(previous) = self.entries.insert(key, Stored { entry, seq }) {
            self.order.remove(&previous.seq);
        }
    }

    fn remove(&mut self, key: &CacheKey) -> bool {
        match self.entries.remove(key) {
            Some(stored) => {
                self.order.remove(&stored.seq);
                true
            }
            None => false,
        }
    }

    /// Drops the least-recently-stored entries until at most `max_entries` remain.
    fn evict(&mut self, max_entries: usize) -> Vec<CacheKey> {
        let mut evicted = vec![];
        while self.entries.len() > max_entries {
            let Some((_, key)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&key);
            evicted.push(key);
        }
        evicted
    }
}

enum DurableOp {
    Write(CacheKey, SerializedEntry),
    Remove(CacheKey),
    Clear,
    Flush(oneshot::Sender<()>),
}

/// Hands operations to a background task that applies them to the [`DurableStorage`] in order.
#[derive(Debug, Clone)]
struct DurableWriter {
    tx: mpsc::UnboundedSender<DurableOp>,
}

impl DurableWriter {
    fn spawn(storage: Arc<dyn DurableStorage>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                let (storage, op) = match op {
                    DurableOp::Flush(done) => {
                        let _ = done.send(());
                        continue;
                    }
                    op => (Arc::clone(&storage), op),
                };
                let result = tokio::task::spawn_blocking(move || apply(&*storage, op)).await;

                match result {
                    Ok((op_name, Ok(()))) => {
                        metric!(counter("caches.durable.write") += 1, "op" => op_name, "status" => "ok");
                    }
                    Ok((op_name, Err(e))) => {
                        metric!(counter("caches.durable.write") += 1, "op" => op_name, "status" => "error");
                        tracing::error!(
                            error = &e as &dyn std::error::Error,
                            op = op_name,
                            "Failed to update durable cache",
                        );
                    }
                    Err(e) => {
                        tracing::error!(
                            error = &e as &dyn std::error::Error,
                            "Durable cache writer panicked",
                        );
                    }
                }
            }
        });

        Self { tx }
    }

    fn send(&self, op: DurableOp) {
        if self.tx.send(op).is_err() {
            tracing::debug!("Durable cache writer is gone, dropping operation");
        }
    }
}

fn apply(storage: &dyn DurableStorage, op: DurableOp) -> (&'static str, std::io::Result<()>) {
    match op {
        DurableOp::Write(key, entry) => ("write", storage.write(&key, &entry)),
        DurableOp::Remove(key) => ("remove", storage.remove(&key)),
        DurableOp::Clear => ("clear", storage.clear()),
        DurableOp::Flush(_) => ("flush", Ok(())),
    }
}

/// A keyed, TTL-aware store of [`CacheEntry`]s.
///
/// Reads are served purely from memory. With a [`DurableStorage`] attached, every change is
/// mirrored to it in the background on a best-effort basis, and the store is warmed from it once
/// on construction.
pub struct CacheStore {
    memory: Mutex<MemoryTier>,
    durable: Option<DurableWriter>,
    clock: Arc<dyn Clock>,
    max_entries: Option<usize>,
}

impl fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStore")
            .field("entries", &self.len())
            .field("durable", &self.durable.is_some())
            .field("clock", &self.clock)
            .field("max_entries", &self.max_entries)
            .finish()
    }
}

impl CacheStore {
    /// Creates a store that only lives in memory.
    pub fn new(clock: Arc<dyn Clock>, max_entries: Option<usize>) -> Self {
        Self {
            memory: Mutex::default(),
            durable: None,
            clock,
            max_entries,
        }
    }

    /// Creates a store backed by `storage`, warmed with all entries it holds.
    ///
    /// Entries past their TTL are loaded as stale. Entries older than `max_stale_age` are
    /// deleted instead. A storage that cannot be read leaves the store empty.
    pub async fn with_durable(
        clock: Arc<dyn Clock>,
        max_entries: Option<usize>,
        storage: Arc<dyn DurableStorage>,
        max_stale_age: Option<Duration>,
    ) -> Self {
        let loaded = {
            let storage = Arc::clone(&storage);
            tokio::task::spawn_blocking(move || storage.load_all()).await
        };
        let mut loaded = match loaded {
            Ok(Ok(entries)) => entries,
            Ok(Err(e)) => {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    "Failed to load durable cache",
                );
                vec![]
            }
            Err(e) => {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    "Durable cache loader panicked",
                );
                vec![]
            }
        };

        let store = Self {
            memory: Mutex::default(),
            durable: Some(DurableWriter::spawn(storage)),
            clock,
            max_entries,
        };

        let now = store.clock.now();
        loaded.sort_by_key(|entry| entry.metadata.stored_at);

        let mut expired = vec![];
        let mut evicted = vec![];
        let mut warmed = 0;
        {
            let mut memory = store.lock();
            for serialized in loaded {
                let (key, entry) = serialized.into_entry();
                match max_stale_age {
                    Some(max_age) if entry.age_at(now) > max_age => expired.push(key),
                    _ => {
                        memory.insert(key, entry);
                        warmed += 1;
                    }
                }
            }
            if let Some(max_entries) = store.max_entries {
                evicted = memory.evict(max_entries);
            }
        }

        tracing::debug!(
            warmed,
            expired = expired.len(),
            evicted = evicted.len(),
            "Warmed cache from durable storage",
        );
        metric!(counter("caches.durable.load") += warmed as i64);

        for key in expired.into_iter().chain(evicted) {
            store.send_durable(DurableOp::Remove(key));
        }

        store
    }

    /// Creates the store described by the configuration.
    ///
    /// With a [`cache_dir`](Config::cache_dir) configured, the store is persisted below it and
    /// warmed from it. Failing to set up the directory is logged, and the store falls back to
    /// memory only.
    pub async fn from_config(config: &Config, clock: Arc<dyn Clock>) -> Self {
        let caches = &config.caches;
        let Some(dir) = config.cache_dir("queries") else {
            return Self::new(clock, caches.max_entries);
        };

        let storage = FsStorage::new(&dir).and_then(|storage| {
            storage.clear_tmp()?;
            Ok(storage)
        });
        match storage {
            Ok(storage) => {
                Self::with_durable(
                    clock,
                    caches.max_entries,
                    Arc::new(storage),
                    caches.max_stale_age,
                )
                .await
            }
            Err(e) => {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    cache_dir = %dir.display(),
                    "Failed to set up durable cache, caching in memory only",
                );
                Self::new(clock, caches.max_entries)
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryTier> {
        self.memory.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send_durable(&self, op: DurableOp) {
        if let Some(durable) = &self.durable {
            durable.send(op);
        }
    }

    /// The current time according to the store's clock.
    pub fn now(&self) -> SystemTime {
        self.clock.now()
    }

    /// Looks up an entry, fresh or stale.
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.lock()
            .entries
            .get(key)
            .map(|stored| stored.entry.clone())
    }

    /// Stores `value` under `key`, replacing any previous entry.
    ///
    /// The new entry becomes the most-recently-stored one.
    pub fn put(&self, key: CacheKey, value: Payload, ttl: Duration) -> CacheEntry {
        let entry = CacheEntry {
            value,
            stored_at: self.clock.now(),
            ttl,
        };
        let serialized = self
            .durable
            .as_ref()
            .map(|_| SerializedEntry::new(&key, &entry));

        let (evicted, size) = {
            let mut memory = self.lock();
            memory.insert(key.clone(), entry.clone());
            let evicted = match self.max_entries {
                Some(max_entries) => memory.evict(max_entries),
                None => vec![],
            };
            (evicted, memory.entries.len())
        };

        metric!(gauge("caches.memory.size") = size as u64);
        if !evicted.is_empty() {
            metric!(counter("caches.evicted") += evicted.len() as i64);
            tracing::trace!(evicted = evicted.len(), "Evicted least-recently-stored entries");
        }

        if let Some(serialized) = serialized {
            self.send_durable(DurableOp::Write(key, serialized));
        }
        for key in evicted {
            self.send_durable(DurableOp::Remove(key));
        }

        entry
    }

    /// Removes a single entry.
    ///
    /// Returns whether an entry was present.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let removed = self.lock().remove(key);
        self.send_durable(DurableOp::Remove(key.clone()));
        removed
    }

    /// Removes all entries matching `predicate` and returns how many were removed.
    pub fn invalidate_where<F>(&self, mut predicate: F) -> usize
    where
        F: FnMut(&CacheKey) -> bool,
    {
        let removed: Vec<_> = {
            let mut memory = self.lock();
            let keys: Vec<_> = memory
                .entries
                .keys()
                .filter(|key| predicate(key))
                .cloned()
                .collect();
            for key in &keys {
                memory.remove(key);
            }
            keys
        };

        let count = removed.len();
        for key in removed {
            self.send_durable(DurableOp::Remove(key));
        }
        count
    }

    /// Removes all entries whose endpoint starts with `prefix`.
    pub fn invalidate_by_prefix(&self, prefix: &str) -> usize {
        self.invalidate_where(|key| key.endpoint().starts_with(prefix))
    }

    /// Removes all entries of exactly this endpoint, regardless of their parameters.
    pub fn invalidate_endpoint(&self, endpoint: &str) -> usize {
        self.invalidate_where(|key| key.endpoint() == endpoint)
    }

    /// Removes everything, including the durable tier.
    pub fn invalidate_all(&self) -> usize {
        let count = {
            let mut memory = self.lock();
            let count = memory.entries.len();
            *memory = MemoryTier::default();
            count
        };
        self.send_durable(DurableOp::Clear);
        count
    }

    pub fn is_fresh(&self, entry: &CacheEntry) -> bool {
        entry.is_fresh_at(self.clock.now())
    }

    pub fn is_stale(&self, entry: &CacheEntry) -> bool {
        entry.is_stale_at(self.clock.now())
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counts the fresh and stale entries.
    ///
    /// The returned [`in_flight`](CacheStats::in_flight) is always zero, as the store does
    /// not know about fetches.
    pub fn stats(&self) -> CacheStats {
        let now = self.clock.now();
        let memory = self.lock();
        let fresh = memory
            .entries
            .values()
            .filter(|stored| stored.entry.is_fresh_at(now))
            .count();

        CacheStats {
            entries: memory.entries.len(),
            fresh,
            stale: memory.entries.len() - fresh,
            in_flight: 0,
        }
    }

    /// Waits until every durable operation issued so far has been applied.
    pub async fn flush(&self) {
        let Some(durable) = &self.durable else {
            return;
        };
        let (tx, rx) = oneshot::channel();
        durable.send(DurableOp::Flush(tx));
        let _ = rx.await;
    }
}
