use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};
use tokio_util::sync::CancellationToken;

use crate::caching::{CacheKey, CacheStore, Payload};
use crate::config::{CacheConfig, FetchOptions, ResolvedOptions};
use crate::errors::{ClassifiedError, FetchError, classify_at};
use crate::timeout::with_timeout;
use crate::utils::futures::CallOnDrop;

/// The outcome of a fetch as observed by every subscriber.
pub type FetchResult = Result<Payload, ClassifiedError>;

type FetchChannel = Shared<oneshot::Receiver<FetchResult>>;

/// One outstanding producer invocation, shared by all of its subscribers.
///
/// A fetch whose record has been removed from the map by an invalidation still reports to its
/// subscribers, but its result is no longer stored.
struct InFlightRecord {
    id: u64,
    channel: FetchChannel,
    subscribers: usize,
}

type InFlightMap = Arc<Mutex<HashMap<CacheKey, InFlightRecord>>>;

fn lock_in_flight(in_flight: &InFlightMap) -> MutexGuard<'_, HashMap<CacheKey, InFlightRecord>> {
    in_flight.lock().unwrap_or_else(PoisonError::into_inner)
}

enum Lookup {
    Fresh(Payload),
    Subscribed(FetchChannel),
}

/// Resolves queries from the [`CacheStore`], invoking a producer at most once per key at a time.
///
/// Concurrent callers asking for the same uncached key all subscribe to a single producer
/// invocation and observe the identical outcome. Successful results are stored, failures are
/// classified and never cached.
#[derive(Clone)]
pub struct RequestCoordinator {
    store: Arc<CacheStore>,

    /// Used for deduplicating concurrent fetches.
    in_flight: InFlightMap,
    next_id: Arc<AtomicU64>,

    defaults: CacheConfig,
}

impl fmt::Debug for RequestCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestCoordinator")
            .field("store", &self.store)
            .field("in_flight", &self.in_flight_count())
            .field("defaults", &self.defaults)
            .finish()
    }
}

impl RequestCoordinator {
    pub fn new(store: Arc<CacheStore>, defaults: CacheConfig) -> Self {
        Self {
            store,
            in_flight: Default::default(),
            next_id: Default::default(),
            defaults,
        }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn defaults(&self) -> &CacheConfig {
        &self.defaults
    }

    /// The number of producer invocations that have not settled yet.
    pub fn in_flight_count(&self) -> usize {
        self.lock().len()
    }

    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.lock().contains_key(key)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CacheKey, InFlightRecord>> {
        lock_in_flight(&self.in_flight)
    }

    /// Removes the entry for `key` and detaches a fetch for it that is still in flight.
    ///
    /// Callers asking for `key` afterwards start a new fetch. The detached fetch still reports
    /// to its subscribers, but its result is not stored.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let mut in_flight = self.lock();
        if in_flight.remove(key).is_some() {
            tracing::trace!(key = %key, "Detached in-flight fetch");
        }
        self.store.invalidate(key)
    }

    /// Like [`invalidate`](Self::invalidate), for every key matching `predicate`.
    pub fn invalidate_where<F>(&self, mut predicate: F) -> usize
    where
        F: FnMut(&CacheKey) -> bool,
    {
        let mut in_flight = self.lock();
        in_flight.retain(|key, _| !predicate(key));
        self.store.invalidate_where(predicate)
    }

    /// Drops every entry and detaches every fetch in flight.
    pub fn invalidate_all(&self) -> usize {
        let mut in_flight = self.lock();
        in_flight.clear();
        self.store.invalidate_all()
    }

    /// Returns the value for `key`, fetching it through `producer` unless a fresh entry exists.
    ///
    /// `producer` is only invoked if no fresh entry exists and no other fetch for `key` is in
    /// flight. It receives the signal that is cancelled when its deadline elapses. The TTL and
    /// deadline of a fetch are the ones of the caller that started it.
    pub async fn resolve<P, F>(
        &self,
        key: &CacheKey,
        producer: P,
        options: &FetchOptions,
    ) -> FetchResult
    where
        P: FnOnce(CancellationToken) -> F + Send + 'static,
        F: Future<Output = Result<Payload, FetchError>> + Send + 'static,
    {
        metric!(counter("caches.access") += 1);

        if let Some(entry) = self.store.get(key) {
            if self.store.is_fresh(&entry) {
                metric!(counter("caches.memory.hit") += 1);
                return Ok(entry.value);
            }
        }

        let channel = match self.subscribe(key, producer, options.resolve(&self.defaults)) {
            Lookup::Fresh(value) => return Ok(value),
            Lookup::Subscribed(channel) => channel,
        };

        match channel.await {
            Ok(result) => result,
            // the fetch task went away without reporting, it must have panicked
            Err(oneshot::Canceled) => Err(classify_at(
                FetchError::Other("fetch was aborted".into()),
                key,
                self.store.now(),
            )),
        }
    }

    /// Attaches to the in-flight fetch for `key`, or starts a new one.
    ///
    /// NOTE: This function itself is *not* `async`, because it should eagerly spawn the fetch
    /// on the runtime, even if the caller never awaits the result.
    fn subscribe<P, F>(&self, key: &CacheKey, producer: P, options: ResolvedOptions) -> Lookup
    where
        P: FnOnce(CancellationToken) -> F + Send + 'static,
        F: Future<Output = Result<Payload, FetchError>> + Send + 'static,
    {
        let mut in_flight = self.lock();

        if let Some(record) = in_flight.get_mut(key) {
            record.subscribers += 1;
            metric!(counter("caches.fetch.coalesced") += 1);
            return Lookup::Subscribed(record.channel.clone());
        }

        // A fetch that settled since our first lookup stored its result before it released
        // its record, so check again while holding the lock.
        if let Some(entry) = self.store.get(key) {
            if self.store.is_fresh(&entry) {
                metric!(counter("caches.memory.hit") += 1);
                return Lookup::Fresh(entry.value);
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let channel = self.create_channel(id, key.clone(), producer, options);
        in_flight.insert(
            key.clone(),
            InFlightRecord {
                id,
                channel: channel.clone(),
                subscribers: 1,
            },
        );
        Lookup::Subscribed(channel)
    }

    /// Spawns the producer wrapped in a deadline and returns a shareable channel to its outcome.
    fn create_channel<P, F>(
        &self,
        id: u64,
        key: CacheKey,
        producer: P,
        options: ResolvedOptions,
    ) -> FetchChannel
    where
        P: FnOnce(CancellationToken) -> F + Send + 'static,
        F: Future<Output = Result<Payload, FetchError>> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();

        let remove_record_token = {
            let key = key.clone();
            let in_flight = Arc::clone(&self.in_flight);
            CallOnDrop::new(move || {
                let mut in_flight = lock_in_flight(&in_flight);
                // an invalidation may have replaced the record with a newer fetch
                if in_flight.get(&key).is_some_and(|record| record.id == id) {
                    if let Some(record) = in_flight.remove(&key) {
                        tracing::trace!(key = %key, subscribers = record.subscribers, "Fetch settled");
                    }
                }
            })
        };

        let store = Arc::clone(&self.store);
        let in_flight = Arc::clone(&self.in_flight);
        let fetch = async move {
            let signal = CancellationToken::new();
            let start = Instant::now();

            tracing::trace!(key = %key, timeout = ?options.timeout, "Fetching");
            let result = with_timeout(options.timeout, &signal, producer(signal.clone())).await;

            let result = match result {
                Ok(value) => {
                    metric!(counter("caches.fetch") += 1, "status" => "ok");
                    // Holding the lock keeps invalidations out until the result is stored.
                    let records = lock_in_flight(&in_flight);
                    if records.get(&key).is_some_and(|record| record.id == id) {
                        store.put(key.clone(), value.clone(), options.ttl);
                    } else {
                        tracing::debug!(key = %key, "Invalidated while fetching, not caching result");
                    }
                    drop(records);
                    Ok(value)
                }
                Err(raw) => {
                    let error = classify_at(raw, &key, store.now());
                    metric!(counter("caches.fetch") += 1, "status" => error.kind().as_str());
                    tracing::debug!(
                        key = %key,
                        kind = %error.kind(),
                        error = error.cause() as &dyn std::error::Error,
                        "Fetch failed",
                    );
                    Err(error)
                }
            };
            metric!(timer("caches.fetch.duration") = start.elapsed());

            // Drop the token first to evict from the map. This ensures that callers either
            // get a channel that will receive data, or they create a new channel.
            drop(remove_record_token);
            sender.send(result).ok();
        };

        tokio::spawn(fetch);

        receiver.shared()
    }
}
