//! The consumer-facing entry point that ties all cache components together.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::caching::{CacheKey, CacheStats, CacheStore, Params};
use crate::clock::{Clock, SystemClock};
use crate::config::{CacheConfig, Config, FetchOptions};
use crate::coordinator::{FetchResult, RequestCoordinator};
use crate::debounce::DebounceGate;
use crate::fetcher::{FetchRequest, RemoteFetcher};
use crate::revalidate::StaleRevalidator;

/// Answers queries against a [`RemoteFetcher`], backed by the query cache.
///
/// Every query is identified by its endpoint and parameters. Fresh results are served from the
/// cache, concurrent identical queries share a single fetch, and with `revalidate` set stale
/// results are served while they are refreshed in the background.
#[derive(Debug, Clone)]
pub struct QueryService {
    fetcher: Arc<dyn RemoteFetcher>,
    revalidator: StaleRevalidator,
    debounce: Arc<DebounceGate<String>>,
}

impl QueryService {
    /// Creates a service with an in-memory cache.
    pub fn new(fetcher: Arc<dyn RemoteFetcher>, config: CacheConfig) -> Self {
        Self::with_clock(fetcher, config, Arc::new(SystemClock))
    }

    /// Creates a service with an in-memory cache that tells time by `clock`.
    pub fn with_clock(
        fetcher: Arc<dyn RemoteFetcher>,
        config: CacheConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let store = Arc::new(CacheStore::new(clock, config.max_entries));
        Self::with_store(fetcher, config, store)
    }

    /// Creates a service on top of an existing store.
    pub fn with_store(
        fetcher: Arc<dyn RemoteFetcher>,
        config: CacheConfig,
        store: Arc<CacheStore>,
    ) -> Self {
        let coordinator = RequestCoordinator::new(store, config);
        Self {
            fetcher,
            revalidator: StaleRevalidator::new(coordinator),
            debounce: Arc::new(DebounceGate::new()),
        }
    }

    /// Creates a service from the configuration.
    ///
    /// With a [`cache_dir`](Config::cache_dir) configured, the cache is persisted below it and
    /// warmed from it. Failing to set up the directory is logged, and the service falls back to
    /// an in-memory cache.
    pub async fn from_config(config: &Config, fetcher: Arc<dyn RemoteFetcher>) -> Self {
        let store = CacheStore::from_config(config, Arc::new(SystemClock)).await;
        Self::with_store(fetcher, config.caches, Arc::new(store))
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        self.revalidator.coordinator().store()
    }

    pub fn config(&self) -> &CacheConfig {
        self.revalidator.coordinator().defaults()
    }

    /// Returns the payload of a query, from the cache or fetched from the remote API.
    ///
    /// A failed query always yields a [`ClassifiedError`](crate::errors::ClassifiedError).
    pub async fn get_or_fetch(
        &self,
        endpoint: &str,
        params: &Params,
        options: FetchOptions,
    ) -> FetchResult {
        let key = CacheKey::new(endpoint, params);
        let fetcher = Arc::clone(&self.fetcher);
        let request = FetchRequest::new(endpoint, params.clone());
        let producer = move |signal: CancellationToken| fetcher.fetch(request, signal);

        let revalidate = options.revalidate.unwrap_or(self.config().revalidate);
        if revalidate {
            self.revalidator
                .resolve_with_revalidate(&key, producer, &options)
                .await
        } else {
            self.revalidator
                .coordinator()
                .resolve(&key, producer, &options)
                .await
        }
    }

    /// Invalidates one query, or every query of `endpoint` if no parameters are given.
    ///
    /// Fetches for these queries that are still in flight are not cached, and the next call to
    /// [`get_or_fetch`](Self::get_or_fetch) starts a new one. Returns the number of entries
    /// removed.
    pub fn invalidate(&self, endpoint: &str, params: Option<&Params>) -> usize {
        let coordinator = self.revalidator.coordinator();
        match params {
            Some(params) => coordinator.invalidate(&CacheKey::new(endpoint, params)) as usize,
            None => coordinator.invalidate_where(|key| key.endpoint() == endpoint),
        }
    }

    /// Invalidates every query of every endpoint starting with `prefix`.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        self.revalidator
            .coordinator()
            .invalidate_where(|key| key.endpoint().starts_with(prefix))
    }

    /// Drops the whole cache.
    pub fn invalidate_all(&self) -> usize {
        self.revalidator.coordinator().invalidate_all()
    }

    /// Runs a query once calls for `slot` have settled for the configured debounce window.
    ///
    /// Only the latest call for a slot is run, and `on_result` is only called if no newer call
    /// for the slot arrived in the meantime.
    pub fn schedule<C>(
        &self,
        slot: impl Into<String>,
        endpoint: impl Into<String>,
        params: Params,
        options: FetchOptions,
        on_result: C,
    ) where
        C: FnOnce(FetchResult) + Send + 'static,
    {
        let this = self.clone();
        let query = (endpoint.into(), params, options);
        let delay = self.config().debounce;

        self.debounce
            .schedule(slot.into(), query, delay, move |(endpoint, params, options), _| {
                async move {
                    let result = this.get_or_fetch(&endpoint, &params, options).await;
                    on_result(result);
                }
            });
    }

    /// A snapshot of the cache contents and the fetches in flight.
    pub fn stats(&self) -> CacheStats {
        let coordinator = self.revalidator.coordinator();
        CacheStats {
            in_flight: coordinator.in_flight_count(),
            ..coordinator.store().stats()
        }
    }

    /// Waits until all background refreshes started by stale reads have finished.
    ///
    /// Call this before shutting down the runtime, which would otherwise abort them.
    pub async fn wait_idle(&self) {
        self.revalidator.wait_idle().await
    }

    /// Waits until every change to the cache has reached the durable tier.
    pub async fn flush(&self) {
        self.store().flush().await
    }

    /// Releases all pending debounced calls.
    ///
    /// Calls to [`schedule`](Self::schedule) after this are ignored.
    pub fn shutdown(&self) {
        self.debounce.shutdown();
    }
}
