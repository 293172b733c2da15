use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::caching::{CacheKey, Payload};
use crate::config::FetchOptions;
use crate::coordinator::{FetchResult, RequestCoordinator};
use crate::errors::FetchError;
use crate::utils::futures::CallOnDrop;

/// Serves stale entries immediately while refreshing them in the background.
#[derive(Debug, Clone)]
pub struct StaleRevalidator {
    coordinator: RequestCoordinator,

    /// Keys with a background refresh in progress.
    refreshes: Arc<Mutex<HashSet<CacheKey>>>,

    /// Notified whenever the last outstanding refresh finishes.
    idle: Arc<Notify>,
}

impl StaleRevalidator {
    pub fn new(coordinator: RequestCoordinator) -> Self {
        Self {
            coordinator,
            refreshes: Default::default(),
            idle: Default::default(),
        }
    }

    pub fn coordinator(&self) -> &RequestCoordinator {
        &self.coordinator
    }

    /// The number of background refreshes that have not finished yet.
    pub fn refreshing_count(&self) -> usize {
        self.refreshes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Waits until every background refresh started so far has finished.
    pub async fn wait_idle(&self) {
        loop {
            // register before checking, so a refresh finishing in between is not missed
            let notified = self.idle.notified();
            if self.refreshing_count() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Like [`RequestCoordinator::resolve`], except that a stale entry is returned right away.
    ///
    /// Returning a stale entry kicks off a deduplicated refresh through `producer` that is not
    /// awaited. Failures of that refresh are logged and leave the stale entry in place.
    pub async fn resolve_with_revalidate<P, F>(
        &self,
        key: &CacheKey,
        producer: P,
        options: &FetchOptions,
    ) -> FetchResult
    where
        P: FnOnce(CancellationToken) -> F + Send + 'static,
        F: Future<Output = Result<Payload, FetchError>> + Send + 'static,
    {
        let store = self.coordinator.store();
        if let Some(entry) = store.get(key) {
            if store.is_stale(&entry) {
                metric!(counter("caches.access") += 1);
                metric!(counter("caches.memory.stale") += 1);
                self.spawn_refresh(key.clone(), producer, *options);
                return Ok(entry.value);
            }
        }

        self.coordinator.resolve(key, producer, options).await
    }

    fn spawn_refresh<P, F>(&self, key: CacheKey, producer: P, options: FetchOptions)
    where
        P: FnOnce(CancellationToken) -> F + Send + 'static,
        F: Future<Output = Result<Payload, FetchError>> + Send + 'static,
    {
        let mut refreshes = self.refreshes.lock().unwrap_or_else(PoisonError::into_inner);
        if refreshes.contains(&key) {
            return;
        }

        let done_token = {
            let key = key.clone();
            let refreshes = Arc::clone(&self.refreshes);
            let idle = Arc::clone(&self.idle);
            CallOnDrop::new(move || {
                let mut refreshes = refreshes.lock().unwrap_or_else(PoisonError::into_inner);
                refreshes.remove(&key);
                if refreshes.is_empty() {
                    idle.notify_waiters();
                }
            })
        };

        refreshes.insert(key.clone());
        drop(refreshes);

        metric!(counter("caches.revalidate") += 1);
        tracing::trace!(key = %key, "Spawning deduplicated background refresh");

        let coordinator = self.coordinator.clone();
        tokio::spawn(async move {
            let _done_token = done_token; // move into the future

            if let Err(error) = coordinator.resolve(&key, producer, &options).await {
                tracing::warn!(
                    key = %key,
                    kind = %error.kind(),
                    error = &error as &dyn std::error::Error,
                    "Background refresh failed, keeping stale entry",
                );
            }
        });
    }
}
