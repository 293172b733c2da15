//! Helpers for testing the cache without a network.

use std::collections::VecDeque;
use std::future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::caching::Payload;
use crate::clock::ManualClock;
use crate::errors::FetchError;
use crate::fetcher::{FetchRequest, RemoteFetcher};

pub use querycache_test::setup;

/// What a [`FakeFetcher`] does when it is called.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Responds with `"<endpoint>#<call number>"`, starting at 1.
    Counter,
    /// Responds with this payload.
    Payload(Payload),
    /// Fails with this error.
    Error(FetchError),
    /// Never settles.
    Pending,
}

/// A [`RemoteFetcher`] that answers from a script and records every call.
#[derive(Debug, Default)]
pub struct FakeFetcher {
    calls: AtomicUsize,
    delay: Option<Duration>,
    script: Mutex<VecDeque<Reply>>,
    fallback: Option<Reply>,
    requests: Mutex<Vec<FetchRequest>>,
    signals: Mutex<Vec<CancellationToken>>,
}

impl FakeFetcher {
    /// Answers every call with [`Reply::Counter`].
    pub fn counting() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answers every call with `reply`.
    pub fn always(reply: Reply) -> Arc<Self> {
        Arc::new(Self {
            fallback: Some(reply),
            ..Default::default()
        })
    }

    /// Like [`counting`](Self::counting), but every reply takes `delay`.
    pub fn delayed(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Default::default()
        })
    }

    /// Answers the next calls with `replies`, in order, before falling back.
    pub fn push(&self, replies: impl IntoIterator<Item = Reply>) {
        lock(&self.script).extend(replies);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        lock(&self.requests).clone()
    }

    /// The cancellation signals handed to every call so far.
    pub fn signals(&self) -> Vec<CancellationToken> {
        lock(&self.signals).clone()
    }
}

impl RemoteFetcher for FakeFetcher {
    fn fetch(
        &self,
        request: FetchRequest,
        signal: CancellationToken,
    ) -> BoxFuture<'static, Result<Payload, FetchError>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        lock(&self.signals).push(signal);
        lock(&self.requests).push(request.clone());

        let reply = lock(&self.script)
            .pop_front()
            .or_else(|| self.fallback.clone())
            .unwrap_or(Reply::Counter);
        let delay = self.delay;

        async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            match reply {
                Reply::Counter => Ok(Bytes::from(format!("{}#{call}", request.endpoint))),
                Reply::Payload(payload) => Ok(payload),
                Reply::Error(error) => Err(error),
                Reply::Pending => future::pending().await,
            }
        }
        .boxed()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A [`ManualClock`] shared between a test and the store under test.
pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::default())
}
