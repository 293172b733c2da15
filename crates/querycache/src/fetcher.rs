//! The remote side of the cache: anything that can read a payload for an endpoint.

use std::fmt;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::caching::{CacheKey, Params, Payload};
use crate::config::Config;
use crate::errors::FetchError;
use crate::utils::http::create_client;

/// Describes one read against the remote API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub endpoint: String,
    pub params: Params,
}

impl FetchRequest {
    pub fn new(endpoint: impl Into<String>, params: Params) -> Self {
        Self {
            endpoint: endpoint.into(),
            params,
        }
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(&self.endpoint, &self.params)
    }
}

impl From<&CacheKey> for FetchRequest {
    fn from(key: &CacheKey) -> Self {
        Self::new(key.endpoint(), key.params().clone())
    }
}

/// Performs network reads on behalf of the cache.
///
/// Implementations should stop their work once `signal` is cancelled. The returned future may
/// also simply be dropped at that point.
pub trait RemoteFetcher: fmt::Debug + Send + Sync + 'static {
    fn fetch(
        &self,
        request: FetchRequest,
        signal: CancellationToken,
    ) -> BoxFuture<'static, Result<Payload, FetchError>>;
}

impl<T: RemoteFetcher + ?Sized> RemoteFetcher for Arc<T> {
    fn fetch(
        &self,
        request: FetchRequest,
        signal: CancellationToken,
    ) -> BoxFuture<'static, Result<Payload, FetchError>> {
        (**self).fetch(request, signal)
    }
}

/// A [`RemoteFetcher`] that issues `GET` requests against a base URL.
///
/// The endpoint is resolved relative to the base URL, and all parameters are sent as the query
/// string in a stable order.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client, base_url: Url) -> Self {
        Self { client, base_url }
    }

    /// Creates a fetcher for the configured [`base_url`](Config::base_url).
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let base_url = config
            .base_url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no base_url configured"))?;
        let client = create_client(config)?;
        Ok(Self::new(client, base_url))
    }

    /// Builds the full URL of a request.
    pub fn request_url(&self, request: &FetchRequest) -> Result<Url, FetchError> {
        let mut url = self
            .base_url
            .join(request.endpoint.trim_start_matches('/'))
            .map_err(|e| FetchError::Other(format!("invalid endpoint: {e}")))?;

        if !request.params.is_empty() {
            url.query_pairs_mut().extend_pairs(request.params.iter());
        }
        Ok(url)
    }
}

impl RemoteFetcher for HttpFetcher {
    fn fetch(
        &self,
        request: FetchRequest,
        signal: CancellationToken,
    ) -> BoxFuture<'static, Result<Payload, FetchError>> {
        let client = self.client.clone();
        let url = self.request_url(&request);

        async move {
            let url = url?;
            tracing::trace!(%url, "Fetching from remote API");

            let fetch = async {
                let response = client.get(url.clone()).send().await?;
                let status = response.status();

                if status.is_success() {
                    Ok::<Payload, FetchError>(response.bytes().await?)
                } else {
                    let details = response.text().await.unwrap_or_default();
                    tracing::debug!(%url, %status, "Remote API responded with an error");
                    Err(FetchError::Status {
                        status: status.as_u16(),
                        details,
                    })
                }
            };

            tokio::select! {
                biased;
                _ = signal.cancelled() => Err(FetchError::Cancelled),
                result = fetch => result,
            }
        }
        .boxed()
    }
}
