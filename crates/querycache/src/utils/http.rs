use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::config::Config;

/// The `User-Agent` sent with every remote fetch.
pub const USER_AGENT: &str = concat!("querycache/", env!("CARGO_PKG_VERSION"));

/// Creates a [`reqwest::Client`] for talking to the analytics API.
///
/// * Only the connect phase has a client-side timeout. The overall deadline of a fetch is
///   enforced by [`with_timeout`](crate::timeout::with_timeout), so that it can be
///   configured per call.
/// * The configured [`headers`](Config::headers) are sent with every request.
pub fn create_client(config: &Config) -> reqwest::Result<reqwest::Client> {
    let mut headers = HeaderMap::new();
    for (name, value) in &config.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => tracing::warn!(header = %name, "Ignoring invalid configured header"),
        }
    }

    reqwest::ClientBuilder::new()
        .gzip(true)
        .user_agent(USER_AGENT)
        .connect_timeout(config.connect_timeout)
        .pool_idle_timeout(Duration::from_secs(30))
        .default_headers(headers)
        .build()
}
