use std::sync::Arc;

use querycache::config::Config;
use querycache::fetcher::HttpFetcher;
use querycache::service::QueryService;
use querycache_test as test;

pub use test::{AnalyticsServer, TempDir};

/// Setup tests and create a service querying `base_path` of the given server.
///
/// This function returns a tuple containing the service to test, and a temporary cache
/// directory. The directory is cleaned up when the [`TempDir`] instance is dropped. Keep it as
/// guard until the test has finished.
///
/// The `update_config` closure can modify any default configuration if needed before the
/// service is created.
pub async fn setup_service(
    server: &AnalyticsServer,
    base_path: &str,
    update_config: impl FnOnce(&mut Config),
) -> (QueryService, TempDir) {
    test::setup();

    let cache_dir = test::tempdir();

    let mut config = Config {
        cache_dir: Some(cache_dir.path().to_owned()),
        base_url: Some(server.url(base_path)),
        ..Default::default()
    };
    update_config(&mut config);

    let service = service_from_config(&config).await;
    (service, cache_dir)
}

/// Creates a service from a complete configuration.
pub async fn service_from_config(config: &Config) -> QueryService {
    let fetcher = HttpFetcher::from_config(config).unwrap();
    QueryService::from_config(config, Arc::new(fetcher)).await
}
