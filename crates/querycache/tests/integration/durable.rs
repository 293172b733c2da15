use querycache::caching::Params;
use querycache::config::{Config, FetchOptions};

use crate::{AnalyticsServer, service_from_config};

#[tokio::test]
async fn test_cache_survives_restarts() {
    querycache_test::setup();
    let server = AnalyticsServer::new();
    let cache_dir = querycache_test::tempdir();
    let config = Config {
        cache_dir: Some(cache_dir.path().to_owned()),
        base_url: Some(server.url("/echo/")),
        ..Default::default()
    };
    let params = Params::from([("tf", "30d")]);

    let first = {
        let service = service_from_config(&config).await;
        let payload = service
            .get_or_fetch("dashboard", &params, FetchOptions::default())
            .await
            .unwrap();
        service.flush().await;
        payload
    };
    assert_eq!(server.accesses(), 1);
    assert!(cache_dir.path().join("queries").join("entries").is_dir());

    let service = service_from_config(&config).await;
    assert_eq!(service.stats().entries, 1);
    let second = service
        .get_or_fetch("dashboard", &params, FetchOptions::default())
        .await
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(server.accesses(), 0);

    // invalidation reaches the durable layer as well
    assert_eq!(service.invalidate("dashboard", None), 1);
    service.flush().await;

    let service = service_from_config(&config).await;
    assert_eq!(service.stats().entries, 0);
}

#[tokio::test]
async fn test_unusable_cache_dir_falls_back_to_memory() {
    querycache_test::setup();
    let server = AnalyticsServer::new();
    let cache_dir = querycache_test::tempdir();

    // a file where the cache directory should be
    let blocked = cache_dir.path().join("blocked");
    std::fs::write(&blocked, b"").unwrap();

    let config = Config {
        cache_dir: Some(blocked),
        base_url: Some(server.url("/echo/")),
        ..Default::default()
    };
    let service = service_from_config(&config).await;

    for _ in 0..2 {
        service
            .get_or_fetch("dashboard", &Params::new(), FetchOptions::default())
            .await
            .unwrap();
    }
    assert_eq!(server.accesses(), 1);
}
