use std::time::Duration;

use futures::future::join_all;
use querycache::caching::Params;
use querycache::config::FetchOptions;
use serde_json::{Value, json};

use crate::{AnalyticsServer, setup_service};

fn parse(payload: &[u8]) -> Value {
    serde_json::from_slice(payload).unwrap()
}

#[tokio::test]
async fn test_fresh_queries_are_cached() {
    let server = AnalyticsServer::new();
    let (service, _cache_dir) = setup_service(&server, "/echo/", |_| {}).await;
    let params = Params::from([("tf", "30d"), ("team", "growth")]);

    for _ in 0..3 {
        let payload = service
            .get_or_fetch("dashboard", &params, FetchOptions::default())
            .await
            .unwrap();

        assert_eq!(
            parse(&payload),
            json!({
                "path": "dashboard",
                "query": {"team": "growth", "tf": "30d"},
                "authorization": null,
            })
        );
    }

    assert_eq!(
        server.all_hits(),
        vec![("/echo/dashboard?team=growth&tf=30d".to_owned(), 1)]
    );

    // another parameter is another query
    service
        .get_or_fetch("dashboard", &[("tf", "7d")].into(), FetchOptions::default())
        .await
        .unwrap();
    assert_eq!(server.accesses(), 1);
}

#[tokio::test]
async fn test_configured_headers() {
    let server = AnalyticsServer::new();
    let (service, _cache_dir) = setup_service(&server, "/echo/", |config| {
        config
            .headers
            .insert("Authorization".into(), "Bearer secret".into());
    })
    .await;

    let payload = service
        .get_or_fetch("dashboard", &Params::new(), FetchOptions::default())
        .await
        .unwrap();

    assert_eq!(parse(&payload)["authorization"], "Bearer secret");
}

#[tokio::test]
async fn test_concurrent_queries_share_a_request() {
    let server = AnalyticsServer::new();
    let (service, _cache_dir) = setup_service(&server, "/delay/100ms/", |_| {}).await;
    let params = Params::from([("tf", "30d")]);

    let results = join_all(
        (0..20).map(|_| service.get_or_fetch("dashboard", &params, FetchOptions::default())),
    )
    .await;

    assert_eq!(server.accesses(), 1);
    let first = results[0].clone().unwrap();
    assert!(results.iter().all(|result| result.as_ref() == Ok(&first)));
    assert_eq!(service.stats().in_flight, 0);
}

#[tokio::test]
async fn test_invalidate_refetches() {
    let server = AnalyticsServer::new();
    let (service, _cache_dir) = setup_service(&server, "/echo/", |_| {}).await;
    let params = Params::from([("tf", "30d")]);

    service
        .get_or_fetch("reports/weekly", &params, FetchOptions::default())
        .await
        .unwrap();
    service
        .get_or_fetch("reports/daily", &params, FetchOptions::default())
        .await
        .unwrap();
    assert_eq!(server.accesses(), 2);

    assert_eq!(service.invalidate_prefix("reports/"), 2);

    service
        .get_or_fetch("reports/weekly", &params, FetchOptions::default())
        .await
        .unwrap();
    assert_eq!(server.accesses(), 1);
}

#[tokio::test]
async fn test_expired_queries_are_refetched() {
    let server = AnalyticsServer::new();
    let (service, _cache_dir) = setup_service(&server, "/echo/", |_| {}).await;
    let options = FetchOptions::default().with_ttl(Duration::from_millis(50));

    service
        .get_or_fetch("dashboard", &Params::new(), options)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    service
        .get_or_fetch("dashboard", &Params::new(), options)
        .await
        .unwrap();

    assert_eq!(server.accesses(), 2);
}
