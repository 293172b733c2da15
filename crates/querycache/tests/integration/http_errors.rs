use std::net::TcpListener;
use std::time::Duration;

use querycache::caching::Params;
use querycache::config::FetchOptions;
use querycache::errors::ErrorKind;

use crate::{AnalyticsServer, service_from_config, setup_service};

#[tokio::test]
async fn test_status_codes() {
    let server = AnalyticsServer::new();
    let params = Params::from([("tf", "30d")]);

    let cases = [
        (401, ErrorKind::Unauthorized, "Authentication required. Please log in."),
        (403, ErrorKind::Unauthorized, "Authentication required. Please log in."),
        (500, ErrorKind::ServerError, "Server error. Please try again later."),
        (503, ErrorKind::ServerError, "Server error. Please try again later."),
        (
            404,
            ErrorKind::Unknown,
            "server responded with status 404: ",
        ),
    ];

    for (status, kind, message) in cases {
        let (service, _cache_dir) =
            setup_service(&server, &format!("/respond_statuscode/{status}/"), |_| {}).await;

        // failures are not cached, every call goes to the server
        for _ in 0..2 {
            let error = service
                .get_or_fetch("dashboard", &params, FetchOptions::default())
                .await
                .unwrap_err();

            assert_eq!(error.kind(), kind, "status {status}");
            assert_eq!(error.message(), message);
            assert_eq!(error.endpoint(), "dashboard");
            assert_eq!(error.key(), "dashboard?tf=30d");
            assert_eq!(error.cause().status(), Some(status));
        }
        assert_eq!(server.accesses(), 2);
    }
}

#[tokio::test]
async fn test_timeout() {
    let server = AnalyticsServer::new();
    let (service, _cache_dir) = setup_service(&server, "/delay/1h/", |config| {
        config.caches.timeout = Duration::from_millis(200);
    })
    .await;

    let error = service
        .get_or_fetch("dashboard", &Params::new(), FetchOptions::default())
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Timeout);
    assert_eq!(error.message(), "Request timed out. Please try again.");
    assert_eq!(error.cause().to_string(), "request timed out after 200ms");

    // a per-call deadline wins over the configured one
    let error = service
        .get_or_fetch(
            "dashboard",
            &Params::new(),
            FetchOptions::default().with_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
    assert_eq!(error.cause().to_string(), "request timed out after 50ms");
}

#[tokio::test]
async fn test_connection_refused() {
    querycache_test::setup();

    // grab a free port and release it again, nothing is listening there afterwards
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let config = querycache::config::Config {
        base_url: Some(format!("http://127.0.0.1:{port}/").parse().unwrap()),
        ..Default::default()
    };
    let service = service_from_config(&config).await;

    let error = service
        .get_or_fetch("dashboard", &Params::new(), FetchOptions::default())
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Network);
    assert_eq!(error.message(), "Network error. Please check your connection.");
}
