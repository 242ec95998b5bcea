//! Integration tests for the HTTP fetcher
//!
//! These tests use wiremock to create mock HTTP servers and check how responses
//! are turned into pages and classified failures, then run a whole job through
//! the coordinator into a SQLite result database.

use scrape_relay::config::{Config, FetcherConfig};
use scrape_relay::fetch::{FetchErrorKind, HttpFetcher, HttpFetcherFactory, PageFetcher};
use scrape_relay::retry::FailureClass;
use scrape_relay::storage::{NullSink, SqliteSink};
use scrape_relay::{Coordinator, JobEvent, JobStatus, PriorityTier, ScrapeConfig, SubmitRequest};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn html_page(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body.to_string(), "text/html")
}

fn fetcher() -> HttpFetcher {
    HttpFetcher::new(&FetcherConfig::default()).expect("Failed to build fetcher")
}

#[tokio::test]
async fn test_fetch_html_page() {
    let mock_server = MockServer::start().await;
    let base_url = mock_server.uri();

    Mock::given(method("GET"))
        .and(path("/article"))
        .respond_with(html_page(
            r#"<html><head><title>Hello World</title></head><body>
            <a href="/next">Next</a>
            <a href="mailto:someone@example.com">Mail</a>
            <img src="/logo.png">
            </body></html>"#,
        ))
        .mount(&mock_server)
        .await;

    let url = format!("{}/article", base_url);
    let page = fetcher()
        .fetch(&url, &ScrapeConfig::default())
        .await
        .expect("Fetch should succeed");

    assert_eq!(page.status_code, 200);
    assert_eq!(page.title.as_deref(), Some("Hello World"));
    assert!(page.content_type.contains("text/html"));
    assert_eq!(page.links, vec![format!("{}/next", base_url)]);
    assert_eq!(page.images, vec![format!("{}/logo.png", base_url)]);
}

#[tokio::test]
async fn test_link_extraction_can_be_disabled() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(html_page(r#"<a href="/a">A</a><img src="/b.png">"#))
        .mount(&mock_server)
        .await;

    let config = ScrapeConfig {
        extract_links: false,
        extract_images: false,
        ..ScrapeConfig::default()
    };
    let page = fetcher()
        .fetch(&format!("{}/", mock_server.uri()), &config)
        .await
        .unwrap();

    assert!(page.links.is_empty());
    assert!(page.images.is_empty());
}

#[tokio::test]
async fn test_rate_limit_response_carries_retry_after() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/busy"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
        .mount(&mock_server)
        .await;

    let err = fetcher()
        .fetch(&format!("{}/busy", mock_server.uri()), &ScrapeConfig::default())
        .await
        .unwrap_err();

    assert_eq!(err.kind, FetchErrorKind::Http);
    assert_eq!(err.status, Some(429));
    assert_eq!(err.retry_after, Some(Duration::from_secs(7)));
    assert_eq!(FailureClass::classify(&err), FailureClass::RateLimit);
}

#[tokio::test]
async fn test_status_classification() {
    let mock_server = MockServer::start().await;

    for (route, status) in [("/missing", 404), ("/broken", 500), ("/unavailable", 503)] {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(status))
            .mount(&mock_server)
            .await;
    }

    let fetcher = fetcher();
    let config = ScrapeConfig::default();
    let classify = |route: &'static str| {
        let url = format!("{}{}", mock_server.uri(), route);
        let fetcher = &fetcher;
        let config = &config;
        async move {
            let err = fetcher.fetch(&url, config).await.unwrap_err();
            FailureClass::classify(&err)
        }
    };

    assert_eq!(classify("/missing").await, FailureClass::Permanent);
    assert_eq!(classify("/broken").await, FailureClass::Transient);
    assert_eq!(classify("/unavailable").await, FailureClass::RateLimit);
}

#[tokio::test]
async fn test_bot_protection_is_blocked() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/guarded"))
        .respond_with(ResponseTemplate::new(403).insert_header("cf-mitigated", "challenge"))
        .mount(&mock_server)
        .await;

    let err = fetcher()
        .fetch(&format!("{}/guarded", mock_server.uri()), &ScrapeConfig::default())
        .await
        .unwrap_err();

    assert_eq!(err.kind, FetchErrorKind::Blocked);
    assert_eq!(FailureClass::classify(&err), FailureClass::RateLimit);
}

#[tokio::test]
async fn test_non_html_content_is_rejected() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/data.json"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(r#"{"a":1}"#, "application/json"),
        )
        .mount(&mock_server)
        .await;

    let err = fetcher()
        .fetch(&format!("{}/data.json", mock_server.uri()), &ScrapeConfig::default())
        .await
        .unwrap_err();

    assert_eq!(err.kind, FetchErrorKind::Invalid);
    assert_eq!(FailureClass::classify(&err), FailureClass::Permanent);
}

#[tokio::test]
async fn test_redirect_is_followed() {
    let mock_server = MockServer::start().await;
    let base_url = mock_server.uri();

    Mock::given(method("GET"))
        .and(path("/old"))
        .respond_with(
            ResponseTemplate::new(301)
                .insert_header("location", format!("{}/new", base_url).as_str()),
        )
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/new"))
        .respond_with(html_page("<title>Moved</title>"))
        .mount(&mock_server)
        .await;

    let url = format!("{}/old", base_url);
    let page = fetcher()
        .fetch(&url, &ScrapeConfig::default())
        .await
        .unwrap();

    assert_eq!(page.url, url);
    assert_eq!(page.final_url, format!("{}/new", base_url));
    assert_eq!(page.title.as_deref(), Some("Moved"));
}

#[tokio::test]
async fn test_user_agent_override() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/ua"))
        .and(header("user-agent", "CustomBot/2.0"))
        .respond_with(html_page("<title>ok</title>"))
        .mount(&mock_server)
        .await;

    let config = ScrapeConfig {
        user_agent: Some("CustomBot/2.0".to_string()),
        ..ScrapeConfig::default()
    };
    let page = fetcher()
        .fetch(&format!("{}/ua", mock_server.uri()), &config)
        .await
        .expect("Request with the override should match");
    assert_eq!(page.status_code, 200);
}

#[tokio::test]
async fn test_page_timeout() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(html_page("<title>late</title>").set_delay(Duration::from_secs(8)))
        .mount(&mock_server)
        .await;

    let config = ScrapeConfig {
        page_timeout_ms: ScrapeConfig::MIN_PAGE_TIMEOUT_MS,
        ..ScrapeConfig::default()
    };
    let err = fetcher()
        .fetch(&format!("{}/slow", mock_server.uri()), &config)
        .await
        .unwrap_err();

    assert_eq!(err.kind, FetchErrorKind::Timeout);
    assert_eq!(FailureClass::classify(&err), FailureClass::Transient);
}

#[tokio::test]
async fn test_resource_usage_counts_received_bytes() {
    let mock_server = MockServer::start().await;
    let body = format!("<html><title>big</title><p>{}</p></html>", "x".repeat(1000));

    Mock::given(method("GET"))
        .and(path("/big"))
        .respond_with(html_page(&body))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock_server)
        .await;

    let fetcher = fetcher();
    assert_eq!(fetcher.resource_usage(), 0);

    let url = format!("{}/big", mock_server.uri());
    for _ in 0..3 {
        fetcher.fetch(&url, &ScrapeConfig::default()).await.unwrap();
    }
    assert_eq!(fetcher.resource_usage(), 3 * body.len() as u64);

    // Error responses are not read, so they add nothing
    let missing = format!("{}/missing", mock_server.uri());
    assert!(fetcher.fetch(&missing, &ScrapeConfig::default()).await.is_err());
    assert_eq!(fetcher.resource_usage(), 3 * body.len() as u64);
}

#[tokio::test]
async fn test_worker_recycled_when_fetcher_exceeds_ceiling() {
    let mock_server = MockServer::start().await;
    let body = format!("<html><title>big</title><p>{}</p></html>", "x".repeat(2000));

    Mock::given(method("GET"))
        .respond_with(html_page(&body))
        .mount(&mock_server)
        .await;

    let mut config = Config::default();
    config.workers.min_workers = 1;
    config.workers.max_workers = 1;
    config.workers.resource_ceiling = Some(1000);
    config.rate_limit.min_spacing_ms = 10;
    let factory = Arc::new(HttpFetcherFactory::new(&config.fetcher).unwrap());
    let coordinator = Coordinator::start(config, factory, Arc::new(NullSink)).unwrap();

    let mut workers = Vec::new();
    for route in ["/first", "/second"] {
        let url = format!("{}{}", mock_server.uri(), route);
        let receipt = coordinator
            .submit(SubmitRequest::new("tenant-a", [url], PriorityTier::Free))
            .unwrap();
        let subscription = coordinator.join(receipt.job_id, "test").unwrap();
        while subscription.recv().await.is_some() {}

        let job = coordinator.status(receipt.job_id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        workers.push(job.worker_id.expect("job should record its worker"));
    }

    assert_ne!(workers[0], workers[1]);
    assert!(coordinator.recycled_workers() >= 1);
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_job_results_stored_in_sqlite() {
    let mock_server = MockServer::start().await;
    let base_url = mock_server.uri();

    for (route, title) in [("/one", "One"), ("/two", "Two")] {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(html_page(&format!("<title>{}</title>", title)))
            .mount(&mock_server)
            .await;
    }
    Mock::given(method("GET"))
        .and(path("/gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock_server)
        .await;

    let dir = TempDir::new().unwrap();
    let sink = Arc::new(SqliteSink::new(&dir.path().join("results.db")).unwrap());

    let mut config = Config::default();
    config.workers.min_workers = 1;
    config.workers.max_workers = 1;
    config.rate_limit.min_spacing_ms = 10;
    let factory = Arc::new(HttpFetcherFactory::new(&config.fetcher).unwrap());
    let coordinator = Coordinator::start(config, factory, sink.clone()).unwrap();

    let urls: Vec<String> = ["/one", "/two", "/gone"]
        .iter()
        .map(|route| format!("{}{}", base_url, route))
        .collect();
    let receipt = coordinator
        .submit(SubmitRequest::new("tenant-a", urls.clone(), PriorityTier::Pro))
        .unwrap();
    let subscription = coordinator.join(receipt.job_id, "test").unwrap();

    let mut completion = None;
    while let Some(event) = subscription.recv().await {
        if let JobEvent::Complete(done) = event {
            completion = Some(done);
        }
    }
    let completion = completion.expect("stream should end with a completion event");
    assert!(completion.success);
    assert_eq!(completion.pages_scraped, 2);
    assert_eq!(completion.errors.len(), 1);

    let job = coordinator.status(receipt.job_id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    coordinator.shutdown().await;

    // Persisting is fire-and-forget, give the sink a moment
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(sink.page_count(receipt.job_id).unwrap(), 2);
    let stored = sink
        .get_page(receipt.job_id, &urls[0])
        .unwrap()
        .expect("first page should be stored");
    assert_eq!(stored.title.as_deref(), Some("One"));
    assert_eq!(stored.status_code, 200);

    let record = sink
        .get_job(receipt.job_id)
        .unwrap()
        .expect("job summary should be stored");
    assert_eq!(record.status, "completed");
    assert_eq!(record.pages_scraped, 2);
    assert_eq!(record.total_pages, 3);
    assert_eq!(record.errors.len(), 1);
}
