//! reqwest-based page fetcher
//!
//! Plain HTTP fetching without JavaScript rendering. Responses are classified into
//! `FetchError` kinds here; whether and when to retry is decided by the worker's
//! retry policy.

use super::html::parse_page;
use super::{FetchError, FetchErrorKind, FetcherFactory, PageContent, PageFetcher};
use crate::config::FetcherConfig;
use crate::job::ScrapeConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER, USER_AGENT};
use reqwest::{redirect::Policy, Client, StatusCode};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Builds an HTTP client with the configured user agent and timeouts
///
/// # Example
///
/// ```no_run
/// use scrape_relay::config::FetcherConfig;
/// use scrape_relay::fetch::build_http_client;
///
/// let client = build_http_client(&FetcherConfig::default()).unwrap();
/// ```
pub fn build_http_client(config: &FetcherConfig) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(config.user_agent())
        .timeout(Duration::from_millis(config.request_timeout_ms))
        .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
        .redirect(Policy::limited(10))
        .gzip(true)
        .brotli(true)
        .build()
}

/// Fetches pages over plain HTTP
///
/// Resource usage is the number of response body bytes this fetcher has
/// received since it was created, so a worker that has pulled a lot of data
/// through its fetcher gets recycled.
pub struct HttpFetcher {
    client: Client,
    bytes_received: AtomicU64,
}

impl HttpFetcher {
    pub fn new(config: &FetcherConfig) -> Result<Self, reqwest::Error> {
        Ok(Self::with_client(build_http_client(config)?))
    }

    /// Creates a fetcher sharing an existing client's connection pool
    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            bytes_received: AtomicU64::new(0),
        }
    }

    async fn fetch_inner(
        &self,
        url: &str,
        config: &ScrapeConfig,
    ) -> Result<PageContent, FetchError> {
        let parsed_url =
            Url::parse(url).map_err(|e| FetchError::new(FetchErrorKind::Invalid, e.to_string()))?;

        let mut request = self
            .client
            .get(parsed_url)
            .timeout(Duration::from_millis(config.page_timeout_ms));
        if let Some(ua) = &config.user_agent {
            request = request.header(USER_AGENT, ua.as_str());
        }

        let response = request.send().await.map_err(classify_request_error)?;
        let status = response.status();
        let final_url = response.url().to_string();

        if !status.is_success() {
            return Err(classify_status(status, response.headers()));
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if !content_type.is_empty()
            && !content_type.contains("html")
            && !content_type.starts_with("text/")
        {
            return Err(FetchError::new(
                FetchErrorKind::Invalid,
                format!("Unsupported content type: {}", content_type),
            ));
        }

        let body = response.text().await.map_err(classify_request_error)?;
        self.bytes_received.fetch_add(body.len() as u64, Ordering::SeqCst);

        let base = Url::parse(&final_url)
            .map_err(|e| FetchError::new(FetchErrorKind::Unparsable, e.to_string()))?;
        let parsed = parse_page(&body, &base, config.extract_links, config.extract_images);

        Ok(PageContent {
            url: url.to_string(),
            final_url,
            status_code: status.as_u16(),
            content_type,
            title: parsed.title,
            body,
            links: parsed.links,
            images: parsed.images,
        })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, config: &ScrapeConfig) -> Result<PageContent, FetchError> {
        let result = self.fetch_inner(url, config).await;

        if let Err(e) = &result {
            debug!(url = %url, kind = e.kind.as_str(), error = %e, "Fetch failed");
        }
        result
    }

    /// Response body bytes received so far
    fn resource_usage(&self) -> u64 {
        self.bytes_received.load(Ordering::SeqCst)
    }
}

/// Hands every worker an `HttpFetcher` over one shared client
pub struct HttpFetcherFactory {
    client: Client,
}

impl HttpFetcherFactory {
    pub fn new(config: &FetcherConfig) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_http_client(config)?,
        })
    }
}

impl FetcherFactory for HttpFetcherFactory {
    fn create(&self) -> Arc<dyn PageFetcher> {
        Arc::new(HttpFetcher::with_client(self.client.clone()))
    }
}

/// Maps a transport-level reqwest error to a fetch error
fn classify_request_error(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::timeout("Request timeout")
    } else if e.is_connect() {
        FetchError::network(format!("Connection failed: {}", e))
    } else if e.is_decode() || e.is_body() {
        FetchError::new(FetchErrorKind::Unparsable, e.to_string())
    } else if e.is_redirect() {
        FetchError::new(FetchErrorKind::Invalid, format!("Redirect error: {}", e))
    } else {
        FetchError::network(e.to_string())
    }
}

/// Maps a non-success response to a fetch error
///
/// A 403 carrying a bot-mitigation marker is reported as `Blocked` rather than a
/// plain HTTP error.
fn classify_status(status: StatusCode, headers: &HeaderMap) -> FetchError {
    if status == StatusCode::FORBIDDEN && headers.contains_key("cf-mitigated") {
        let mut err = FetchError::new(FetchErrorKind::Blocked, "Blocked by bot protection");
        err.status = Some(status.as_u16());
        return err;
    }

    let err = FetchError::from_status(status.as_u16());
    match headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| parse_retry_after(v, Utc::now()))
    {
        Some(delay) => err.with_retry_after(delay),
        None => err,
    }
}

/// Parses a `Retry-After` value given either in seconds or as an HTTP date
pub(crate) fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}
