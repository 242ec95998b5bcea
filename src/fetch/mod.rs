//! Page fetching interface
//!
//! The orchestration core never fetches pages itself. Each worker owns a
//! `PageFetcher` created by a `FetcherFactory`; the fetcher turns a URL into a
//! `PageContent` or a classified `FetchError`, and reports its resource usage so
//! the pool can recycle workers that grow too large.
//!
//! `HttpFetcher` is the default reqwest-based implementation.

mod html;
mod http;

pub use http::{build_http_client, HttpFetcher, HttpFetcherFactory};

use crate::job::ScrapeConfig;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Content of a successfully fetched page
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageContent {
    /// URL that was requested
    pub url: String,
    /// URL after redirects
    pub final_url: String,
    pub status_code: u16,
    pub content_type: String,
    pub title: Option<String>,
    pub body: String,
    /// Absolute links found on the page (only when requested)
    pub links: Vec<String>,
    /// Absolute image sources found on the page (only when requested)
    pub images: Vec<String>,
}

impl PageContent {
    /// Minimal successful page, mostly useful for fetchers that do not render
    pub fn new(url: impl Into<String>, body: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            final_url: url.clone(),
            url,
            status_code: 200,
            content_type: "text/html".to_string(),
            body: body.into(),
            ..Self::default()
        }
    }
}

/// Raw cause of a failed fetch, before retry classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    /// Connection refused, reset, DNS failure, TLS failure
    Network,
    /// The request or page load timed out
    Timeout,
    /// The server answered with a non-success status
    Http,
    /// The target detected and blocked the scraper
    Blocked,
    /// The response could not be interpreted
    Unparsable,
    /// The request itself was invalid (bad URL, unsupported content)
    Invalid,
}

impl FetchErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::Http => "http",
            Self::Blocked => "blocked",
            Self::Unparsable => "unparsable",
            Self::Invalid => "invalid",
        }
    }
}

/// A failed fetch as reported by a `PageFetcher`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub message: String,
    /// HTTP status, when the server answered
    pub status: Option<u16>,
    /// Server-provided `Retry-After`, when present
    pub retry_after: Option<Duration>,
}

impl FetchError {
    pub fn new(kind: FetchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            retry_after: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Timeout, message)
    }

    /// Error for an HTTP response with a non-success status
    pub fn from_status(status: u16) -> Self {
        Self {
            kind: FetchErrorKind::Http,
            message: format!("HTTP {}", status),
            status: Some(status),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for FetchError {}

/// Fetches pages for a worker
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Fetches one URL with the job's settings
    async fn fetch(&self, url: &str, config: &ScrapeConfig) -> Result<PageContent, FetchError>;

    /// Resource usage accumulated by this fetcher, in fetcher-defined units
    /// (browser memory in MB, bytes received, ...). The pool reads it after each
    /// job and recycles the worker when it exceeds the configured ceiling.
    fn resource_usage(&self) -> u64 {
        0
    }

    /// Releases any resources held by the fetcher
    async fn shutdown(&self) {}
}

/// Creates a fresh fetcher for every new worker
pub trait FetcherFactory: Send + Sync {
    fn create(&self) -> Arc<dyn PageFetcher>;
}

impl<F> FetcherFactory for F
where
    F: Fn() -> Arc<dyn PageFetcher> + Send + Sync,
{
    fn create(&self) -> Arc<dyn PageFetcher> {
        self()
    }
}
