//! Scrape-Relay: scraping job orchestration and progress tracking
//!
//! This crate schedules multi-URL scraping jobs across a bounded worker pool,
//! throttles requests per target domain, classifies fetch failures into retry
//! policies, collapses identical in-flight submissions into one execution, and
//! streams job progress to any number of subscribed observers.

pub mod broadcast;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod fetch;
pub mod job;
pub mod limiter;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod storage;
pub mod url;
pub mod worker;

use std::time::Duration;
use thiserror::Error;

/// Main error type for Scrape-Relay operations
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Scheduler overloaded: queue depth {depth} reached admission threshold {threshold}")]
    Overload { depth: usize, threshold: usize },

    #[error("Submissions to the {tier} tier are temporarily disabled")]
    TierDisabled { tier: job::PriorityTier },

    #[error("Quota exceeded for tenant {tenant} ({tier} tier: {limit} pages), resets in {reset_in:?}")]
    QuotaExceeded {
        tenant: String,
        tier: job::PriorityTier,
        limit: u32,
        reset_in: Duration,
    },

    #[error("Job not found: {0}")]
    JobNotFound(job::JobId),

    #[error("Invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: state::JobStatus,
        to: state::JobStatus,
    },

    #[error("URL error: {0}")]
    Url(#[from] UrlError),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Coordinator is shutting down")]
    ShuttingDown,
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// URL-specific errors
#[derive(Debug, Error)]
pub enum UrlError {
    #[error("Failed to parse URL: {0}")]
    Parse(String),

    #[error("Invalid URL scheme: {0}")]
    InvalidScheme(String),

    #[error("Missing domain in URL")]
    MissingDomain,

    #[error("Malformed URL: {0}")]
    Malformed(String),
}

/// Result type alias for Scrape-Relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for URL operations
pub type UrlResult<T> = std::result::Result<T, UrlError>;

// Re-export commonly used types
pub use broadcast::{Broadcaster, JobEvent, Subscription};
pub use config::Config;
pub use coordinator::Coordinator;
pub use fetch::{FetchError, FetchErrorKind, FetcherFactory, PageContent, PageFetcher};
pub use job::{JobId, PriorityTier, ScrapeConfig, SubmitReceipt, SubmitRequest};
pub use state::{JobStatus, UrlState};
pub use url::{extract_domain, normalize_url};
