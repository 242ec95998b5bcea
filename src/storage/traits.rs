//! Result sink trait and error types
//!
//! Scraped pages leave the orchestration core through a `ResultSink`. Persisting
//! is fire-and-forget: a failing sink is logged by the caller and never fails
//! the scrape.

use crate::fetch::PageContent;
use crate::job::{Job, JobId};
use async_trait::async_trait;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Destination for scraped pages and finished job summaries
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Stores one scraped page of a job
    async fn persist(&self, job_id: JobId, url: &str, page: &PageContent) -> StorageResult<()>;

    /// Stores the summary of a job that reached a terminal state
    async fn record_job(&self, _job: &Job) -> StorageResult<()> {
        Ok(())
    }
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

#[async_trait]
impl ResultSink for NullSink {
    async fn persist(&self, _job_id: JobId, _url: &str, _page: &PageContent) -> StorageResult<()> {
        Ok(())
    }
}
