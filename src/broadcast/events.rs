//! Events streamed to observers of a job
//!
//! Events serialize to JSON objects tagged by `"type"`:
//!
//! ```text
//! {"type":"progress","job_id":"…","status":"processing","progress":40,...}
//! {"type":"complete","job_id":"…","success":true,"status":"completed",...}
//! {"type":"error","job_id":"…","error":"…","error_type":"permanent_fetch_error",...}
//! ```

use crate::job::{ErrorKind, Job, JobId};
use crate::state::JobStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Job status as observers see it
///
/// Every waiting state collapses to `pending` and `running` becomes `processing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl WireStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl From<JobStatus> for WireStatus {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Pending | JobStatus::Queued | JobStatus::RetryQueued => Self::Pending,
            JobStatus::Running => Self::Processing,
            JobStatus::Completed => Self::Completed,
            JobStatus::Failed => Self::Failed,
            JobStatus::Cancelled => Self::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: JobId,
    pub status: WireStatus,
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_url: Option<String>,
    pub pages_scraped: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_pages: Option<u32>,
    pub errors: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub job_id: JobId,
    pub success: bool,
    pub status: WireStatus,
    pub pages_scraped: u32,
    pub total_pages: u32,
    /// Seconds between start and completion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    pub errors: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub job_id: JobId,
    pub error: String,
    pub error_type: String,
    pub timestamp: DateTime<Utc>,
}

/// One message in a job's event stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    Progress(ProgressEvent),
    Complete(CompletionEvent),
    Error(ErrorEvent),
}

impl JobEvent {
    /// Progress event describing the current state of `job`
    pub fn progress(job: &Job, current_url: Option<String>) -> Self {
        Self::Progress(ProgressEvent {
            job_id: job.id,
            status: job.status.into(),
            progress: job.progress,
            current_url,
            pages_scraped: job.pages_scraped(),
            total_pages: Some(job.total_pages()),
            errors: job.error_messages(),
            timestamp: Utc::now(),
        })
    }

    /// Completion event for a job that reached a terminal state
    pub fn complete(job: &Job) -> Self {
        Self::Complete(CompletionEvent {
            job_id: job.id,
            success: job.status == JobStatus::Completed,
            status: job.status.into(),
            pages_scraped: job.pages_scraped(),
            total_pages: job.total_pages(),
            duration: job.duration_secs(),
            errors: job.error_messages(),
            timestamp: Utc::now(),
        })
    }

    pub fn error(job_id: JobId, kind: ErrorKind, error: impl Into<String>) -> Self {
        Self::Error(ErrorEvent {
            job_id,
            error: error.into(),
            error_type: kind.as_str().to_string(),
            timestamp: Utc::now(),
        })
    }

    pub fn job_id(&self) -> JobId {
        match self {
            Self::Progress(e) => e.job_id,
            Self::Complete(e) => e.job_id,
            Self::Error(e) => e.job_id,
        }
    }

    /// Returns true for the completion event that ends a stream
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete(_))
    }

    /// Serializes the event as one JSON line
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
