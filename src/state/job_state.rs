/// Job and URL state definitions
///
/// This module defines the lifecycle states of a scraping job and of each URL it contains.
use serde::{Deserialize, Serialize};
use std::fmt;

/// Represents the current state of a job in the orchestration lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    // ===== Active States =====
    /// Job has been created but not yet placed in a tier queue
    Pending,

    /// Job is waiting in its tier queue
    Queued,

    /// Job is owned by a worker
    Running,

    /// Job hit a job-level fault and waits to be re-dispatched
    RetryQueued,

    // ===== Terminal States =====
    /// At least one URL was scraped successfully
    Completed,

    /// Every URL failed, or the job faulted repeatedly
    Failed,

    /// Job was cancelled by request or by its timeout
    Cancelled,
}

impl JobStatus {
    /// Returns true if this is a terminal state (no further processing needed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns true if the job is waiting for a worker
    pub fn is_waiting(&self) -> bool {
        matches!(self, Self::Pending | Self::Queued | Self::RetryQueued)
    }

    /// Returns true if a job in `self` may move to `next`
    ///
    /// ```text
    /// pending -> queued -> running -> {completed, failed}
    /// running -> retry_queued -> queued
    /// any non-terminal -> cancelled
    /// ```
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;

        if next == Cancelled {
            return !self.is_terminal();
        }

        matches!(
            (self, next),
            (Pending, Queued)
                | (Queued, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, RetryQueued)
                | (RetryQueued, Queued)
        )
    }

    /// Returns the status string carried in progress events
    ///
    /// Observers only distinguish waiting from processing, so every waiting
    /// state is reported as `pending`.
    pub fn wire_status(&self) -> &'static str {
        match self {
            Self::Pending | Self::Queued | Self::RetryQueued => "pending",
            Self::Running => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Converts the status to its snake_case name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::RetryQueued => "retry_queued",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parses a status from its snake_case name
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "retry_queued" => Some(Self::RetryQueued),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Returns all job states
    pub fn all_states() -> Vec<Self> {
        vec![
            Self::Pending,
            Self::Queued,
            Self::Running,
            Self::RetryQueued,
            Self::Completed,
            Self::Failed,
            Self::Cancelled,
        ]
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Progress of a single URL inside a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrlState {
    /// Not fetched yet
    Pending,
    /// Fetched successfully
    Done,
    /// Permanently failed or retries exhausted
    Failed,
    /// Waiting out a backoff before the next attempt
    Retrying,
}

impl UrlState {
    /// Returns true once the URL needs no more work
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for UrlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
        };
        write!(f, "{}", s)
    }
}
