//! Worker pool
//!
//! Workers are tokio tasks that pull jobs from the scheduler and run them with
//! their own `PageFetcher`. The pool keeps between `min_workers` and
//! `max_workers` of them alive, grows when the queue stays deep, lets surplus
//! workers retire when idle, and replaces a worker with a fresh one (new id, new
//! fetcher) after it has run `max_jobs_per_worker` jobs, outgrown its resource
//! ceiling, or hit a job-level fault.

mod pool;
mod runner;

pub use pool::WorkerPool;
pub use runner::JobRunner;

use crate::job::JobId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Identity of one worker incarnation; never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct WorkerId(u64);

impl WorkerId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Live state of one worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub jobs_processed: u32,
    pub assigned_job_id: Option<JobId>,
    pub started_at: DateTime<Utc>,
}

/// Why a worker stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerExit {
    /// Replace with a fresh worker
    Recycle(RecycleReason),
    /// Idle surplus worker leaving the pool
    Retire,
    /// The pool is shutting down
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecycleReason {
    MaxJobs,
    ResourceCeiling,
    Fault,
}

impl RecycleReason {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::MaxJobs => "max_jobs",
            Self::ResourceCeiling => "resource_ceiling",
            Self::Fault => "fault",
        }
    }
}
