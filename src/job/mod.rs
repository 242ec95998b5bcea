//! Job model
//!
//! A job is one tenant request to scrape an ordered set of URLs with a given
//! `ScrapeConfig`. Jobs are identified by a random `JobId` and deduplicated by a
//! `DedupKey` derived from their normalized URLs and settings.

mod dedup;
mod types;

pub use dedup::{compute_dedup_key, DedupKey};
pub use types::{
    ErrorKind, Job, JobError, JobId, PriorityTier, ScrapeConfig, ScrapeMode, SubmitReceipt,
    SubmitRequest, UrlProgress,
};
