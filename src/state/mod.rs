//! State module for tracking job and domain progress
//!
//! # Components
//!
//! - `JobStatus`: Lifecycle of a scraping job (pending, queued, running, ...)
//! - `UrlState`: Progress of one URL inside a job
//! - `DomainState`: Per-domain spacing state owned by the rate limiter

mod domain_state;
mod job_state;

// Re-export main types
pub use domain_state::DomainState;
pub use job_state::{JobStatus, UrlState};
