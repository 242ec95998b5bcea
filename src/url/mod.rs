//! URL handling module for Scrape-Relay
//!
//! This module provides URL normalization and domain extraction. Normalized URLs
//! feed the dedup key of a job; extracted domains key the per-domain rate limiter.

mod domain;
mod normalize;

// Re-export main functions
pub use domain::{domain_of, extract_domain};
pub use normalize::{normalize_url, normalize_url_set};
