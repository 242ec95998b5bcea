//! Configuration module for Scrape-Relay
//!
//! This module handles loading, parsing, and validating TOML configuration files.
//!
//! # Example
//!
//! ```no_run
//! use scrape_relay::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("relay.toml")).unwrap();
//! println!("Admission threshold: {}", config.scheduler.admission_threshold);
//! ```

mod parser;
mod types;
mod validation;

// Re-export types
pub use types::{
    BroadcastConfig, Config, FetcherConfig, OutputConfig, RateLimitConfig, RetryConfig,
    SchedulerConfig, TierQuota, TierWeights, WorkerConfig,
};

// Re-export parser functions
pub use parser::{compute_config_hash, load_config, load_config_with_hash, parse_config};
pub use validation::validate;
