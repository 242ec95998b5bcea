use crate::config::types::{
    BroadcastConfig, Config, FetcherConfig, RateLimitConfig, RetryConfig, SchedulerConfig,
    TierQuota, WorkerConfig,
};
use crate::job::PriorityTier;
use crate::ConfigError;
use std::collections::BTreeMap;
use url::Url;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_scheduler_config(&config.scheduler)?;
    validate_worker_config(&config.workers)?;
    validate_retry_config(&config.retry)?;
    validate_rate_limit_config(&config.rate_limit)?;
    validate_broadcast_config(&config.broadcast)?;
    validate_fetcher_config(&config.fetcher)?;
    validate_quotas(&config.quota)?;
    Ok(())
}

/// Validates scheduler configuration
fn validate_scheduler_config(config: &SchedulerConfig) -> Result<(), ConfigError> {
    if config.admission_threshold < 1 {
        return Err(ConfigError::Validation(
            "admission_threshold must be >= 1".to_string(),
        ));
    }

    if config.recovery_depth > config.admission_threshold {
        return Err(ConfigError::Validation(format!(
            "recovery_depth ({}) must not exceed admission_threshold ({})",
            config.recovery_depth, config.admission_threshold
        )));
    }

    if config.aging_interval_ms == 0 {
        return Err(ConfigError::Validation(
            "aging_interval_ms must be > 0".to_string(),
        ));
    }

    let weights = &config.tier_weights;
    for tier in PriorityTier::all() {
        if weights.weight(tier) == 0 {
            return Err(ConfigError::Validation(format!(
                "tier weight for {} must be >= 1",
                tier
            )));
        }
    }

    if config.max_urls_per_job < 1 {
        return Err(ConfigError::Validation(
            "max_urls_per_job must be >= 1".to_string(),
        ));
    }

    if config.job_timeout_secs == Some(0) {
        return Err(ConfigError::Validation(
            "job_timeout_secs must be > 0 when set".to_string(),
        ));
    }

    if config.purge_interval_secs == 0 {
        return Err(ConfigError::Validation(
            "purge_interval_secs must be > 0".to_string(),
        ));
    }

    Ok(())
}

/// Validates worker pool configuration
fn validate_worker_config(config: &WorkerConfig) -> Result<(), ConfigError> {
    if config.min_workers < 1 || config.max_workers > 256 {
        return Err(ConfigError::Validation(format!(
            "worker bounds must be within 1..=256, got {}..={}",
            config.min_workers, config.max_workers
        )));
    }

    if config.min_workers > config.max_workers {
        return Err(ConfigError::Validation(format!(
            "min_workers ({}) must not exceed max_workers ({})",
            config.min_workers, config.max_workers
        )));
    }

    if config.max_jobs_per_worker < 1 {
        return Err(ConfigError::Validation(
            "max_jobs_per_worker must be >= 1".to_string(),
        ));
    }

    if config.scale_check_interval_ms == 0 || config.idle_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "scale_check_interval_ms and idle_timeout_ms must be > 0".to_string(),
        ));
    }

    Ok(())
}

/// Validates retry configuration
fn validate_retry_config(config: &RetryConfig) -> Result<(), ConfigError> {
    if config.base_delay_ms > config.max_delay_ms {
        return Err(ConfigError::Validation(format!(
            "base_delay_ms ({}) must not exceed max_delay_ms ({})",
            config.base_delay_ms, config.max_delay_ms
        )));
    }

    if !(0.0..=1.0).contains(&config.jitter) {
        return Err(ConfigError::Validation(format!(
            "jitter must be between 0.0 and 1.0, got {}",
            config.jitter
        )));
    }

    if config.transient_max_retries > 10 || config.rate_limit_max_retries > 10 {
        return Err(ConfigError::Validation(
            "max retries must be <= 10".to_string(),
        ));
    }

    Ok(())
}

/// Validates per-domain rate limit configuration
fn validate_rate_limit_config(config: &RateLimitConfig) -> Result<(), ConfigError> {
    if config.max_spacing_ms < config.min_spacing_ms {
        return Err(ConfigError::Validation(format!(
            "max_spacing_ms ({}) must be >= min_spacing_ms ({})",
            config.max_spacing_ms, config.min_spacing_ms
        )));
    }

    if !config.penalty_factor.is_finite() || config.penalty_factor < 1.0 {
        return Err(ConfigError::Validation(format!(
            "penalty_factor must be >= 1.0, got {}",
            config.penalty_factor
        )));
    }

    Ok(())
}

/// Validates broadcast configuration
fn validate_broadcast_config(config: &BroadcastConfig) -> Result<(), ConfigError> {
    if config.buffer_capacity < 1 {
        return Err(ConfigError::Validation(
            "buffer_capacity must be >= 1".to_string(),
        ));
    }
    Ok(())
}

/// Validates the built-in fetcher configuration
fn validate_fetcher_config(config: &FetcherConfig) -> Result<(), ConfigError> {
    // Crawler name: non-empty, alphanumeric + hyphens only
    if config.crawler_name.is_empty() {
        return Err(ConfigError::Validation(
            "crawler_name cannot be empty".to_string(),
        ));
    }

    if !config
        .crawler_name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-')
    {
        return Err(ConfigError::Validation(format!(
            "crawler_name must contain only alphanumeric characters and hyphens, got '{}'",
            config.crawler_name
        )));
    }

    if let Some(contact) = &config.contact_url {
        Url::parse(contact)
            .map_err(|e| ConfigError::Validation(format!("Invalid contact_url: {}", e)))?;
    }

    if config.request_timeout_ms == 0 || config.connect_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "fetcher timeouts must be > 0".to_string(),
        ));
    }

    Ok(())
}

/// Validates tier quotas
fn validate_quotas(quotas: &BTreeMap<PriorityTier, TierQuota>) -> Result<(), ConfigError> {
    for (tier, quota) in quotas {
        if quota.pages == 0 || quota.window_secs == 0 {
            return Err(ConfigError::Validation(format!(
                "quota for {} must have pages >= 1 and window_secs >= 1",
                tier
            )));
        }
    }
    Ok(())
}
