//! Retry and backoff classification
//!
//! Every failed fetch is classified into a `FailureClass`, and the class decides
//! whether the URL is tried again and after how long:
//!
//! | Failure | Class | Retries |
//! |---------|-------|---------|
//! | Network error, timeout, HTTP 408, HTTP 5xx (not 503) | Transient | `transient_max_retries` |
//! | HTTP 429, HTTP 503, blocked by bot protection | RateLimit | `rate_limit_max_retries` |
//! | HTTP 404/410, other 4xx, unparsable or invalid response | Permanent | none |
//!
//! Retries are counted after the first attempt and per class, so a URL is
//! fetched at most `1 + max_retries` times for any one kind of failure. The
//! counts live in the job's per-URL progress and survive a re-dispatch.

use crate::config::RetryConfig;
use crate::fetch::{FetchError, FetchErrorKind};
use crate::job::ErrorKind;
use rand::Rng;
use std::time::Duration;

/// How a failed fetch should be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    Transient,
    RateLimit,
    Permanent,
}

impl FailureClass {
    /// Classifies a fetch error
    pub fn classify(error: &FetchError) -> Self {
        match error.kind {
            FetchErrorKind::Network | FetchErrorKind::Timeout => Self::Transient,
            FetchErrorKind::Blocked => Self::RateLimit,
            FetchErrorKind::Unparsable | FetchErrorKind::Invalid => Self::Permanent,
            FetchErrorKind::Http => match error.status {
                Some(429) | Some(503) => Self::RateLimit,
                Some(408) => Self::Transient,
                Some(status) if (500..600).contains(&status) => Self::Transient,
                Some(_) => Self::Permanent,
                None => Self::Transient,
            },
        }
    }

    /// Kind recorded in the job's error log for a URL that failed with this class
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            Self::Transient => ErrorKind::TransientFetch,
            Self::RateLimit => ErrorKind::RateLimit,
            Self::Permanent => ErrorKind::PermanentFetch,
        }
    }
}

/// Retries already made for one URL, per failure class
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryCounts {
    pub transient: u32,
    pub rate_limit: u32,
}

impl RetryCounts {
    pub fn get(&self, class: FailureClass) -> u32 {
        match class {
            FailureClass::Transient => self.transient,
            FailureClass::RateLimit => self.rate_limit,
            FailureClass::Permanent => 0,
        }
    }

    /// Counts one more retry of `class`
    pub fn record(&mut self, class: FailureClass) {
        match class {
            FailureClass::Transient => self.transient += 1,
            FailureClass::RateLimit => self.rate_limit += 1,
            FailureClass::Permanent => {}
        }
    }

    pub fn total(&self) -> u32 {
        self.transient + self.rate_limit
    }
}

/// Outcome of consulting the retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after `delay`
    Retry { class: FailureClass, delay: Duration },
    /// Record the URL as failed
    GiveUp { class: FailureClass },
}

impl RetryDecision {
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Retry { class, .. } | Self::GiveUp { class } => *class,
        }
    }
}

/// Decides retries and backoff delays from the retry configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Retries allowed after the first attempt
    pub fn max_retries(&self, class: FailureClass) -> u32 {
        match class {
            FailureClass::Transient => self.config.transient_max_retries,
            FailureClass::RateLimit => self.config.rate_limit_max_retries,
            FailureClass::Permanent => 0,
        }
    }

    /// Backoff before retry number `retry` (1-based), without jitter
    ///
    /// `base * 2^(retry - 1)`, capped at the configured maximum delay.
    pub fn backoff(&self, class: FailureClass, retry: u32) -> Duration {
        let base_ms = match class {
            FailureClass::Transient => self.config.base_delay_ms,
            FailureClass::RateLimit => self.config.rate_limit_base_delay_ms,
            FailureClass::Permanent => return Duration::ZERO,
        };

        let exponent = retry.saturating_sub(1).min(31);
        let delay_ms = base_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay_ms.min(self.config.max_delay_ms))
    }

    /// Decides what to do after a failed fetch
    ///
    /// `retries` holds the retries already made for the URL; only the count of
    /// the error's own class is checked against that class's budget.
    ///
    /// # Returns
    ///
    /// * `RetryDecision::Retry` - with the delay to wait, never above `max_delay_ms`
    ///   even when the server asked for a longer `Retry-After`
    /// * `RetryDecision::GiveUp` - the class never retries or its budget is spent
    pub fn decide(&self, error: &FetchError, retries: &RetryCounts) -> RetryDecision {
        let class = FailureClass::classify(error);
        let retries_so_far = retries.get(class);

        if retries_so_far >= self.max_retries(class) {
            return RetryDecision::GiveUp { class };
        }

        let mut delay = self.apply_jitter(self.backoff(class, retries_so_far + 1));
        if class == FailureClass::RateLimit {
            if let Some(retry_after) = error.retry_after {
                delay = delay.max(retry_after);
            }
        }
        let delay = delay.min(self.max_delay());

        RetryDecision::Retry { class, delay }
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.config.max_delay_ms)
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        let jitter = self.config.jitter;
        if jitter <= 0.0 || delay.is_zero() {
            return delay;
        }

        let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
        delay.mul_f64(factor.max(0.0))
    }
}
