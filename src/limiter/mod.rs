//! Per-domain rate limiting
//!
//! One `DomainRateLimiter` is shared by every worker. Each domain gets a
//! `DomainState`; `acquire` reserves the domain's next free request slot under the
//! lock and then sleeps until that slot outside of it, so the configured spacing
//! holds no matter how many workers target the same domain at once.

use crate::config::RateLimitConfig;
use crate::state::DomainState;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Result of waiting for a domain slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// The slot has started; the request may be sent
    Ready,
    /// The wait was cancelled before the slot started
    Cancelled,
}

/// Snapshot of one domain's limiter state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainStats {
    pub domain: String,
    pub request_count: u64,
    pub rate_limit_hits: u32,
    pub spacing: Duration,
    pub penalized: bool,
}

/// Shared per-domain request spacing
pub struct DomainRateLimiter {
    config: RateLimitConfig,
    domains: Mutex<HashMap<String, DomainState>>,
}

impl DomainRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            domains: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, DomainState>> {
        self.domains.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reserves the next request slot for `domain` and returns when it starts
    pub fn reserve(&self, domain: &str) -> Instant {
        let now = Instant::now();
        let mut domains = self.lock();
        let state = domains
            .entry(domain.to_string())
            .or_insert_with(|| DomainState::new(&self.config));
        state.reserve(&self.config, now)
    }

    /// Waits until a request to `domain` may be sent
    pub async fn acquire(&self, domain: &str) {
        let slot = self.reserve(domain);
        let wait = slot.saturating_duration_since(Instant::now());
        if !wait.is_zero() {
            debug!(
                domain = %domain,
                wait_ms = wait.as_millis() as u64,
                "Waiting for domain slot"
            );
            tokio::time::sleep_until(slot).await;
        }
    }

    /// Waits until a request to `domain` may be sent, unless `cancel` fires first
    ///
    /// A cancelled wait keeps its reservation; the unused slot only delays later
    /// requests to the same domain by one spacing.
    pub async fn acquire_or_cancel(&self, domain: &str, cancel: &CancellationToken) -> Acquire {
        if cancel.is_cancelled() {
            return Acquire::Cancelled;
        }

        tokio::select! {
            _ = cancel.cancelled() => Acquire::Cancelled,
            _ = self.acquire(domain) => {
                if cancel.is_cancelled() {
                    Acquire::Cancelled
                } else {
                    Acquire::Ready
                }
            }
        }
    }

    /// Tightens the spacing of a domain that answered with a rate-limit response
    pub fn penalize(&self, domain: &str) {
        let now = Instant::now();
        let mut domains = self.lock();
        let state = domains
            .entry(domain.to_string())
            .or_insert_with(|| DomainState::new(&self.config));
        state.mark_rate_limited(&self.config, now);

        info!(
            domain = %domain,
            spacing_ms = state.spacing.as_millis() as u64,
            hits = state.rate_limit_hits,
            "Domain rate limited, spacing tightened"
        );
    }

    /// Spacing currently enforced for `domain`
    pub fn spacing(&self, domain: &str) -> Duration {
        let now = Instant::now();
        self.lock()
            .get(domain)
            .map(|state| state.effective_spacing(&self.config, now))
            .unwrap_or_else(|| self.config.min_spacing())
    }

    /// Snapshot of every domain seen so far, sorted by name
    pub fn stats(&self) -> Vec<DomainStats> {
        let now = Instant::now();
        let mut stats: Vec<DomainStats> = self
            .lock()
            .iter()
            .map(|(domain, state)| DomainStats {
                domain: domain.clone(),
                request_count: state.request_count,
                rate_limit_hits: state.rate_limit_hits,
                spacing: state.effective_spacing(&self.config, now),
                penalized: state.is_penalized(now),
            })
            .collect();
        stats.sort_by(|a, b| a.domain.cmp(&b.domain));
        stats
    }
}
