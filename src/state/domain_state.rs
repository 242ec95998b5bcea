use crate::config::RateLimitConfig;
use std::time::Duration;
use tokio::time::Instant;

/// Tracks the politeness state of one target domain
///
/// Spacing is enforced by handing out request slots: every granted request
/// reserves the next free slot, so concurrent callers queue up behind each other
/// instead of all observing the same "last request" time.
#[derive(Debug, Clone)]
pub struct DomainState {
    /// Number of requests granted to this domain
    pub request_count: u64,

    /// Slot of the most recently granted request
    pub last_request_time: Option<Instant>,

    /// Spacing currently in force (tightened after rate-limit responses)
    pub spacing: Duration,

    /// Until when the tightened spacing applies
    pub penalized_until: Option<Instant>,

    /// Number of rate-limit responses seen from this domain
    pub rate_limit_hits: u32,
}

impl DomainState {
    /// Creates a new DomainState using the configured base spacing
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            request_count: 0,
            last_request_time: None,
            spacing: config.min_spacing(),
            penalized_until: None,
            rate_limit_hits: 0,
        }
    }

    /// Returns the spacing that applies at `now`
    pub fn effective_spacing(&self, config: &RateLimitConfig, now: Instant) -> Duration {
        match self.penalized_until {
            Some(until) if now < until => self.spacing,
            _ => config.min_spacing(),
        }
    }

    /// Reserves the next request slot and returns when it starts
    pub fn reserve(&mut self, config: &RateLimitConfig, now: Instant) -> Instant {
        if matches!(self.penalized_until, Some(until) if now >= until) {
            self.clear_rate_limit(config);
        }

        let slot = match self.last_request_time {
            Some(last) => std::cmp::max(now, last + self.effective_spacing(config, now)),
            None => now,
        };

        self.request_count += 1;
        self.last_request_time = Some(slot);
        slot
    }

    /// Tightens the spacing after the domain answered with a rate-limit response
    pub fn mark_rate_limited(&mut self, config: &RateLimitConfig, now: Instant) {
        let current = self.effective_spacing(config, now).max(config.min_spacing());
        let tightened = current.mul_f64(config.penalty_factor);

        self.spacing = tightened.min(config.max_spacing());
        self.penalized_until = Some(now + config.penalty_cooldown());
        self.rate_limit_hits += 1;
    }

    /// Restores the configured base spacing
    pub fn clear_rate_limit(&mut self, config: &RateLimitConfig) {
        self.spacing = config.min_spacing();
        self.penalized_until = None;
    }

    /// Returns true while a rate-limit penalty is in force
    pub fn is_penalized(&self, now: Instant) -> bool {
        matches!(self.penalized_until, Some(until) if now < until)
    }
}
