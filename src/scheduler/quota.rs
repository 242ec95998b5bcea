//! Per-tenant sliding-window page quotas
//!
//! Each tier may carry a quota of `pages` per `window`. A submission of N URLs
//! counts N pages against the submitting tenant. Tiers without a configured
//! quota are unlimited.

use crate::config::TierQuota;
use crate::job::PriorityTier;
use crate::RelayError;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Default)]
pub struct QuotaTracker {
    limits: BTreeMap<PriorityTier, TierQuota>,
    /// Charged submissions per tenant, oldest first
    usage: HashMap<String, VecDeque<(Instant, u32)>>,
}

impl QuotaTracker {
    pub fn new(limits: BTreeMap<PriorityTier, TierQuota>) -> Self {
        Self {
            limits,
            usage: HashMap::new(),
        }
    }

    /// Checks whether `tenant` may submit `pages` more pages on `tier`
    pub fn check(
        &mut self,
        tenant: &str,
        tier: PriorityTier,
        pages: u32,
        now: Instant,
    ) -> Result<(), RelayError> {
        let Some(limit) = self.limits.get(&tier) else {
            return Ok(());
        };
        let window = limit.window();

        let entries = self.usage.entry(tenant.to_string()).or_default();
        expire(entries, window, now);

        let used: u32 = entries.iter().map(|(_, pages)| pages).sum();
        if used.saturating_add(pages) > limit.pages {
            let reset_in = entries
                .front()
                .map(|(at, _)| (*at + window).saturating_duration_since(now))
                .unwrap_or(window);
            return Err(RelayError::QuotaExceeded {
                tenant: tenant.to_string(),
                tier,
                limit: limit.pages,
                reset_in,
            });
        }

        Ok(())
    }

    /// Records `pages` against `tenant`; only tiers with a quota are tracked
    pub fn charge(&mut self, tenant: &str, tier: PriorityTier, pages: u32, now: Instant) {
        if self.limits.contains_key(&tier) {
            self.usage
                .entry(tenant.to_string())
                .or_default()
                .push_back((now, pages));
        }
    }

    /// Pages `tenant` has used inside the window of `tier`
    pub fn used(&mut self, tenant: &str, tier: PriorityTier, now: Instant) -> u32 {
        let Some(limit) = self.limits.get(&tier) else {
            return 0;
        };
        let window = limit.window();
        self.usage.get_mut(tenant).map_or(0, |entries| {
            expire(entries, window, now);
            entries.iter().map(|(_, pages)| pages).sum()
        })
    }
}

fn expire(entries: &mut VecDeque<(Instant, u32)>, window: Duration, now: Instant) {
    while let Some((at, _)) = entries.front() {
        if now.saturating_duration_since(*at) >= window {
            entries.pop_front();
        } else {
            break;
        }
    }
}
