//! Admission control
//!
//! New submissions are refused while the global queue depth is at or above the
//! admission threshold. If the overload lasts a whole window, the lowest tier
//! that still accepts work is switched off, then the next one a window later,
//! and so on. The highest tier is never switched off. Every tier comes back once
//! the depth drops below the recovery depth.

use crate::config::SchedulerConfig;
use crate::job::PriorityTier;
use crate::RelayError;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug)]
pub struct AdmissionController {
    threshold: usize,
    recovery_depth: usize,
    overload_window: Duration,
    /// Start of the current overload window
    overload_since: Option<Instant>,
    disabled: BTreeSet<PriorityTier>,
}

impl AdmissionController {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            threshold: config.admission_threshold,
            recovery_depth: config.recovery_depth,
            overload_window: config.overload_window(),
            overload_since: None,
            disabled: BTreeSet::new(),
        }
    }

    /// Decides whether a submission to `tier` may enter a queue of `depth` jobs
    pub fn check(
        &mut self,
        tier: PriorityTier,
        depth: usize,
        now: Instant,
    ) -> Result<(), RelayError> {
        self.observe(depth, now);

        if self.disabled.contains(&tier) {
            return Err(RelayError::TierDisabled { tier });
        }

        if depth >= self.threshold {
            return Err(RelayError::Overload {
                depth,
                threshold: self.threshold,
            });
        }

        Ok(())
    }

    /// Updates the overload tracking with the current queue depth
    pub fn observe(&mut self, depth: usize, now: Instant) {
        if depth < self.recovery_depth {
            if !self.disabled.is_empty() {
                info!(depth, "Queue recovered, re-enabling all tiers");
                self.disabled.clear();
            }
            self.overload_since = None;
            return;
        }

        if depth < self.threshold {
            self.overload_since = None;
            return;
        }

        match self.overload_since {
            None => self.overload_since = Some(now),
            Some(since) if now.saturating_duration_since(since) >= self.overload_window => {
                self.disable_lowest(depth);
                self.overload_since = Some(now);
            }
            Some(_) => {}
        }
    }

    fn disable_lowest(&mut self, depth: usize) {
        let next = PriorityTier::all()
            .into_iter()
            .filter(|tier| *tier != PriorityTier::Enterprise)
            .find(|tier| !self.disabled.contains(tier));

        if let Some(tier) = next {
            warn!(tier = %tier, depth, "Sustained overload, disabling tier");
            self.disabled.insert(tier);
        }
    }

    pub fn is_disabled(&self, tier: PriorityTier) -> bool {
        self.disabled.contains(&tier)
    }

    /// Currently disabled tiers, lowest first
    pub fn disabled_tiers(&self) -> Vec<PriorityTier> {
        self.disabled.iter().copied().collect()
    }
}
