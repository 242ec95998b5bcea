//! Tiered job queue
//!
//! One FIFO queue per priority tier. Tiers are served by smooth weighted
//! round-robin: on every pop each non-empty tier adds its effective weight to its
//! running credit, the tier with the most credit is served and pays back the sum
//! of all weights. A tier's effective weight is its configured weight plus an
//! aging boost that grows with the time its head job has been waiting, so a
//! low tier is never starved by a steady stream of higher-tier work.

use crate::config::TierWeights;
use crate::job::{JobId, PriorityTier};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

const TIERS: usize = 4;

#[derive(Debug, Clone, Copy)]
struct QueuedJob {
    id: JobId,
    enqueued_at: Instant,
}

#[derive(Debug)]
pub struct TieredQueue {
    tiers: [VecDeque<QueuedJob>; TIERS],
    credit: [i64; TIERS],
    weights: TierWeights,
    aging_interval: Duration,
    max_aging_boost: u32,
}

impl TieredQueue {
    pub fn new(weights: TierWeights, aging_interval: Duration, max_aging_boost: u32) -> Self {
        Self {
            tiers: Default::default(),
            credit: [0; TIERS],
            weights,
            aging_interval,
            max_aging_boost,
        }
    }

    /// Appends a job to the back of its tier
    pub fn push(&mut self, tier: PriorityTier, id: JobId, now: Instant) {
        self.tiers[tier.index()].push_back(QueuedJob {
            id,
            enqueued_at: now,
        });
    }

    /// Removes a queued job wherever it is; returns false if it was not queued
    pub fn remove(&mut self, id: JobId) -> bool {
        for queue in self.tiers.iter_mut() {
            if let Some(pos) = queue.iter().position(|q| q.id == id) {
                queue.remove(pos);
                return true;
            }
        }
        false
    }

    /// Pops the next job to run
    pub fn pop(&mut self, now: Instant) -> Option<(PriorityTier, JobId)> {
        let mut total: i64 = 0;
        let mut best: Option<PriorityTier> = None;

        // Ascending order with >= lets the higher tier win ties
        for tier in PriorityTier::all() {
            let i = tier.index();
            if self.tiers[i].is_empty() {
                self.credit[i] = 0;
                continue;
            }

            let weight = i64::from(self.effective_weight(tier, now));
            self.credit[i] += weight;
            total += weight;

            if best.map_or(true, |b| self.credit[i] >= self.credit[b.index()]) {
                best = Some(tier);
            }
        }

        let tier = best?;
        self.credit[tier.index()] -= total;
        self.tiers[tier.index()]
            .pop_front()
            .map(|queued| (tier, queued.id))
    }

    /// Configured weight plus the aging boost earned by the tier's head job
    pub fn effective_weight(&self, tier: PriorityTier, now: Instant) -> u32 {
        let base = self.weights.weight(tier);
        let Some(head) = self.tiers[tier.index()].front() else {
            return base;
        };

        if self.aging_interval.is_zero() {
            return base;
        }

        let waited = now.saturating_duration_since(head.enqueued_at);
        let boost = (waited.as_millis() / self.aging_interval.as_millis()) as u64;
        base + boost.min(u64::from(self.max_aging_boost)) as u32
    }

    /// Total number of queued jobs
    pub fn len(&self) -> usize {
        self.tiers.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.iter().all(VecDeque::is_empty)
    }

    /// Number of queued jobs in one tier
    pub fn depth(&self, tier: PriorityTier) -> usize {
        self.tiers[tier.index()].len()
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.tiers.iter().any(|q| q.iter().any(|queued| queued.id == id))
    }
}
