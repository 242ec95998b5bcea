//! Job registry
//!
//! Owns the authoritative copy of every known job, the dedup index of live jobs
//! and the per-tenant history. Only the scheduler touches it.

use crate::job::{DedupKey, Job, JobId};
use crate::state::JobStatus;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: HashMap<JobId, Job>,
    /// Dedup key of every non-terminal job
    live_keys: HashMap<DedupKey, JobId>,
    /// When each terminal job finished
    finished_at: HashMap<JobId, Instant>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, job: Job) {
        if !job.status.is_terminal() {
            self.live_keys.insert(job.dedup_key.clone(), job.id);
        }
        self.jobs.insert(job.id, job);
    }

    pub fn get(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(&id)
    }

    pub fn get_mut(&mut self, id: JobId) -> Option<&mut Job> {
        self.jobs.get_mut(&id)
    }

    /// The live job carrying `key`, if any
    pub fn live_job_for(&self, key: &DedupKey) -> Option<JobId> {
        self.live_keys.get(key).copied()
    }

    /// Releases a finished job's dedup key and starts its retention clock
    pub fn mark_finished(&mut self, id: JobId, now: Instant) {
        if let Some(job) = self.jobs.get(&id) {
            if self.live_keys.get(&job.dedup_key) == Some(&id) {
                self.live_keys.remove(&job.dedup_key);
            }
            self.finished_at.insert(id, now);
        }
    }

    /// Removes jobs that finished at least `retention` ago
    pub fn purge_expired(&mut self, now: Instant, retention: Duration) -> Vec<JobId> {
        let expired: Vec<JobId> = self
            .finished_at
            .iter()
            .filter(|(_, at)| now.saturating_duration_since(**at) >= retention)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            self.finished_at.remove(id);
            self.jobs.remove(id);
        }
        expired
    }

    /// Jobs submitted by or attached to `tenant`, oldest first
    pub fn for_tenant(&self, tenant: &str) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .values()
            .filter(|job| job.submitters.iter().any(|s| s == tenant))
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    pub fn count_with_status(&self, status: JobStatus) -> usize {
        self.jobs.values().filter(|job| job.status == status).count()
    }

    /// Ids of every job in `status`
    pub fn ids_with_status(&self, status: JobStatus) -> Vec<JobId> {
        self.jobs
            .values()
            .filter(|job| job.status == status)
            .map(|job| job.id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
