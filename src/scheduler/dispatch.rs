//! The priority scheduler
//!
//! `Scheduler` owns the tiered queue, admission control, tenant quotas and the job
//! registry behind one lock. Submissions enter through `submit`, free workers
//! pull work through `next_assignment`, and the worker that owns a job drives it
//! to completion through `report`, `finish` and `fault`. Every state change is
//! published to the job's broadcast topic while the lock is held, so observers
//! see changes in the order they happened.
//!
//! Lock order: scheduler state, then broadcaster.

use super::admission::AdmissionController;
use super::queue::TieredQueue;
use super::quota::QuotaTracker;
use super::registry::JobRegistry;
use crate::broadcast::{Broadcaster, JobEvent};
use crate::config::{SchedulerConfig, TierQuota};
use crate::job::{
    compute_dedup_key, ErrorKind, Job, JobError, JobId, PriorityTier, SubmitReceipt,
    SubmitRequest,
};
use crate::retry::FailureClass;
use crate::state::{JobStatus, UrlState};
use crate::url::normalize_url_set;
use crate::worker::WorkerId;
use crate::{RelayError, Result};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A job handed to a worker
///
/// The worker owns this copy for the duration of the run; the scheduler's copy
/// is only updated through reports.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub job: Job,
    /// Triggered when the job is cancelled or times out
    pub cancel: CancellationToken,
}

/// Result of a cancellation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job had not started and is now cancelled
    Cancelled,
    /// The job is running; its worker will stop at the next URL boundary
    Requested,
    /// The job had already finished
    AlreadyFinished(JobStatus),
}

/// Per-URL progress reported by the worker running a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerReport {
    /// A fetch attempt for `url` is starting
    UrlStarted { url: String, attempt: u32 },
    UrlSucceeded { url: String },
    /// The attempt failed with an error of `class` and another one is
    /// scheduled after `delay`
    UrlRetrying {
        url: String,
        class: FailureClass,
        error: String,
        delay: Duration,
    },
    /// The URL failed for good
    UrlFailed {
        url: String,
        kind: ErrorKind,
        error: String,
    },
}

/// How a worker ended a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// At least one URL succeeded
    Completed,
    /// Every URL failed
    Failed,
    /// The worker stopped because the job's token was cancelled
    Cancelled,
}

impl JobOutcome {
    fn status(&self) -> JobStatus {
        match self {
            Self::Completed => JobStatus::Completed,
            Self::Failed => JobStatus::Failed,
            Self::Cancelled => JobStatus::Cancelled,
        }
    }
}

/// Point-in-time scheduler counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerStats {
    pub queue_depth: usize,
    pub queued_by_tier: BTreeMap<PriorityTier, usize>,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub disabled_tiers: Vec<PriorityTier>,
    pub known_jobs: usize,
}

struct SchedulerState {
    queue: TieredQueue,
    admission: AdmissionController,
    quota: QuotaTracker,
    registry: JobRegistry,
    /// Cancellation tokens of running jobs
    tokens: HashMap<JobId, CancellationToken>,
    shutting_down: bool,
}

/// Priority scheduler with dedup, admission control and tenant quotas
pub struct Scheduler {
    config: SchedulerConfig,
    broadcaster: Arc<Broadcaster>,
    state: Mutex<SchedulerState>,
    work_available: Notify,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        quotas: BTreeMap<PriorityTier, TierQuota>,
        broadcaster: Arc<Broadcaster>,
    ) -> Self {
        let state = SchedulerState {
            queue: TieredQueue::new(
                config.tier_weights,
                config.aging_interval(),
                config.max_aging_boost,
            ),
            admission: AdmissionController::new(&config),
            quota: QuotaTracker::new(quotas),
            registry: JobRegistry::new(),
            tokens: HashMap::new(),
            shutting_down: false,
        };

        Self {
            config,
            broadcaster,
            state: Mutex::new(state),
            work_available: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    /// Submits a job
    ///
    /// Checks run in order: validation, dedup, tenant quota, admission. A
    /// submission identical to a live job attaches to it and is never rejected
    /// by quota or admission.
    pub fn submit(&self, request: SubmitRequest) -> Result<SubmitReceipt> {
        let SubmitRequest {
            tenant_id,
            urls,
            config,
            tier,
        } = request;

        let tenant_id = tenant_id.trim().to_string();
        if tenant_id.is_empty() {
            return Err(RelayError::Validation("tenant_id must not be empty".into()));
        }
        if urls.is_empty() {
            return Err(RelayError::Validation("at least one URL is required".into()));
        }
        if urls.len() > self.config.max_urls_per_job {
            return Err(RelayError::Validation(format!(
                "at most {} URLs per job, got {}",
                self.config.max_urls_per_job,
                urls.len()
            )));
        }
        let urls = normalize_url_set(&urls)
            .map_err(|e| RelayError::Validation(format!("invalid URL: {}", e)))?;
        config.validate().map_err(RelayError::Validation)?;

        let key = compute_dedup_key(&urls, &config);
        let now = Instant::now();
        let mut state = self.lock();

        if state.shutting_down {
            return Err(RelayError::ShuttingDown);
        }

        if let Some(existing) = state.registry.live_job_for(&key) {
            if let Some(job) = state.registry.get_mut(existing) {
                if !job.submitters.contains(&tenant_id) {
                    job.submitters.push(tenant_id.clone());
                }
            }
            info!(
                job_id = %existing,
                tenant = %tenant_id,
                "Attached to identical in-flight job"
            );
            return Ok(SubmitReceipt {
                job_id: existing,
                attached: true,
            });
        }

        let pages = urls.len() as u32;
        state.quota.check(&tenant_id, tier, pages, now)?;
        let depth = state.queue.len();
        state.admission.check(tier, depth, now)?;
        state.quota.charge(&tenant_id, tier, pages, now);

        let mut job = Job::new(tenant_id, tier, key, &urls, config);
        let job_id = job.id;
        self.broadcaster.open(job_id, job.total_pages());

        transition(&mut job, JobStatus::Queued)?;
        state.queue.push(tier, job_id, now);
        self.broadcaster.publish(JobEvent::progress(&job, None));

        info!(
            job_id = %job_id,
            tenant = %job.tenant_id,
            tier = %tier,
            urls = job.total_pages(),
            "Job queued"
        );
        state.registry.insert(job);
        drop(state);

        self.work_available.notify_one();
        Ok(SubmitReceipt {
            job_id,
            attached: false,
        })
    }

    /// Waits for the next job to run
    ///
    /// Returns None once the scheduler is shutting down. Dropping the returned
    /// future before it resolves never loses a job.
    pub async fn next_assignment(self: &Arc<Self>, worker_id: WorkerId) -> Option<Assignment> {
        loop {
            let notified = self.work_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }

                if let Some(assignment) = self.dispatch(&mut state, worker_id) {
                    let more = !state.queue.is_empty();
                    drop(state);

                    if more {
                        self.work_available.notify_one();
                    }
                    if let Some(timeout) = self.config.job_timeout() {
                        self.arm_timeout(assignment.job.id, assignment.cancel.clone(), timeout);
                    }
                    return Some(assignment);
                }
            }

            notified.await;
        }
    }

    fn dispatch(&self, state: &mut SchedulerState, worker_id: WorkerId) -> Option<Assignment> {
        let now = Instant::now();

        while let Some((tier, job_id)) = state.queue.pop(now) {
            let Some(job) = state.registry.get_mut(job_id) else {
                warn!(job_id = %job_id, "Queued job missing from registry");
                continue;
            };

            if transition(job, JobStatus::Running).is_err() {
                continue;
            }
            if job.started_at.is_none() {
                job.started_at = Some(Utc::now());
            }
            job.worker_id = Some(worker_id);

            let cancel = CancellationToken::new();
            state.tokens.insert(job_id, cancel.clone());
            self.broadcaster.publish(JobEvent::progress(job, None));

            debug!(job_id = %job_id, tier = %tier, worker = %worker_id, "Job dispatched");
            let assignment = Assignment {
                job: job.clone(),
                cancel,
            };

            let depth = state.queue.len();
            state.admission.observe(depth, now);
            return Some(assignment);
        }

        None
    }

    fn arm_timeout(
        self: &Arc<Self>,
        job_id: JobId,
        cancel: CancellationToken,
        timeout: Duration,
    ) {
        let scheduler: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    if let Some(scheduler) = scheduler.upgrade() {
                        scheduler.expire(job_id, &cancel, timeout);
                    }
                }
            }
        });
    }

    /// Cancels a running job that exceeded its time limit
    fn expire(&self, job_id: JobId, cancel: &CancellationToken, timeout: Duration) {
        let mut state = self.lock();
        let still_current = state
            .tokens
            .get(&job_id)
            .is_some_and(|token| !token.is_cancelled());
        if !still_current {
            return;
        }

        if let Some(job) = state.registry.get_mut(job_id) {
            warn!(job_id = %job_id, timeout_secs = timeout.as_secs(), "Job timed out");
            job.errors.push(JobError::for_job(
                ErrorKind::Cancellation,
                format!("Job timed out after {}s", timeout.as_secs()),
            ));
        }
        cancel.cancel();
    }

    /// Applies a worker's progress report to the registry and publishes it
    pub fn report(&self, job_id: JobId, report: WorkerReport) -> Result<()> {
        let mut state = self.lock();
        let job = state
            .registry
            .get_mut(job_id)
            .ok_or(RelayError::JobNotFound(job_id))?;

        if job.status != JobStatus::Running {
            debug!(
                job_id = %job_id,
                status = %job.status,
                "Ignoring report for job that is not running"
            );
            return Ok(());
        }

        match report {
            WorkerReport::UrlStarted { url, attempt } => {
                if let Some(progress) = job.url_progress_mut(&url) {
                    progress.attempts = attempt;
                }
                self.broadcaster.publish(JobEvent::progress(job, Some(url)));
            }
            WorkerReport::UrlSucceeded { url } => {
                if let Some(progress) = job.url_progress_mut(&url) {
                    progress.state = UrlState::Done;
                    progress.last_error = None;
                }
                job.refresh_progress();
                self.broadcaster.publish(JobEvent::progress(job, Some(url)));
            }
            WorkerReport::UrlRetrying {
                url,
                class,
                error,
                delay,
            } => {
                debug!(
                    job_id = %job_id,
                    url = %url,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "URL will be retried"
                );
                if let Some(progress) = job.url_progress_mut(&url) {
                    progress.state = UrlState::Retrying;
                    progress.retries.record(class);
                    progress.last_error = Some(error);
                }
                self.broadcaster.publish(JobEvent::progress(job, Some(url)));
            }
            WorkerReport::UrlFailed { url, kind, error } => {
                if let Some(progress) = job.url_progress_mut(&url) {
                    progress.state = UrlState::Failed;
                    progress.last_error = Some(error.clone());
                }
                let entry = JobError::for_url(url.clone(), kind, error);
                self.broadcaster
                    .publish(JobEvent::error(job_id, kind, entry.to_string()));
                job.errors.push(entry);
                job.refresh_progress();
                self.broadcaster.publish(JobEvent::progress(job, Some(url)));
            }
        }

        Ok(())
    }

    /// Moves a running job to its terminal state and publishes the completion
    pub fn finish(&self, job_id: JobId, outcome: JobOutcome) -> Result<()> {
        let now = Instant::now();
        let mut state = self.lock();
        let job = state
            .registry
            .get_mut(job_id)
            .ok_or(RelayError::JobNotFound(job_id))?;

        transition(job, outcome.status())?;
        job.completed_at = Some(Utc::now());
        job.refresh_progress();
        self.broadcaster.publish(JobEvent::progress(job, None));
        self.broadcaster.publish(JobEvent::complete(job));

        info!(
            job_id = %job_id,
            status = %job.status,
            scraped = job.pages_scraped(),
            failed = job.pages_failed(),
            total = job.total_pages(),
            "Job finished"
        );

        if let Some(token) = state.tokens.remove(&job_id) {
            token.cancel();
        }
        state.registry.mark_finished(job_id, now);
        Ok(())
    }

    /// Handles a job-level fault of the worker running `job_id`
    ///
    /// The first fault puts the job back in its queue with its per-URL progress
    /// kept; a recurring fault fails it. Returns the job's new status.
    pub fn fault(&self, job_id: JobId, detail: &str) -> Result<JobStatus> {
        let now = Instant::now();
        let mut guard = self.lock();
        let state = &mut *guard;
        let job = state
            .registry
            .get_mut(job_id)
            .ok_or(RelayError::JobNotFound(job_id))?;

        if job.status != JobStatus::Running {
            return Err(RelayError::InvalidTransition {
                from: job.status,
                to: JobStatus::RetryQueued,
            });
        }

        job.faults += 1;
        let token = state.tokens.remove(&job_id);
        let cancel_requested = token.as_ref().is_some_and(|t| t.is_cancelled());
        if let Some(token) = token {
            token.cancel();
        }

        let terminal = if cancel_requested {
            Some(JobStatus::Cancelled)
        } else if job.faults > self.config.max_job_faults {
            Some(JobStatus::Failed)
        } else {
            None
        };

        if let Some(status) = terminal {
            warn!(
                job_id = %job_id,
                faults = job.faults,
                detail = %detail,
                "Job fault, not retrying"
            );
            transition(job, status)?;
            let entry = JobError::for_job(ErrorKind::WorkerFault, detail);
            self.broadcaster.publish(JobEvent::error(
                job_id,
                ErrorKind::WorkerFault,
                entry.to_string(),
            ));
            job.errors.push(entry);
            job.completed_at = Some(Utc::now());
            self.broadcaster.publish(JobEvent::progress(job, None));
            self.broadcaster.publish(JobEvent::complete(job));
            state.registry.mark_finished(job_id, now);
            return Ok(status);
        }

        warn!(
            job_id = %job_id,
            faults = job.faults,
            detail = %detail,
            "Job fault, re-queueing"
        );
        transition(job, JobStatus::RetryQueued)?;
        for progress in job.per_url.iter_mut() {
            if progress.state == UrlState::Retrying {
                progress.state = UrlState::Pending;
            }
        }
        job.worker_id = None;
        self.broadcaster.publish(JobEvent::progress(job, None));

        transition(job, JobStatus::Queued)?;
        let tier = job.tier;
        state.queue.push(tier, job_id, now);
        drop(guard);

        self.work_available.notify_one();
        Ok(JobStatus::Queued)
    }

    /// Cancels a job
    pub fn cancel(&self, job_id: JobId) -> Result<CancelOutcome> {
        let now = Instant::now();
        let mut guard = self.lock();
        let state = &mut *guard;
        let job = state
            .registry
            .get_mut(job_id)
            .ok_or(RelayError::JobNotFound(job_id))?;

        if job.status.is_terminal() {
            return Ok(CancelOutcome::AlreadyFinished(job.status));
        }

        if job.status == JobStatus::Running {
            if let Some(token) = state.tokens.get(&job_id) {
                token.cancel();
            }
            info!(job_id = %job_id, "Cancellation requested for running job");
            return Ok(CancelOutcome::Requested);
        }

        state.queue.remove(job_id);
        transition(job, JobStatus::Cancelled)?;
        job.completed_at = Some(Utc::now());
        self.broadcaster.publish(JobEvent::progress(job, None));
        self.broadcaster.publish(JobEvent::complete(job));
        state.registry.mark_finished(job_id, now);

        info!(job_id = %job_id, "Job cancelled before running");
        Ok(CancelOutcome::Cancelled)
    }

    /// Copy of a job's current state
    pub fn status(&self, job_id: JobId) -> Option<Job> {
        self.lock().registry.get(job_id).cloned()
    }

    /// Jobs submitted by or attached to `tenant`, oldest first
    pub fn jobs_for_tenant(&self, tenant: &str) -> Vec<Job> {
        self.lock().registry.for_tenant(tenant)
    }

    pub fn queue_depth(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn stats(&self) -> SchedulerStats {
        let now = Instant::now();
        let mut state = self.lock();
        let depth = state.queue.len();
        state.admission.observe(depth, now);

        SchedulerStats {
            queue_depth: depth,
            queued_by_tier: PriorityTier::all()
                .into_iter()
                .map(|tier| (tier, state.queue.depth(tier)))
                .collect(),
            running: state.registry.count_with_status(JobStatus::Running),
            completed: state.registry.count_with_status(JobStatus::Completed),
            failed: state.registry.count_with_status(JobStatus::Failed),
            cancelled: state.registry.count_with_status(JobStatus::Cancelled),
            disabled_tiers: state.admission.disabled_tiers(),
            known_jobs: state.registry.len(),
        }
    }

    /// Forgets jobs that finished longer than the retention window ago
    pub fn purge_expired(&self, now: Instant) -> Vec<JobId> {
        let purged = self
            .lock()
            .registry
            .purge_expired(now, self.config.retention());
        for job_id in &purged {
            self.broadcaster.close(*job_id);
        }
        if !purged.is_empty() {
            debug!(count = purged.len(), "Purged expired jobs");
        }
        purged
    }

    /// Stops dispatching, cancels waiting jobs and signals running ones
    pub fn shutdown(&self) {
        let now = Instant::now();
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.shutting_down {
            return;
        }
        state.shutting_down = true;

        for job_id in state.registry.ids_with_status(JobStatus::Queued) {
            state.queue.remove(job_id);
            if let Some(job) = state.registry.get_mut(job_id) {
                if transition(job, JobStatus::Cancelled).is_ok() {
                    job.completed_at = Some(Utc::now());
                    self.broadcaster.publish(JobEvent::complete(job));
                }
            }
            state.registry.mark_finished(job_id, now);
        }

        for token in state.tokens.values() {
            token.cancel();
        }
        drop(guard);

        info!("Scheduler shutting down");
        self.work_available.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }
}

/// Moves a job to `next`, rejecting transitions the lifecycle does not allow
fn transition(job: &mut Job, next: JobStatus) -> Result<()> {
    if !job.status.can_transition_to(next) {
        warn!(
            job_id = %job.id,
            from = %job.status,
            to = %next,
            "Rejected invalid state transition"
        );
        return Err(RelayError::InvalidTransition {
            from: job.status,
            to: next,
        });
    }
    job.status = next;
    Ok(())
}
