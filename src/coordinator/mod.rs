//! Service facade
//!
//! `Coordinator` wires the scheduler, broadcaster, rate limiter and worker pool
//! together and exposes the operations a gateway needs: submit, join, leave,
//! cancel and the read-only queries. It also runs the retention task that purges
//! finished jobs.

use crate::broadcast::{Broadcaster, Subscription};
use crate::config::{self, Config};
use crate::fetch::FetcherFactory;
use crate::job::{Job, JobId, SubmitReceipt, SubmitRequest};
use crate::limiter::{DomainRateLimiter, DomainStats};
use crate::retry::RetryPolicy;
use crate::scheduler::{CancelOutcome, Scheduler, SchedulerStats};
use crate::storage::ResultSink;
use crate::worker::{JobRunner, WorkerInfo, WorkerPool};
use crate::Result;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Entry point to the orchestration core
pub struct Coordinator {
    config: Arc<Config>,
    scheduler: Arc<Scheduler>,
    broadcaster: Arc<Broadcaster>,
    limiter: Arc<DomainRateLimiter>,
    pool: WorkerPool,
    stop: CancellationToken,
    purge_task: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    /// Validates the configuration and starts the worker pool
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Arguments
    ///
    /// * `config` - The relay configuration
    /// * `factory` - Creates one page fetcher per worker
    /// * `sink` - Receives every scraped page and finished job
    pub fn start(
        config: Config,
        factory: Arc<dyn FetcherFactory>,
        sink: Arc<dyn ResultSink>,
    ) -> Result<Self> {
        config::validate(&config)?;
        let config = Arc::new(config);

        let broadcaster = Arc::new(Broadcaster::new(config.broadcast.buffer_capacity));
        let scheduler = Arc::new(Scheduler::new(
            config.scheduler.clone(),
            config.quota.clone(),
            Arc::clone(&broadcaster),
        ));
        let limiter = Arc::new(DomainRateLimiter::new(config.rate_limit.clone()));
        let runner = JobRunner::new(
            Arc::clone(&scheduler),
            Arc::clone(&limiter),
            RetryPolicy::new(config.retry.clone()),
            sink,
        );
        let pool = WorkerPool::start(config.workers.clone(), runner, factory);

        let stop = CancellationToken::new();
        let purge_task = tokio::spawn(purge_loop(
            Arc::clone(&scheduler),
            config.scheduler.purge_interval(),
            stop.clone(),
        ));

        info!(
            min_workers = config.workers.min_workers,
            max_workers = config.workers.max_workers,
            admission_threshold = config.scheduler.admission_threshold,
            "Coordinator started"
        );

        Ok(Self {
            config,
            scheduler,
            broadcaster,
            limiter,
            pool,
            stop,
            purge_task: Mutex::new(Some(purge_task)),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Submits a scraping job, or attaches to an identical one already in flight
    pub fn submit(&self, request: SubmitRequest) -> Result<SubmitReceipt> {
        self.scheduler.submit(request)
    }

    /// Subscribes an observer to a job's progress
    pub fn join(&self, job_id: JobId, observer_id: &str) -> Result<Subscription> {
        self.broadcaster.join(job_id, observer_id)
    }

    /// Unsubscribes an observer from one job
    pub fn leave(&self, job_id: JobId, observer_id: &str) -> bool {
        self.broadcaster.leave(job_id, observer_id)
    }

    /// Unsubscribes an observer from every job, returning how many it left
    pub fn disconnect(&self, observer_id: &str) -> usize {
        self.broadcaster.disconnect(observer_id)
    }

    pub fn cancel(&self, job_id: JobId) -> Result<CancelOutcome> {
        self.scheduler.cancel(job_id)
    }

    pub fn status(&self, job_id: JobId) -> Option<Job> {
        self.scheduler.status(job_id)
    }

    /// Jobs a tenant submitted or attached to, oldest first
    pub fn jobs_for_tenant(&self, tenant_id: &str) -> Vec<Job> {
        self.scheduler.jobs_for_tenant(tenant_id)
    }

    pub fn stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    pub fn workers(&self) -> Vec<WorkerInfo> {
        self.pool.workers()
    }

    /// Number of workers replaced so far
    pub fn recycled_workers(&self) -> u64 {
        self.pool.recycled_count()
    }

    pub fn domain_stats(&self) -> Vec<DomainStats> {
        self.limiter.stats()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.scheduler.is_shutting_down()
    }

    /// Purges finished jobs past their retention window right away
    pub fn purge_expired(&self) -> Vec<JobId> {
        self.scheduler.purge_expired(Instant::now())
    }

    /// Stops accepting work, cancels outstanding jobs and waits for the workers
    pub async fn shutdown(&self) {
        info!("Shutting down coordinator");
        self.stop.cancel();
        self.scheduler.shutdown();
        self.pool.shutdown().await;

        let purge_task = self
            .purge_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = purge_task {
            if let Err(e) = handle.await {
                warn!(error = %e, "Retention task ended abnormally");
            }
        }

        let stats = self.scheduler.stats();
        info!(
            completed = stats.completed,
            failed = stats.failed,
            cancelled = stats.cancelled,
            "Coordinator stopped"
        );
    }
}

/// Periodically forgets finished jobs past the retention window
async fn purge_loop(
    scheduler: Arc<Scheduler>,
    interval: std::time::Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let purged = scheduler.purge_expired(Instant::now());
        if !purged.is_empty() {
            debug!(count = purged.len(), "Retention pass purged jobs");
        }
    }
}
