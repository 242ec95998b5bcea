//! Worker pool and its scaler

use super::runner::JobRunner;
use super::{RecycleReason, WorkerExit, WorkerId, WorkerInfo};
use crate::config::WorkerConfig;
use crate::fetch::{FetcherFactory, PageFetcher};
use crate::job::JobId;
use crate::scheduler::Scheduler;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Bounded, self-scaling set of workers
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: WorkerConfig,
    runner: JobRunner,
    factory: Arc<dyn FetcherFactory>,
    next_id: AtomicU64,
    /// Worker loops currently alive, including ones between incarnations
    slots: AtomicUsize,
    recycled: AtomicU64,
    workers: Mutex<BTreeMap<WorkerId, WorkerInfo>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    /// Starts `min_workers` workers and the scaler
    pub fn start(
        config: WorkerConfig,
        runner: JobRunner,
        factory: Arc<dyn FetcherFactory>,
    ) -> Self {
        let min_workers = config.min_workers;
        let inner = Arc::new(PoolInner {
            config,
            runner,
            factory,
            next_id: AtomicU64::new(0),
            slots: AtomicUsize::new(0),
            recycled: AtomicU64::new(0),
            workers: Mutex::new(BTreeMap::new()),
            handles: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        });

        for _ in 0..min_workers {
            PoolInner::spawn_slot(&inner);
        }

        let scaler = tokio::spawn(scale_loop(Arc::clone(&inner)));
        inner.handles().push(scaler);

        info!(workers = min_workers, "Worker pool started");
        Self { inner }
    }

    /// Snapshot of every live worker, ordered by id
    pub fn workers(&self) -> Vec<WorkerInfo> {
        self.inner.workers().values().cloned().collect()
    }

    /// Number of worker loops alive
    pub fn size(&self) -> usize {
        self.inner.slots.load(Ordering::SeqCst)
    }

    /// Number of workers replaced so far
    pub fn recycled_count(&self) -> u64 {
        self.inner.recycled.load(Ordering::SeqCst)
    }

    /// Stops every worker and waits for them to exit
    ///
    /// Running jobs are not interrupted here; cancel them through the scheduler
    /// first for a prompt stop.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        loop {
            let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.handles());
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    warn!(error = %e, "Worker task ended abnormally");
                }
            }
        }
        info!("Worker pool stopped");
    }
}

impl PoolInner {
    fn workers(&self) -> MutexGuard<'_, BTreeMap<WorkerId, WorkerInfo>> {
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn handles(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn scheduler(&self) -> &Arc<Scheduler> {
        self.runner.scheduler()
    }

    fn spawn_slot(inner: &Arc<Self>) {
        if inner.shutdown.is_cancelled() {
            return;
        }
        inner.slots.fetch_add(1, Ordering::SeqCst);
        let handle = tokio::spawn(slot_loop(Arc::clone(inner)));
        inner.handles().push(handle);
    }

    fn register(&self, id: WorkerId) {
        self.workers().insert(
            id,
            WorkerInfo {
                id,
                jobs_processed: 0,
                assigned_job_id: None,
                started_at: Utc::now(),
            },
        );
    }

    fn unregister(&self, id: WorkerId) {
        self.workers().remove(&id);
    }

    fn set_assigned(&self, id: WorkerId, job_id: Option<JobId>) {
        if let Some(info) = self.workers().get_mut(&id) {
            if job_id.is_none() && info.assigned_job_id.is_some() {
                info.jobs_processed += 1;
            }
            info.assigned_job_id = job_id;
        }
    }

    /// Gives up one slot if the pool is above its minimum size
    fn try_retire(&self) -> bool {
        let min = self.config.min_workers;
        self.slots
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n > min).then(|| n - 1)
            })
            .is_ok()
    }

    /// Stores the summary of a finished job in the result sink
    fn record_summary(&self, job_id: JobId) {
        let Some(job) = self.scheduler().status(job_id) else {
            return;
        };
        if !job.status.is_terminal() {
            return;
        }

        let sink = Arc::clone(self.runner.sink());
        tokio::spawn(async move {
            if let Err(e) = sink.record_job(&job).await {
                warn!(job_id = %job.id, error = %e, "Failed to record job summary");
            }
        });
    }
}

/// One pool slot: a sequence of worker incarnations
async fn slot_loop(inner: Arc<PoolInner>) {
    loop {
        let id = WorkerId::new(inner.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let fetcher = inner.factory.create();
        inner.register(id);
        debug!(worker = %id, "Worker started");

        let exit = run_worker(&inner, id, &fetcher).await;

        fetcher.shutdown().await;
        inner.unregister(id);

        match exit {
            WorkerExit::Recycle(reason) => {
                inner.recycled.fetch_add(1, Ordering::SeqCst);
                info!(worker = %id, reason = reason.as_str(), "Recycling worker");
                if inner.shutdown.is_cancelled() {
                    inner.slots.fetch_sub(1, Ordering::SeqCst);
                    return;
                }
            }
            WorkerExit::Retire => {
                debug!(worker = %id, "Idle worker retired");
                return;
            }
            WorkerExit::Shutdown => {
                inner.slots.fetch_sub(1, Ordering::SeqCst);
                debug!(worker = %id, "Worker stopped");
                return;
            }
        }
    }
}

/// Runs jobs until the worker has to be replaced, retires or the pool stops
async fn run_worker(
    inner: &Arc<PoolInner>,
    id: WorkerId,
    fetcher: &Arc<dyn PageFetcher>,
) -> WorkerExit {
    let scheduler = Arc::clone(inner.scheduler());
    let mut jobs_run: u32 = 0;

    let idle_timeout = inner.config.idle_timeout();

    loop {
        let next = tokio::select! {
            _ = inner.shutdown.cancelled() => return WorkerExit::Shutdown,
            next = tokio::time::timeout(idle_timeout, scheduler.next_assignment(id)) => next,
        };

        let assignment = match next {
            Err(_idle) => {
                if inner.try_retire() {
                    return WorkerExit::Retire;
                }
                continue;
            }
            Ok(None) => return WorkerExit::Shutdown,
            Ok(Some(assignment)) => assignment,
        };

        let job_id = assignment.job.id;
        inner.set_assigned(id, Some(job_id));
        debug!(worker = %id, job_id = %job_id, "Running job");

        // The body runs in its own task so a panic surfaces as a fault here
        let runner = inner.runner.clone();
        let job_fetcher = Arc::clone(fetcher);
        let result = tokio::spawn(async move { runner.run(job_fetcher, assignment).await }).await;

        inner.set_assigned(id, None);
        jobs_run += 1;

        match result {
            Ok(outcome) => match scheduler.finish(job_id, outcome) {
                Ok(()) => inner.record_summary(job_id),
                Err(e) => warn!(worker = %id, job_id = %job_id, error = %e, "Failed to finish job"),
            },
            Err(e) => {
                let detail = describe_join_error(e);
                error!(worker = %id, job_id = %job_id, detail = %detail, "Job fault");
                match scheduler.fault(job_id, &detail) {
                    Ok(_) => inner.record_summary(job_id),
                    Err(e) => {
                        warn!(worker = %id, job_id = %job_id, error = %e, "Failed to report fault")
                    }
                }
                return WorkerExit::Recycle(RecycleReason::Fault);
            }
        }

        if jobs_run >= inner.config.max_jobs_per_worker {
            return WorkerExit::Recycle(RecycleReason::MaxJobs);
        }

        if let Some(ceiling) = inner.config.resource_ceiling {
            let usage = fetcher.resource_usage();
            if usage > ceiling {
                debug!(worker = %id, usage, ceiling, "Fetcher over resource ceiling");
                return WorkerExit::Recycle(RecycleReason::ResourceCeiling);
            }
        }
    }
}

/// Grows the pool while the queue stays deep
async fn scale_loop(inner: Arc<PoolInner>) {
    let mut ticker = tokio::time::interval(inner.config.scale_check_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut deep_since: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let depth = inner.scheduler().queue_depth();
        if depth <= inner.config.scale_up_queue_depth {
            deep_since = None;
            continue;
        }

        let now = Instant::now();
        let since = *deep_since.get_or_insert(now);
        let alive = inner.slots.load(Ordering::SeqCst);
        if now.duration_since(since) >= inner.config.scale_up_window()
            && alive < inner.config.max_workers
        {
            info!(depth, workers = alive + 1, "Queue stayed deep, adding worker");
            PoolInner::spawn_slot(&inner);
            deep_since = Some(now);
        }
    }
}

fn describe_join_error(e: JoinError) -> String {
    if !e.is_panic() {
        return "job task was cancelled".to_string();
    }

    let panic = e.into_panic();
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("worker panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("worker panicked: {}", message)
    } else {
        "worker panicked".to_string()
    }
}
