//! The body of one job run
//!
//! Walks the job's URLs in order, skipping those already settled by an earlier
//! run. Each URL waits for its domain slot, is fetched, and on failure either
//! backs off and retries or is recorded as failed, as the retry policy decides.
//! Cancellation is checked between URLs, during domain waits and during backoff
//! sleeps; a fetch that has started always runs to completion.
//!
//! Retry budgets continue across runs. An attempt that was in flight when the
//! previous run faulted counts as a transient failure, so a job that keeps
//! crashing on one URL cannot fetch it more often than the budget allows.

use crate::fetch::{PageContent, PageFetcher};
use crate::job::{ErrorKind, Job, JobId, UrlProgress};
use crate::limiter::{Acquire, DomainRateLimiter};
use crate::retry::{FailureClass, RetryCounts, RetryDecision, RetryPolicy};
use crate::scheduler::{Assignment, JobOutcome, Scheduler, WorkerReport};
use crate::state::UrlState;
use crate::storage::ResultSink;
use crate::url::domain_of;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How one URL ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UrlOutcome {
    Done,
    Failed,
    Cancelled,
}

/// Shared dependencies of every job run
#[derive(Clone)]
pub struct JobRunner {
    scheduler: Arc<Scheduler>,
    limiter: Arc<DomainRateLimiter>,
    retry: RetryPolicy,
    sink: Arc<dyn ResultSink>,
}

impl JobRunner {
    pub fn new(
        scheduler: Arc<Scheduler>,
        limiter: Arc<DomainRateLimiter>,
        retry: RetryPolicy,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        Self {
            scheduler,
            limiter,
            retry,
            sink,
        }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn sink(&self) -> &Arc<dyn ResultSink> {
        &self.sink
    }

    /// Runs every unsettled URL of the assignment and decides the job's outcome
    pub async fn run(&self, fetcher: Arc<dyn PageFetcher>, assignment: Assignment) -> JobOutcome {
        let Assignment { job, cancel } = assignment;
        let mut succeeded = job.per_url.iter().any(|p| p.state == UrlState::Done);

        for progress in &job.per_url {
            if progress.state.is_settled() {
                continue;
            }
            if cancel.is_cancelled() {
                return JobOutcome::Cancelled;
            }

            match self
                .run_url(fetcher.as_ref(), &job, progress, &cancel)
                .await
            {
                UrlOutcome::Done => succeeded = true,
                UrlOutcome::Failed => {}
                UrlOutcome::Cancelled => return JobOutcome::Cancelled,
            }
        }

        if succeeded {
            JobOutcome::Completed
        } else {
            JobOutcome::Failed
        }
    }

    async fn run_url(
        &self,
        fetcher: &dyn PageFetcher,
        job: &Job,
        progress: &UrlProgress,
        cancel: &CancellationToken,
    ) -> UrlOutcome {
        let url = progress.url.as_str();
        let domain = match domain_of(url) {
            Ok(domain) => domain,
            Err(e) => {
                self.send(
                    job.id,
                    WorkerReport::UrlFailed {
                        url: url.to_string(),
                        kind: ErrorKind::Validation,
                        error: e.to_string(),
                    },
                );
                return UrlOutcome::Failed;
            }
        };

        let mut attempt = progress.attempts;
        let mut retries = progress.retries;
        if attempt > retries.total() {
            if let Some(outcome) = self.charge_interrupted_attempt(job.id, progress, &mut retries) {
                return outcome;
            }
        }

        loop {
            if self.limiter.acquire_or_cancel(&domain, cancel).await == Acquire::Cancelled {
                return UrlOutcome::Cancelled;
            }

            attempt += 1;
            self.send(
                job.id,
                WorkerReport::UrlStarted {
                    url: url.to_string(),
                    attempt,
                },
            );

            let error = match fetcher.fetch(url, &job.config).await {
                Ok(page) => {
                    self.persist(job.id, url, page);
                    self.send(
                        job.id,
                        WorkerReport::UrlSucceeded {
                            url: url.to_string(),
                        },
                    );
                    return UrlOutcome::Done;
                }
                Err(error) => error,
            };

            let decision = self.retry.decide(&error, &retries);
            if decision.class() == FailureClass::RateLimit {
                self.limiter.penalize(&domain);
            }

            match decision {
                RetryDecision::Retry { class, delay } => {
                    retries.record(class);
                    self.send(
                        job.id,
                        WorkerReport::UrlRetrying {
                            url: url.to_string(),
                            class,
                            error: error.to_string(),
                            delay,
                        },
                    );

                    tokio::select! {
                        _ = cancel.cancelled() => return UrlOutcome::Cancelled,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                RetryDecision::GiveUp { class } => {
                    debug!(
                        job_id = %job.id,
                        url = %url,
                        attempts = attempt,
                        error = %error,
                        "Giving up on URL"
                    );
                    self.send(
                        job.id,
                        WorkerReport::UrlFailed {
                            url: url.to_string(),
                            kind: class.error_kind(),
                            error: error.to_string(),
                        },
                    );
                    return UrlOutcome::Failed;
                }
            }
        }
    }

    /// Settles the attempt a previous run started but never finished
    ///
    /// The attempt is charged to the transient budget. Returns the URL's outcome
    /// when that budget was already spent, None when the URL may be fetched again.
    fn charge_interrupted_attempt(
        &self,
        job_id: JobId,
        progress: &UrlProgress,
        retries: &mut RetryCounts,
    ) -> Option<UrlOutcome> {
        let class = FailureClass::Transient;
        let error = "attempt interrupted by a worker fault".to_string();

        if retries.get(class) >= self.retry.max_retries(class) {
            debug!(
                job_id = %job_id,
                url = %progress.url,
                attempts = progress.attempts,
                "Retry budget spent before the interrupted attempt"
            );
            self.send(
                job_id,
                WorkerReport::UrlFailed {
                    url: progress.url.clone(),
                    kind: class.error_kind(),
                    error: progress.last_error.clone().unwrap_or(error),
                },
            );
            return Some(UrlOutcome::Failed);
        }

        retries.record(class);
        self.send(
            job_id,
            WorkerReport::UrlRetrying {
                url: progress.url.clone(),
                class,
                error,
                delay: Duration::ZERO,
            },
        );
        None
    }

    fn send(&self, job_id: JobId, report: WorkerReport) {
        if let Err(e) = self.scheduler.report(job_id, report) {
            warn!(job_id = %job_id, error = %e, "Failed to apply worker report");
        }
    }

    /// Hands a page to the result sink without waiting for it
    fn persist(&self, job_id: JobId, url: &str, page: PageContent) {
        let sink = Arc::clone(&self.sink);
        let url = url.to_string();
        tokio::spawn(async move {
            if let Err(e) = sink.persist(job_id, &url, &page).await {
                warn!(job_id = %job_id, url = %url, error = %e, "Failed to persist page");
            }
        });
    }
}
