//! Integration tests for job orchestration
//!
//! These tests drive a full `Coordinator` with scripted fetchers on a paused
//! tokio clock, so retries, domain spacing and timeouts play out instantly and
//! deterministically.

use async_trait::async_trait;
use scrape_relay::broadcast::WireStatus;
use scrape_relay::client::{LocalTransport, ReconnectPolicy, ReconnectingClient};
use scrape_relay::config::{Config, TierQuota};
use scrape_relay::fetch::{FetchError, FetcherFactory, PageContent, PageFetcher};
use scrape_relay::job::Job;
use scrape_relay::scheduler::CancelOutcome;
use scrape_relay::storage::{ResultSink, StorageResult};
use scrape_relay::{
    Coordinator, JobEvent, JobId, JobStatus, PriorityTier, RelayError, ScrapeConfig,
    Subscription, SubmitRequest, UrlState,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{timeout, Instant};

/// What a scripted fetch does
#[derive(Clone)]
enum Step {
    Page,
    Fail(FetchError),
    Panic(&'static str),
}

#[derive(Default)]
struct Script {
    steps: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<Vec<(String, Instant)>>,
    fetch_time: Mutex<Duration>,
    usage: AtomicU64,
}

/// Fetcher that plays back per-URL scripts and records every call
///
/// Every worker's fetcher shares one script. URLs without a script succeed.
#[derive(Clone, Default)]
struct ScriptedFetcher(Arc<Script>);

impl ScriptedFetcher {
    fn script(&self, url: &str, steps: Vec<Step>) {
        self.0
            .steps
            .lock()
            .unwrap()
            .insert(url.to_string(), steps.into());
    }

    fn set_fetch_time(&self, fetch_time: Duration) {
        *self.0.fetch_time.lock().unwrap() = fetch_time;
    }

    fn set_usage(&self, usage: u64) {
        self.0.usage.store(usage, Ordering::SeqCst);
    }

    fn calls(&self) -> Vec<(String, Instant)> {
        self.0.calls.lock().unwrap().clone()
    }

    fn calls_for(&self, url: &str) -> usize {
        self.calls().iter().filter(|(u, _)| u == url).count()
    }

    fn factory(&self) -> Arc<dyn FetcherFactory> {
        let fetcher = self.clone();
        Arc::new(move || -> Arc<dyn PageFetcher> { Arc::new(fetcher.clone()) })
    }
}

#[async_trait]
impl PageFetcher for ScriptedFetcher {
    async fn fetch(&self, url: &str, _config: &ScrapeConfig) -> Result<PageContent, FetchError> {
        self.0
            .calls
            .lock()
            .unwrap()
            .push((url.to_string(), Instant::now()));

        let fetch_time = *self.0.fetch_time.lock().unwrap();
        if !fetch_time.is_zero() {
            tokio::time::sleep(fetch_time).await;
        }

        let step = self
            .0
            .steps
            .lock()
            .unwrap()
            .get_mut(url)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Step::Page);

        match step {
            Step::Page => Ok(PageContent::new(url, "<html><title>ok</title></html>")),
            Step::Fail(error) => Err(error),
            Step::Panic(message) => panic!("{}", message),
        }
    }

    fn resource_usage(&self) -> u64 {
        self.0.usage.load(Ordering::SeqCst)
    }
}

/// Sink that remembers what it was given
#[derive(Default)]
struct MemorySink {
    pages: Mutex<Vec<(JobId, String)>>,
    jobs: Mutex<Vec<(JobId, JobStatus)>>,
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn persist(&self, job_id: JobId, url: &str, _page: &PageContent) -> StorageResult<()> {
        self.pages.lock().unwrap().push((job_id, url.to_string()));
        Ok(())
    }

    async fn record_job(&self, job: &Job) -> StorageResult<()> {
        self.jobs.lock().unwrap().push((job.id, job.status));
        Ok(())
    }
}

/// One worker, short spacing, no jitter, no job timeout
fn test_config() -> Config {
    let mut config = Config::default();
    config.workers.min_workers = 1;
    config.workers.max_workers = 1;
    config.rate_limit.min_spacing_ms = 100;
    config.retry.jitter = 0.0;
    config.retry.base_delay_ms = 100;
    config.retry.rate_limit_base_delay_ms = 500;
    config.retry.max_delay_ms = 10_000;
    config.scheduler.job_timeout_secs = None;
    config
}

fn start(config: Config, fetcher: &ScrapeFixture) -> Coordinator {
    Coordinator::start(config, fetcher.fetcher.factory(), fetcher.sink.clone())
        .expect("coordinator should start")
}

struct ScrapeFixture {
    fetcher: ScriptedFetcher,
    sink: Arc<MemorySink>,
}

impl ScrapeFixture {
    fn new() -> Self {
        Self {
            fetcher: ScriptedFetcher::default(),
            sink: Arc::new(MemorySink::default()),
        }
    }
}

fn request(tenant: &str, urls: &[&str], tier: PriorityTier) -> SubmitRequest {
    SubmitRequest::new(tenant, urls.iter().copied(), tier)
}

/// Reads a subscription until its stream ends
async fn collect(subscription: &Subscription) -> Vec<JobEvent> {
    let read_all = async {
        let mut events = Vec::new();
        while let Some(event) = subscription.recv().await {
            events.push(event);
        }
        events
    };
    timeout(Duration::from_secs(3600), read_all)
        .await
        .expect("event stream should end")
}

/// Waits until a job reaches a terminal state and returns it
async fn wait_for_terminal(coordinator: &Coordinator, job_id: JobId) -> Job {
    let wait = async {
        loop {
            if let Some(job) = coordinator.status(job_id) {
                if job.status.is_terminal() {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    };
    timeout(Duration::from_secs(3600), wait)
        .await
        .expect("job should finish")
}

fn completion(events: &[JobEvent]) -> &scrape_relay::broadcast::CompletionEvent {
    match events.last() {
        Some(JobEvent::Complete(done)) => done,
        other => panic!("stream should end with a completion event, got {:?}", other),
    }
}

fn progress_values(events: &[JobEvent]) -> Vec<(u8, u32)> {
    events
        .iter()
        .filter_map(|event| match event {
            JobEvent::Progress(p) => Some((p.progress, p.pages_scraped)),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_identical_submissions_share_one_execution() {
    let fixture = ScrapeFixture::new();
    fixture.fetcher.set_fetch_time(Duration::from_millis(100));
    let coordinator = start(test_config(), &fixture);

    let first = coordinator
        .submit(request(
            "alice",
            &["https://a.test/one", "https://a.test/two"],
            PriorityTier::Free,
        ))
        .unwrap();
    // Same set of pages spelled differently
    let second = coordinator
        .submit(request(
            "bob",
            &["https://www.a.test/two/?utm_source=mail", "https://A.test/one"],
            PriorityTier::Pro,
        ))
        .unwrap();

    assert!(!first.attached);
    assert!(second.attached);
    assert_eq!(first.job_id, second.job_id);

    let alice = coordinator.join(first.job_id, "alice-socket").unwrap();
    let bob = coordinator.join(second.job_id, "bob-socket").unwrap();

    let alice_events = collect(&alice).await;
    let bob_events = collect(&bob).await;

    assert_eq!(completion(&alice_events), completion(&bob_events));
    assert!(completion(&alice_events).success);
    assert_eq!(completion(&alice_events).pages_scraped, 2);

    assert_eq!(fixture.fetcher.calls_for("https://a.test/one"), 1);
    assert_eq!(fixture.fetcher.calls_for("https://a.test/two"), 1);

    let bob_jobs = coordinator.jobs_for_tenant("bob");
    assert_eq!(bob_jobs.len(), 1);
    assert_eq!(bob_jobs[0].submitters, vec!["alice", "bob"]);

    // Once the job is finished an identical submission starts a new one
    let third = coordinator
        .submit(request("alice", &["https://a.test/one", "https://a.test/two"], PriorityTier::Free))
        .unwrap();
    assert!(!third.attached);
    assert_ne!(third.job_id, first.job_id);

    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_identical_submissions() {
    let fixture = ScrapeFixture::new();
    fixture.fetcher.set_fetch_time(Duration::from_millis(100));
    let coordinator = Arc::new(start(test_config(), &fixture));

    let mut handles = Vec::new();
    for tenant in ["t1", "t2", "t3", "t4"] {
        let coordinator = Arc::clone(&coordinator);
        handles.push(tokio::spawn(async move {
            coordinator
                .submit(request(tenant, &["https://same.test/page"], PriorityTier::Starter))
                .unwrap()
        }));
    }

    let mut receipts = Vec::new();
    for handle in handles {
        receipts.push(handle.await.unwrap());
    }

    let job_id = receipts[0].job_id;
    assert!(receipts.iter().all(|r| r.job_id == job_id));
    assert_eq!(receipts.iter().filter(|r| !r.attached).count(), 1);

    wait_for_terminal(&coordinator, job_id).await;
    assert_eq!(fixture.fetcher.calls_for("https://same.test/page"), 1);

    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_progress_never_decreases() {
    let fixture = ScrapeFixture::new();
    fixture.fetcher.script(
        "https://b.test/missing",
        vec![Step::Fail(FetchError::from_status(404))],
    );
    let coordinator = start(test_config(), &fixture);

    let receipt = coordinator
        .submit(request(
            "alice",
            &[
                "https://b.test/1",
                "https://b.test/missing",
                "https://b.test/3",
                "https://b.test/4",
            ],
            PriorityTier::Free,
        ))
        .unwrap();

    let first = coordinator.join(receipt.job_id, "first").unwrap();
    let second = coordinator.join(receipt.job_id, "second").unwrap();
    let first_events = collect(&first).await;
    let second_events = collect(&second).await;

    for events in [&first_events, &second_events] {
        let values = progress_values(events);
        assert!(values.len() > 4);
        for pair in values.windows(2) {
            assert!(pair[1].0 >= pair[0].0, "progress went back: {:?}", values);
            assert!(pair[1].1 >= pair[0].1, "pages went back: {:?}", values);
        }
        assert_eq!(values.last(), Some(&(100, 3)));
    }

    let done = completion(&first_events);
    assert!(done.success);
    assert_eq!(done.pages_scraped, 3);
    assert_eq!(done.errors.len(), 1);
    assert!(done.errors[0].contains("https://b.test/missing"));

    assert!(first_events.iter().any(|event| matches!(
        event,
        JobEvent::Error(e) if e.error_type == "permanent_fetch"
    )));
    // Both observers see one stream; only their join snapshots differ
    assert_eq!(first_events[1..], second_events[1..]);

    // The missing page is never retried
    assert_eq!(fixture.fetcher.calls_for("https://b.test/missing"), 1);

    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_queued() {
    let fixture = ScrapeFixture::new();
    fixture.fetcher.set_fetch_time(Duration::from_secs(5));
    let coordinator = start(test_config(), &fixture);

    let running = coordinator
        .submit(request("alice", &["https://c.test/slow"], PriorityTier::Free))
        .unwrap();
    let running_sub = coordinator.join(running.job_id, "watcher").unwrap();

    // Wait until the only worker is busy with the first job
    loop {
        match running_sub.recv().await {
            Some(JobEvent::Progress(p)) if p.status == WireStatus::Processing => break,
            Some(_) => continue,
            None => panic!("stream ended early"),
        }
    }

    let queued = coordinator
        .submit(request("bob", &["https://c.test/never"], PriorityTier::Enterprise))
        .unwrap();
    assert_eq!(
        coordinator.cancel(queued.job_id).unwrap(),
        CancelOutcome::Cancelled
    );
    assert_eq!(
        coordinator.cancel(queued.job_id).unwrap(),
        CancelOutcome::AlreadyFinished(JobStatus::Cancelled)
    );

    let late = coordinator.join(queued.job_id, "late").unwrap();
    let events = collect(&late).await;
    let done = completion(&events);
    assert!(!done.success);
    assert_eq!(done.status, WireStatus::Cancelled);

    wait_for_terminal(&coordinator, running.job_id).await;
    let job = coordinator.status(queued.job_id).unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.started_at.is_none());
    assert!(job.worker_id.is_none());
    assert_eq!(fixture.fetcher.calls_for("https://c.test/never"), 0);

    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_cancel_running_job() {
    let fixture = ScrapeFixture::new();
    fixture.fetcher.set_fetch_time(Duration::from_secs(1));
    let coordinator = start(test_config(), &fixture);

    let receipt = coordinator
        .submit(request(
            "alice",
            &["https://d.test/1", "https://d.test/2", "https://d.test/3"],
            PriorityTier::Free,
        ))
        .unwrap();
    let subscription = coordinator.join(receipt.job_id, "watcher").unwrap();

    loop {
        match subscription.recv().await {
            Some(JobEvent::Progress(p)) if p.pages_scraped == 1 => break,
            Some(_) => continue,
            None => panic!("stream ended early"),
        }
    }
    assert_eq!(
        coordinator.cancel(receipt.job_id).unwrap(),
        CancelOutcome::Requested
    );

    let events = collect(&subscription).await;
    let done = completion(&events);
    assert_eq!(done.status, WireStatus::Cancelled);
    assert!(done.pages_scraped < 3);
    assert_eq!(fixture.fetcher.calls_for("https://d.test/3"), 0);

    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_worker_recycled_after_max_jobs() {
    let fixture = ScrapeFixture::new();
    let mut config = test_config();
    config.workers.max_jobs_per_worker = 2;
    let coordinator = start(config, &fixture);

    let mut workers = Vec::new();
    for n in 0..3 {
        let url = format!("https://e{}.test/page", n);
        let receipt = coordinator
            .submit(request("alice", &[url.as_str()], PriorityTier::Free))
            .unwrap();
        let job = wait_for_terminal(&coordinator, receipt.job_id).await;
        assert_eq!(job.status, JobStatus::Completed);
        workers.push(job.worker_id.expect("job should record its worker"));
    }

    assert_eq!(workers[0], workers[1]);
    assert_ne!(workers[1], workers[2]);
    assert!(coordinator.recycled_workers() >= 1);

    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_worker_recycled_over_resource_ceiling() {
    let fixture = ScrapeFixture::new();
    fixture.fetcher.set_usage(10);
    let mut config = test_config();
    config.workers.resource_ceiling = Some(5);
    let coordinator = start(config, &fixture);

    let a = coordinator
        .submit(request("alice", &["https://f1.test/page"], PriorityTier::Free))
        .unwrap();
    let first = wait_for_terminal(&coordinator, a.job_id).await;
    let b = coordinator
        .submit(request("alice", &["https://f2.test/page"], PriorityTier::Free))
        .unwrap();
    let second = wait_for_terminal(&coordinator, b.job_id).await;

    assert_ne!(first.worker_id, second.worker_id);
    assert_eq!(coordinator.workers().len(), 1);

    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_transient_retries_are_bounded() {
    let fixture = ScrapeFixture::new();
    fixture.fetcher.script(
        "https://g.test/flaky",
        (0..6)
            .map(|_| Step::Fail(FetchError::network("connection reset")))
            .collect(),
    );
    let coordinator = start(test_config(), &fixture);

    let receipt = coordinator
        .submit(request(
            "alice",
            &["https://g.test/flaky", "https://g.test/fine"],
            PriorityTier::Free,
        ))
        .unwrap();
    let subscription = coordinator.join(receipt.job_id, "watcher").unwrap();
    let events = collect(&subscription).await;

    // One first attempt plus three retries
    assert_eq!(fixture.fetcher.calls_for("https://g.test/flaky"), 4);
    assert_eq!(fixture.fetcher.calls_for("https://g.test/fine"), 1);

    let done = completion(&events);
    assert!(done.success);
    assert_eq!(done.pages_scraped, 1);
    assert_eq!(done.errors.len(), 1);
    assert!(done.errors[0].contains("connection reset"));

    let job = coordinator.status(receipt.job_id).unwrap();
    assert_eq!(job.per_url[0].state, UrlState::Failed);
    assert_eq!(job.per_url[0].attempts, 4);
    assert_eq!(job.per_url[1].state, UrlState::Done);

    assert!(events.iter().any(|event| matches!(
        event,
        JobEvent::Error(e) if e.error_type == "transient_fetch"
    )));

    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_retry_budget_survives_a_fault() {
    let fixture = ScrapeFixture::new();
    let mut steps: Vec<Step> = (0..3)
        .map(|_| Step::Fail(FetchError::network("connection reset")))
        .collect();
    steps.push(Step::Panic("fetcher crashed mid-retry"));
    steps.extend((0..4).map(|_| Step::Fail(FetchError::network("connection reset"))));
    fixture.fetcher.script("https://p.test/x", steps);
    let coordinator = start(test_config(), &fixture);

    let receipt = coordinator
        .submit(request(
            "alice",
            &["https://p.test/x", "https://p.test/y"],
            PriorityTier::Free,
        ))
        .unwrap();
    let subscription = coordinator.join(receipt.job_id, "watcher").unwrap();
    let events = collect(&subscription).await;

    // Three retries were spent before the crash and the crashed attempt counts
    // too, so the re-dispatched run does not fetch the URL again
    assert_eq!(fixture.fetcher.calls_for("https://p.test/x"), 4);
    assert_eq!(fixture.fetcher.calls_for("https://p.test/y"), 1);

    let done = completion(&events);
    assert!(done.success);
    assert_eq!(done.pages_scraped, 1);
    assert_eq!(done.errors.len(), 1);
    assert!(done.errors[0].contains("connection reset"));

    let job = coordinator.status(receipt.job_id).unwrap();
    assert_eq!(job.faults, 1);
    assert_eq!(job.per_url[0].state, UrlState::Failed);
    assert_eq!(job.per_url[0].attempts, 4);
    assert_eq!(job.per_url[0].retries.transient, 3);
    assert_eq!(job.per_url[1].state, UrlState::Done);

    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_retry_budgets_are_kept_per_failure_class() {
    let fixture = ScrapeFixture::new();
    let mut steps: Vec<Step> = (0..3)
        .map(|_| Step::Fail(FetchError::from_status(429)))
        .collect();
    steps.extend((0..2).map(|_| Step::Fail(FetchError::network("connection reset"))));
    fixture.fetcher.script("https://q.test/busy", steps);
    let mut config = test_config();
    config.retry.rate_limit_max_retries = 3;
    let coordinator = start(config, &fixture);

    let receipt = coordinator
        .submit(request("alice", &["https://q.test/busy"], PriorityTier::Free))
        .unwrap();
    let job = wait_for_terminal(&coordinator, receipt.job_id).await;

    // Spent rate-limit retries leave the transient budget untouched
    assert_eq!(fixture.fetcher.calls_for("https://q.test/busy"), 6);
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.errors.is_empty());
    assert_eq!(job.per_url[0].retries.rate_limit, 3);
    assert_eq!(job.per_url[0].retries.transient, 2);

    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_all_urls_failing_fails_the_job() {
    let fixture = ScrapeFixture::new();
    fixture
        .fetcher
        .script("https://h.test/gone", vec![Step::Fail(FetchError::from_status(410))]);
    let coordinator = start(test_config(), &fixture);

    let receipt = coordinator
        .submit(request("alice", &["https://h.test/gone"], PriorityTier::Free))
        .unwrap();
    let subscription = coordinator.join(receipt.job_id, "watcher").unwrap();
    let events = collect(&subscription).await;

    let done = completion(&events);
    assert!(!done.success);
    assert_eq!(done.status, WireStatus::Failed);
    assert_eq!(done.pages_scraped, 0);

    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_domain_spacing_across_workers() {
    let fixture = ScrapeFixture::new();
    let mut config = test_config();
    config.workers.min_workers = 3;
    config.workers.max_workers = 3;
    config.rate_limit.min_spacing_ms = 1000;
    let coordinator = start(config, &fixture);

    let mut jobs = Vec::new();
    for n in 0..3 {
        let url = format!("https://spaced.test/page-{}", n);
        jobs.push(
            coordinator
                .submit(request("alice", &[url.as_str()], PriorityTier::Pro))
                .unwrap()
                .job_id,
        );
    }
    for job_id in jobs {
        wait_for_terminal(&coordinator, job_id).await;
    }

    let mut times: Vec<Instant> = fixture.fetcher.calls().into_iter().map(|(_, t)| t).collect();
    times.sort();
    assert_eq!(times.len(), 3);
    for pair in times.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_millis(1000));
    }

    let stats = coordinator.domain_stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].domain, "spaced.test");
    assert_eq!(stats[0].request_count, 3);

    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_enterprise_first_and_free_not_starved() {
    let fixture = ScrapeFixture::new();
    let coordinator = start(test_config(), &fixture);

    let mut tier_of_url = HashMap::new();
    let mut jobs = Vec::new();
    for n in 0..3 {
        let url = format!("https://free{}.test/page", n);
        let receipt = coordinator
            .submit(request("small", &[url.as_str()], PriorityTier::Free))
            .unwrap();
        tier_of_url.insert(url, PriorityTier::Free);
        jobs.push(receipt.job_id);
    }
    for n in 0..3 {
        let url = format!("https://big{}.test/page", n);
        let receipt = coordinator
            .submit(request("large", &[url.as_str()], PriorityTier::Enterprise))
            .unwrap();
        tier_of_url.insert(url, PriorityTier::Enterprise);
        jobs.push(receipt.job_id);
    }

    for job_id in jobs {
        wait_for_terminal(&coordinator, job_id).await;
    }

    let order: Vec<PriorityTier> = fixture
        .fetcher
        .calls()
        .iter()
        .map(|(url, _)| tier_of_url[url])
        .collect();
    assert_eq!(
        order,
        vec![
            PriorityTier::Enterprise,
            PriorityTier::Enterprise,
            PriorityTier::Free,
            PriorityTier::Enterprise,
            PriorityTier::Free,
            PriorityTier::Free,
        ]
    );

    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_twice_then_success() {
    let fixture = ScrapeFixture::new();
    fixture.fetcher.script(
        "https://busy.test/a",
        vec![
            Step::Fail(FetchError::from_status(429)),
            Step::Fail(FetchError::from_status(429)),
            Step::Page,
        ],
    );
    let coordinator = start(test_config(), &fixture);

    let started = Instant::now();
    let receipt = coordinator
        .submit(request(
            "alice",
            &["https://busy.test/a", "https://busy.test/b"],
            PriorityTier::Starter,
        ))
        .unwrap();
    let subscription = coordinator.join(receipt.job_id, "watcher").unwrap();
    let events = collect(&subscription).await;

    let done = completion(&events);
    assert!(done.success);
    assert_eq!(done.status, WireStatus::Completed);
    assert_eq!(done.pages_scraped, 2);
    assert!(done.errors.is_empty());
    assert_eq!(progress_values(&events).last(), Some(&(100, 2)));

    assert_eq!(fixture.fetcher.calls_for("https://busy.test/a"), 3);
    // 500ms then 1000ms of rate-limit backoff
    assert!(Instant::now() - started >= Duration::from_millis(1500));

    let stats = coordinator.domain_stats();
    assert_eq!(stats[0].domain, "busy.test");
    assert_eq!(stats[0].rate_limit_hits, 2);

    let job = coordinator.status(receipt.job_id).unwrap();
    assert!(job.errors.is_empty());
    assert_eq!(job.progress, 100);

    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_late_join_sees_current_progress() {
    let fixture = ScrapeFixture::new();
    let mut config = test_config();
    config.rate_limit.min_spacing_ms = 1000;
    let coordinator = start(config, &fixture);

    let urls: Vec<String> = (1..=8).map(|n| format!("https://late.test/{}", n)).collect();
    let receipt = coordinator
        .submit(SubmitRequest::new("alice", urls, PriorityTier::Pro))
        .unwrap();

    let early = coordinator.join(receipt.job_id, "early").unwrap();
    loop {
        match early.recv().await {
            Some(JobEvent::Progress(p)) if p.pages_scraped == 5 => break,
            Some(_) => continue,
            None => panic!("stream ended early"),
        }
    }

    let late = coordinator.join(receipt.job_id, "late").unwrap();
    assert_eq!(late.snapshot().pages_scraped, 5);
    assert_eq!(late.snapshot().status, WireStatus::Processing);
    assert!(late.snapshot().progress >= 62);

    let events = collect(&late).await;
    match &events[0] {
        JobEvent::Progress(p) => assert_eq!(p.pages_scraped, 5),
        other => panic!("first event should be the snapshot, got {:?}", other),
    }
    assert_eq!(completion(&events).pages_scraped, 8);

    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_admission_control_rejects_overload() {
    let fixture = ScrapeFixture::new();
    let mut config = test_config();
    config.scheduler.admission_threshold = 2;
    config.scheduler.recovery_depth = 1;
    let coordinator = start(config, &fixture);

    // Nothing yields between these submissions, so no job is dispatched yet
    let first = coordinator
        .submit(request("alice", &["https://i.test/1"], PriorityTier::Free))
        .unwrap();
    coordinator
        .submit(request("alice", &["https://i.test/2"], PriorityTier::Free))
        .unwrap();

    let err = coordinator
        .submit(request("alice", &["https://i.test/3"], PriorityTier::Enterprise))
        .unwrap_err();
    assert!(matches!(
        err,
        RelayError::Overload {
            depth: 2,
            threshold: 2
        }
    ));

    // Attaching to a live job is never rejected
    let attached = coordinator
        .submit(request("bob", &["https://i.test/1"], PriorityTier::Free))
        .unwrap();
    assert!(attached.attached);
    assert_eq!(attached.job_id, first.job_id);

    let stats = coordinator.stats();
    assert_eq!(stats.queue_depth, 2);
    assert_eq!(stats.queued_by_tier[&PriorityTier::Free], 2);

    wait_for_terminal(&coordinator, first.job_id).await;
    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_tenant_quota_window() {
    let fixture = ScrapeFixture::new();
    let mut config = test_config();
    config.quota.insert(
        PriorityTier::Free,
        TierQuota {
            pages: 2,
            window_secs: 60,
        },
    );
    let coordinator = start(config, &fixture);

    let first = coordinator
        .submit(request(
            "alice",
            &["https://j.test/1", "https://j.test/2"],
            PriorityTier::Free,
        ))
        .unwrap();

    match coordinator.submit(request("alice", &["https://j.test/3"], PriorityTier::Free)) {
        Err(RelayError::QuotaExceeded {
            tenant,
            tier,
            limit,
            reset_in,
        }) => {
            assert_eq!(tenant, "alice");
            assert_eq!(tier, PriorityTier::Free);
            assert_eq!(limit, 2);
            assert!(reset_in <= Duration::from_secs(60));
        }
        other => panic!("expected a quota error, got {:?}", other),
    }

    // Other tenants and other tiers have their own budgets
    assert!(coordinator
        .submit(request("bob", &["https://j.test/3"], PriorityTier::Free))
        .is_ok());
    assert!(coordinator
        .submit(request("alice", &["https://j.test/4"], PriorityTier::Pro))
        .is_ok());

    // Attaching costs nothing
    let attached = coordinator
        .submit(request(
            "alice",
            &["https://j.test/2", "https://j.test/1"],
            PriorityTier::Free,
        ))
        .unwrap();
    assert!(attached.attached);
    assert_eq!(attached.job_id, first.job_id);

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert!(coordinator
        .submit(request("alice", &["https://j.test/5"], PriorityTier::Free))
        .is_ok());

    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_validation_errors() {
    let fixture = ScrapeFixture::new();
    let coordinator = start(test_config(), &fixture);

    let empty: [&str; 0] = [];
    assert!(matches!(
        coordinator.submit(request("alice", &empty, PriorityTier::Free)),
        Err(RelayError::Validation(_))
    ));
    assert!(matches!(
        coordinator.submit(request(" ", &["https://k.test/"], PriorityTier::Free)),
        Err(RelayError::Validation(_))
    ));
    assert!(matches!(
        coordinator.submit(request("alice", &["ftp://k.test/file"], PriorityTier::Free)),
        Err(RelayError::Validation(_))
    ));

    let too_many: Vec<String> = (0..51).map(|n| format!("https://k.test/{}", n)).collect();
    assert!(matches!(
        coordinator.submit(SubmitRequest::new("alice", too_many, PriorityTier::Free)),
        Err(RelayError::Validation(_))
    ));

    let bad_config = ScrapeConfig {
        page_timeout_ms: 1000,
        ..ScrapeConfig::default()
    };
    assert!(matches!(
        coordinator.submit(
            request("alice", &["https://k.test/"], PriorityTier::Free).with_config(bad_config)
        ),
        Err(RelayError::Validation(_))
    ));

    assert_eq!(coordinator.stats().known_jobs, 0);
    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_fault_redispatches_without_refetching() {
    let fixture = ScrapeFixture::new();
    fixture
        .fetcher
        .script("https://l.test/2", vec![Step::Panic("fetcher crashed")]);
    let coordinator = start(test_config(), &fixture);

    let receipt = coordinator
        .submit(request(
            "alice",
            &["https://l.test/1", "https://l.test/2", "https://l.test/3"],
            PriorityTier::Free,
        ))
        .unwrap();
    let subscription = coordinator.join(receipt.job_id, "watcher").unwrap();
    let events = collect(&subscription).await;

    let done = completion(&events);
    assert!(done.success);
    assert_eq!(done.pages_scraped, 3);
    assert!(done.errors.is_empty());

    assert_eq!(fixture.fetcher.calls_for("https://l.test/1"), 1);
    assert_eq!(fixture.fetcher.calls_for("https://l.test/2"), 2);
    assert_eq!(fixture.fetcher.calls_for("https://l.test/3"), 1);

    let job = coordinator.status(receipt.job_id).unwrap();
    assert_eq!(job.faults, 1);
    assert!(coordinator.recycled_workers() >= 1);

    // The re-queued job shows up as pending again, but progress never drops
    let values = progress_values(&events);
    for pair in values.windows(2) {
        assert!(pair[1] >= pair[0], "{:?}", values);
    }

    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_recurring_fault_fails_the_job() {
    let fixture = ScrapeFixture::new();
    fixture.fetcher.script(
        "https://m.test/crash",
        vec![Step::Panic("boom"), Step::Panic("boom again")],
    );
    let coordinator = start(test_config(), &fixture);

    let receipt = coordinator
        .submit(request("alice", &["https://m.test/crash"], PriorityTier::Free))
        .unwrap();
    let subscription = coordinator.join(receipt.job_id, "watcher").unwrap();
    let events = collect(&subscription).await;

    let done = completion(&events);
    assert!(!done.success);
    assert_eq!(done.status, WireStatus::Failed);
    assert_eq!(done.errors.len(), 1);
    assert!(done.errors[0].contains("boom again"));
    assert!(events.iter().any(|event| matches!(
        event,
        JobEvent::Error(e) if e.error_type == "worker_fault"
    )));

    let job = coordinator.status(receipt.job_id).unwrap();
    assert_eq!(job.faults, 2);
    assert_eq!(job.status, JobStatus::Failed);

    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_job_timeout_cancels_at_url_boundary() {
    let fixture = ScrapeFixture::new();
    fixture.fetcher.set_fetch_time(Duration::from_secs(3));
    let mut config = test_config();
    config.scheduler.job_timeout_secs = Some(5);
    let coordinator = start(config, &fixture);

    let receipt = coordinator
        .submit(request(
            "alice",
            &[
                "https://n1.test/page",
                "https://n2.test/page",
                "https://n3.test/page",
                "https://n4.test/page",
            ],
            PriorityTier::Free,
        ))
        .unwrap();
    let subscription = coordinator.join(receipt.job_id, "watcher").unwrap();
    let events = collect(&subscription).await;

    // The fetch running when the timer fired still completes
    let done = completion(&events);
    assert_eq!(done.status, WireStatus::Cancelled);
    assert_eq!(done.pages_scraped, 2);
    assert!(done.errors.iter().any(|e| e.contains("timed out after 5s")));
    assert_eq!(fixture.fetcher.calls().len(), 2);

    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_finished_jobs_are_purged_after_retention() {
    let fixture = ScrapeFixture::new();
    let mut config = test_config();
    config.scheduler.retention_secs = 60;
    config.scheduler.purge_interval_secs = 10;
    let coordinator = start(config, &fixture);

    let receipt = coordinator
        .submit(request("alice", &["https://o.test/page"], PriorityTier::Free))
        .unwrap();
    wait_for_terminal(&coordinator, receipt.job_id).await;

    // Still joinable for a while; the late observer gets the completion at once
    let late = coordinator.join(receipt.job_id, "late").unwrap();
    let events = collect(&late).await;
    assert_eq!(events.len(), 2);
    assert!(completion(&events).success);

    tokio::time::sleep(Duration::from_secs(80)).await;
    assert!(coordinator.status(receipt.job_id).is_none());
    assert!(matches!(
        coordinator.join(receipt.job_id, "too-late"),
        Err(RelayError::JobNotFound(_))
    ));

    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_slow_observer_keeps_latest_and_terminal_events() {
    let fixture = ScrapeFixture::new();
    let mut config = test_config();
    config.broadcast.buffer_capacity = 2;
    let coordinator = start(config, &fixture);

    let urls: Vec<String> = (0..6).map(|n| format!("https://p{}.test/page", n)).collect();
    let receipt = coordinator
        .submit(SubmitRequest::new("alice", urls, PriorityTier::Free))
        .unwrap();
    let slow = coordinator.join(receipt.job_id, "slow").unwrap();

    wait_for_terminal(&coordinator, receipt.job_id).await;

    let events = collect(&slow).await;
    assert!(events.len() <= 3, "{:?}", events);
    let done = completion(&events);
    assert!(done.success);
    assert_eq!(done.pages_scraped, 6);
    assert!(slow.dropped_events() > 0);

    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_pages_reach_the_sink() {
    let fixture = ScrapeFixture::new();
    let coordinator = start(test_config(), &fixture);

    let receipt = coordinator
        .submit(request(
            "alice",
            &["https://q.test/1", "https://q.test/2"],
            PriorityTier::Free,
        ))
        .unwrap();
    wait_for_terminal(&coordinator, receipt.job_id).await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    let pages = fixture.sink.pages.lock().unwrap().clone();
    assert_eq!(pages.len(), 2);
    assert!(pages.iter().all(|(job_id, _)| *job_id == receipt.job_id));

    let jobs = fixture.sink.jobs.lock().unwrap().clone();
    assert_eq!(jobs, vec![(receipt.job_id, JobStatus::Completed)]);

    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_reconnecting_client_rejoins_with_snapshot() {
    let fixture = ScrapeFixture::new();
    let mut config = test_config();
    config.rate_limit.min_spacing_ms = 1000;
    let coordinator = Arc::new(start(config, &fixture));

    let urls: Vec<String> = (1..=6).map(|n| format!("https://r.test/{}", n)).collect();
    let receipt = coordinator
        .submit(SubmitRequest::new("alice", urls, PriorityTier::Pro))
        .unwrap();

    let transport = LocalTransport::new(Arc::clone(&coordinator), "socket-1");
    let mut client = ReconnectingClient::new(transport, ReconnectPolicy::default());
    client.connect().await.unwrap();
    client.join(receipt.job_id).await.unwrap();

    {
        let subscription = client.transport().subscription(receipt.job_id).unwrap();
        loop {
            match subscription.recv().await {
                Some(JobEvent::Progress(p)) if p.pages_scraped == 2 => break,
                Some(_) => continue,
                None => panic!("stream ended early"),
            }
        }
    }

    client.transport_mut().drop_connection();
    assert_eq!(coordinator.stats().running, 1);
    assert_eq!(client.reconnect().await.unwrap(), 1);
    assert_eq!(client.joined_jobs(), vec![receipt.job_id]);

    let subscription = client.transport().subscription(receipt.job_id).unwrap();
    assert!(subscription.snapshot().pages_scraped >= 2);

    let events = collect(subscription).await;
    assert_eq!(completion(&events).pages_scraped, 6);

    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_outstanding_work() {
    let fixture = ScrapeFixture::new();
    fixture.fetcher.set_fetch_time(Duration::from_secs(2));
    let coordinator = start(test_config(), &fixture);

    let running = coordinator
        .submit(request(
            "alice",
            &["https://s.test/1", "https://s.test/2"],
            PriorityTier::Free,
        ))
        .unwrap();
    let running_sub = coordinator.join(running.job_id, "watcher").unwrap();
    loop {
        match running_sub.recv().await {
            Some(JobEvent::Progress(p)) if p.status == WireStatus::Processing => break,
            Some(_) => continue,
            None => panic!("stream ended early"),
        }
    }
    let queued = coordinator
        .submit(request("bob", &["https://s.test/queued"], PriorityTier::Free))
        .unwrap();

    coordinator.shutdown().await;

    assert_eq!(
        coordinator.status(running.job_id).unwrap().status,
        JobStatus::Cancelled
    );
    assert_eq!(
        coordinator.status(queued.job_id).unwrap().status,
        JobStatus::Cancelled
    );
    assert!(matches!(
        coordinator.submit(request("carol", &["https://s.test/new"], PriorityTier::Free)),
        Err(RelayError::ShuttingDown)
    ));
    assert_eq!(completion(&collect(&running_sub).await).status, WireStatus::Cancelled);
}
