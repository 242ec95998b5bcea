use crate::job::PriorityTier;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Main configuration structure for Scrape-Relay
///
/// Every section is optional in the TOML file and falls back to its defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub workers: WorkerConfig,
    pub retry: RetryConfig,
    pub rate_limit: RateLimitConfig,
    pub broadcast: BroadcastConfig,
    pub fetcher: FetcherConfig,
    pub output: OutputConfig,
    /// Optional per-tier submission quotas, keyed by tier name
    pub quota: BTreeMap<PriorityTier, TierQuota>,
}

/// Job scheduling and admission control
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SchedulerConfig {
    /// Global queue depth at which new submissions are rejected
    pub admission_threshold: usize,

    /// Queue depth below which disabled tiers are re-enabled
    pub recovery_depth: usize,

    /// How long overload must persist before the lowest tier is disabled (milliseconds)
    pub overload_window_ms: u64,

    /// Waiting time that earns a queued job one unit of aging boost (milliseconds)
    pub aging_interval_ms: u64,

    /// Upper bound on the aging boost added to a tier's weight
    pub max_aging_boost: u32,

    /// Weighted round-robin weights per tier
    pub tier_weights: TierWeights,

    /// Maximum number of URLs accepted in one job
    pub max_urls_per_job: usize,

    /// Job-level faults tolerated before the job is failed
    pub max_job_faults: u32,

    /// Optional wall-clock limit for a running job (seconds)
    pub job_timeout_secs: Option<u64>,

    /// How long finished jobs stay queryable (seconds)
    pub retention_secs: u64,

    /// How often expired jobs are purged (seconds)
    pub purge_interval_secs: u64,
}

impl SchedulerConfig {
    pub fn overload_window(&self) -> Duration {
        Duration::from_millis(self.overload_window_ms)
    }

    pub fn aging_interval(&self) -> Duration {
        Duration::from_millis(self.aging_interval_ms)
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_secs.map(Duration::from_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            admission_threshold: 1000,
            recovery_depth: 500,
            overload_window_ms: 30_000,
            aging_interval_ms: 5_000,
            max_aging_boost: 8,
            tier_weights: TierWeights::default(),
            max_urls_per_job: 50,
            max_job_faults: 1,
            job_timeout_secs: Some(30 * 60),
            retention_secs: 3600,
            purge_interval_secs: 60,
        }
    }
}

/// Scheduling weight for each priority tier
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct TierWeights {
    pub free: u32,
    pub starter: u32,
    pub pro: u32,
    pub enterprise: u32,
}

impl TierWeights {
    /// Returns the configured weight for a tier
    pub fn weight(&self, tier: PriorityTier) -> u32 {
        match tier {
            PriorityTier::Free => self.free,
            PriorityTier::Starter => self.starter,
            PriorityTier::Pro => self.pro,
            PriorityTier::Enterprise => self.enterprise,
        }
    }
}

impl Default for TierWeights {
    fn default() -> Self {
        Self {
            free: PriorityTier::Free.rank(),
            starter: PriorityTier::Starter.rank(),
            pro: PriorityTier::Pro.rank(),
            enterprise: PriorityTier::Enterprise.rank(),
        }
    }
}

/// Worker pool sizing and recycling
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct WorkerConfig {
    pub min_workers: usize,
    pub max_workers: usize,

    /// Jobs a worker runs before it is torn down and replaced
    pub max_jobs_per_worker: u32,

    /// Fetcher resource usage above which a worker is recycled
    ///
    /// Units are the fetcher's own; the HTTP fetcher reports response body
    /// bytes received since the worker started.
    pub resource_ceiling: Option<u64>,

    /// Queue depth that must be exceeded for the pool to grow
    pub scale_up_queue_depth: usize,

    /// How long the queue must stay above the scale-up depth (milliseconds)
    pub scale_up_window_ms: u64,

    /// Interval between scaling decisions (milliseconds)
    pub scale_check_interval_ms: u64,

    /// Idle time after which a surplus worker retires (milliseconds)
    pub idle_timeout_ms: u64,
}

impl WorkerConfig {
    pub fn scale_up_window(&self) -> Duration {
        Duration::from_millis(self.scale_up_window_ms)
    }

    pub fn scale_check_interval(&self) -> Duration {
        Duration::from_millis(self.scale_check_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            min_workers: 2,
            max_workers: 8,
            max_jobs_per_worker: 1000,
            resource_ceiling: None,
            scale_up_queue_depth: 10,
            scale_up_window_ms: 2_000,
            scale_check_interval_ms: 250,
            idle_timeout_ms: 60_000,
        }
    }
}

/// Retry and backoff policy for failed fetches
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RetryConfig {
    /// First backoff delay for transient failures (milliseconds)
    pub base_delay_ms: u64,

    /// Cap on any single backoff delay (milliseconds)
    pub max_delay_ms: u64,

    /// Retries allowed after the first attempt for transient failures
    pub transient_max_retries: u32,

    /// First backoff delay after a rate-limit response (milliseconds)
    pub rate_limit_base_delay_ms: u64,

    /// Retries allowed after the first attempt for rate-limit failures
    pub rate_limit_max_retries: u32,

    /// Random spread applied to each delay, as a fraction of the delay
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            transient_max_retries: 3,
            rate_limit_base_delay_ms: 5_000,
            rate_limit_max_retries: 5,
            jitter: 0.2,
        }
    }
}

/// Per-domain request spacing
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RateLimitConfig {
    /// Minimum time between two requests to the same domain (milliseconds)
    pub min_spacing_ms: u64,

    /// Multiplier applied to a domain's spacing after a rate-limit response
    pub penalty_factor: f64,

    /// Upper bound for a penalized spacing (milliseconds)
    pub max_spacing_ms: u64,

    /// How long a penalty lasts without further rate-limit responses (milliseconds)
    pub penalty_cooldown_ms: u64,
}

impl RateLimitConfig {
    pub fn min_spacing(&self) -> Duration {
        Duration::from_millis(self.min_spacing_ms)
    }

    pub fn max_spacing(&self) -> Duration {
        Duration::from_millis(self.max_spacing_ms)
    }

    pub fn penalty_cooldown(&self) -> Duration {
        Duration::from_millis(self.penalty_cooldown_ms)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            min_spacing_ms: 1_000,
            penalty_factor: 2.0,
            max_spacing_ms: 60_000,
            penalty_cooldown_ms: 60_000,
        }
    }
}

/// Progress broadcasting
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BroadcastConfig {
    /// Events buffered per observer before intermediate events are dropped
    pub buffer_capacity: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 64,
        }
    }
}

/// Settings for the built-in HTTP fetcher
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct FetcherConfig {
    /// Name of the crawler
    pub crawler_name: String,

    /// Version of the crawler
    pub crawler_version: String,

    /// URL with information about the crawler
    pub contact_url: Option<String>,

    /// Whole-request timeout (milliseconds)
    pub request_timeout_ms: u64,

    /// Connection timeout (milliseconds)
    pub connect_timeout_ms: u64,
}

impl FetcherConfig {
    /// Formats the User-Agent header: `Name/Version (+ContactURL)`
    pub fn user_agent(&self) -> String {
        match &self.contact_url {
            Some(contact) => format!(
                "{}/{} (+{})",
                self.crawler_name, self.crawler_version, contact
            ),
            None => format!("{}/{}", self.crawler_name, self.crawler_version),
        }
    }
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            crawler_name: "ScrapeRelay".to_string(),
            crawler_version: env!("CARGO_PKG_VERSION").to_string(),
            contact_url: None,
            request_timeout_ms: 30_000,
            connect_timeout_ms: 10_000,
        }
    }
}

/// Output configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct OutputConfig {
    /// Path to the SQLite database that receives scraped pages
    pub database_path: Option<String>,
}

/// Sliding-window page quota for one tier
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TierQuota {
    /// Pages a tenant may submit within the window
    pub pages: u32,

    /// Window length (seconds)
    pub window_secs: u64,
}

impl TierQuota {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}
