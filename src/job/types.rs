use crate::job::dedup::DedupKey;
use crate::retry::RetryCounts;
use crate::state::{JobStatus, UrlState};
use crate::worker::WorkerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use url::Url;
use uuid::Uuid;

/// Opaque job identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generates a fresh random identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Subscription-level scheduling class
///
/// Variants are declared from lowest to highest so the derived ordering
/// matches scheduling precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityTier {
    Free,
    Starter,
    Pro,
    Enterprise,
}

impl PriorityTier {
    /// Rank of the tier, 1 (free) to 4 (enterprise)
    pub fn rank(&self) -> u32 {
        match self {
            Self::Free => 1,
            Self::Starter => 2,
            Self::Pro => 3,
            Self::Enterprise => 4,
        }
    }

    /// Position of the tier in per-tier arrays
    pub fn index(&self) -> usize {
        self.rank() as usize - 1
    }

    /// All tiers from lowest to highest
    pub fn all() -> [PriorityTier; 4] {
        [Self::Free, Self::Starter, Self::Pro, Self::Enterprise]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Starter => "starter",
            Self::Pro => "pro",
            Self::Enterprise => "enterprise",
        }
    }
}

impl fmt::Display for PriorityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PriorityTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "starter" => Ok(Self::Starter),
            "pro" => Ok(Self::Pro),
            "enterprise" => Ok(Self::Enterprise),
            other => Err(format!("unknown priority tier: {}", other)),
        }
    }
}

/// How much rendering work the fetcher should put into a page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrapeMode {
    /// No JavaScript, basic HTML
    Fast,
    /// JavaScript enabled, standard wait
    #[default]
    Standard,
    /// JavaScript enabled, comprehensive wait
    Thorough,
    /// Anti-detection measures
    Stealth,
}

impl ScrapeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Standard => "standard",
            Self::Thorough => "thorough",
            Self::Stealth => "stealth",
        }
    }
}

/// Per-job settings handed to the page fetcher
///
/// Part of the dedup key: two submissions only collapse when they ask for the
/// same URLs with the same settings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrapeConfig {
    pub mode: ScrapeMode,
    pub js_enabled: bool,
    pub wait_for_timeout_ms: u64,
    pub page_timeout_ms: u64,
    pub screenshot: bool,
    pub extract_links: bool,
    pub extract_images: bool,
    pub bypass_cloudflare: bool,
    pub user_agent: Option<String>,
}

impl ScrapeConfig {
    pub const MAX_WAIT_FOR_TIMEOUT_MS: u64 = 30_000;
    pub const MIN_PAGE_TIMEOUT_MS: u64 = 5_000;
    pub const MAX_PAGE_TIMEOUT_MS: u64 = 120_000;

    /// Checks that every setting is within its accepted range
    pub fn validate(&self) -> Result<(), String> {
        if self.wait_for_timeout_ms > Self::MAX_WAIT_FOR_TIMEOUT_MS {
            return Err(format!(
                "wait_for_timeout_ms must be <= {}, got {}",
                Self::MAX_WAIT_FOR_TIMEOUT_MS,
                self.wait_for_timeout_ms
            ));
        }

        if !(Self::MIN_PAGE_TIMEOUT_MS..=Self::MAX_PAGE_TIMEOUT_MS).contains(&self.page_timeout_ms)
        {
            return Err(format!(
                "page_timeout_ms must be between {} and {}, got {}",
                Self::MIN_PAGE_TIMEOUT_MS,
                Self::MAX_PAGE_TIMEOUT_MS,
                self.page_timeout_ms
            ));
        }

        if matches!(&self.user_agent, Some(ua) if ua.trim().is_empty()) {
            return Err("user_agent must not be blank when set".to_string());
        }

        Ok(())
    }

    /// Stable textual form used when hashing the dedup key
    pub fn canonical(&self) -> String {
        format!(
            "mode={};js={};wait={};timeout={};screenshot={};links={};images={};cloudflare={};ua={}",
            self.mode.as_str(),
            self.js_enabled,
            self.wait_for_timeout_ms,
            self.page_timeout_ms,
            self.screenshot,
            self.extract_links,
            self.extract_images,
            self.bypass_cloudflare,
            self.user_agent.as_deref().unwrap_or("")
        )
    }
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            mode: ScrapeMode::Standard,
            js_enabled: true,
            wait_for_timeout_ms: 2_000,
            page_timeout_ms: 30_000,
            screenshot: false,
            extract_links: true,
            extract_images: true,
            bypass_cloudflare: true,
            user_agent: None,
        }
    }
}

/// Classification of an error recorded against a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Overload,
    TransientFetch,
    RateLimit,
    PermanentFetch,
    Cancellation,
    WorkerFault,
}

impl ErrorKind {
    /// Name used as `error_type` in error events
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation_error",
            Self::Overload => "overload_error",
            Self::TransientFetch => "transient_fetch_error",
            Self::RateLimit => "rate_limit_error",
            Self::PermanentFetch => "permanent_fetch_error",
            Self::Cancellation => "cancellation_error",
            Self::WorkerFault => "worker_fault",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An error recorded in a job's append-only error log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    /// The URL the error belongs to, None for job-level errors
    pub url: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
}

impl JobError {
    pub fn for_url(url: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            kind,
            message: message.into(),
        }
    }

    pub fn for_job(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            url: None,
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.url {
            Some(url) => write!(f, "{}: {}", url, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Progress of one URL of a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlProgress {
    pub url: String,
    pub state: UrlState,
    /// Fetch attempts made so far
    pub attempts: u32,
    /// Retries already spent, carried across re-dispatches
    pub retries: RetryCounts,
    pub last_error: Option<String>,
}

impl UrlProgress {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            state: UrlState::Pending,
            attempts: 0,
            retries: RetryCounts::default(),
            last_error: None,
        }
    }
}

/// A scraping job
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub tenant_id: String,
    pub tier: PriorityTier,
    pub dedup_key: DedupKey,
    pub status: JobStatus,
    pub config: ScrapeConfig,

    /// Ordered progress of every target URL
    pub per_url: Vec<UrlProgress>,

    /// Percentage of settled URLs, never decreases while the job is live
    pub progress: u8,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Append-only error log
    pub errors: Vec<JobError>,

    /// Tenants that submitted this job; the creator comes first
    pub submitters: Vec<String>,

    /// Job-level faults seen so far
    pub faults: u32,

    /// Worker that most recently ran the job
    pub worker_id: Option<WorkerId>,
}

impl Job {
    /// Creates a job in `pending` state
    pub fn new(
        tenant_id: impl Into<String>,
        tier: PriorityTier,
        dedup_key: DedupKey,
        urls: &[Url],
        config: ScrapeConfig,
    ) -> Self {
        let tenant_id = tenant_id.into();
        Self {
            id: JobId::new(),
            submitters: vec![tenant_id.clone()],
            tenant_id,
            tier,
            dedup_key,
            status: JobStatus::Pending,
            config,
            per_url: urls.iter().map(|u| UrlProgress::new(u.as_str())).collect(),
            progress: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            errors: Vec::new(),
            faults: 0,
            worker_id: None,
        }
    }

    /// Target URLs in submission order
    pub fn urls(&self) -> impl Iterator<Item = &str> {
        self.per_url.iter().map(|p| p.url.as_str())
    }

    pub fn total_pages(&self) -> u32 {
        self.per_url.len() as u32
    }

    /// Number of URLs fetched successfully
    pub fn pages_scraped(&self) -> u32 {
        self.count_in(UrlState::Done)
    }

    /// Number of URLs that failed for good
    pub fn pages_failed(&self) -> u32 {
        self.count_in(UrlState::Failed)
    }

    fn count_in(&self, state: UrlState) -> u32 {
        self.per_url.iter().filter(|p| p.state == state).count() as u32
    }

    /// Looks up the progress entry of a URL
    pub fn url_progress_mut(&mut self, url: &str) -> Option<&mut UrlProgress> {
        self.per_url.iter_mut().find(|p| p.url == url)
    }

    /// Returns true once every URL is done or failed
    pub fn all_urls_settled(&self) -> bool {
        self.per_url.iter().all(|p| p.state.is_settled())
    }

    /// Recomputes `progress` from the settled URL count without letting it go down
    pub fn refresh_progress(&mut self) -> u8 {
        let total = self.per_url.len() as u32;
        let computed = if total == 0 {
            100
        } else {
            ((self.pages_scraped() + self.pages_failed()) * 100 / total) as u8
        };
        self.progress = self.progress.max(computed);
        self.progress
    }

    /// Error log rendered as strings for events
    pub fn error_messages(&self) -> Vec<String> {
        self.errors.iter().map(|e| e.to_string()).collect()
    }

    /// Seconds between start and completion, if both are known
    pub fn duration_secs(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => {
                Some((end - start).num_milliseconds().max(0) as f64 / 1000.0)
            }
            _ => None,
        }
    }
}

/// A request to scrape a set of URLs
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub tenant_id: String,
    pub urls: Vec<String>,
    pub config: ScrapeConfig,
    pub tier: PriorityTier,
}

impl SubmitRequest {
    /// Creates a request using the default scrape settings
    pub fn new<I, S>(tenant_id: impl Into<String>, urls: I, tier: PriorityTier) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tenant_id: tenant_id.into(),
            urls: urls.into_iter().map(Into::into).collect(),
            config: ScrapeConfig::default(),
            tier,
        }
    }

    pub fn with_config(mut self, config: ScrapeConfig) -> Self {
        self.config = config;
        self
    }
}

/// Result of a successful submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub job_id: JobId,
    /// True when the submission joined an identical job already in flight
    pub attached: bool,
}
