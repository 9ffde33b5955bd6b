use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a scraping job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Retrying,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
        JobStatus::Retrying,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Retrying => "retrying",
        }
    }

    /// Statuses after which no worker holds the job.
    ///
    /// `Failed` counts as terminal here even though a retry may revive it.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Statuses whose id sits in a priority list waiting for a worker.
    pub fn is_queued(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Retrying)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            "retrying" => Ok(JobStatus::Retrying),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

/// Scheduling priority. Higher priorities are always served first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    /// Order in which the priority lists are checked on dequeue.
    pub const DEQUEUE_ORDER: [Priority; 4] = [
        Priority::Urgent,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            _ => Err(format!("Unknown priority: {}", s)),
        }
    }
}

fn default_max_pages() -> u32 {
    1
}

fn default_request_delay() -> f64 {
    1.0
}

/// What to crawl. Immutable once attached to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapingTarget {
    /// Registry key of the site (e.g. `"books"`).
    pub site: String,
    /// Direct URL; when set it overrides the site's start URL.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub search_criteria: BTreeMap<String, String>,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    /// Minimum seconds between consecutive requests.
    #[serde(default = "default_request_delay")]
    pub request_delay: f64,
}

impl ScrapingTarget {
    pub fn new(site: impl Into<String>) -> Self {
        Self {
            site: site.into(),
            url: None,
            search_criteria: BTreeMap::new(),
            max_pages: default_max_pages(),
            request_delay: default_request_delay(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_criterion(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.search_criteria.insert(key.into(), value.into());
        self
    }

    pub fn with_max_pages(mut self, pages: u32) -> Self {
        self.max_pages = pages;
        self
    }

    pub fn with_request_delay(mut self, secs: f64) -> Self {
        self.request_delay = secs;
        self
    }

    pub fn request_delay(&self) -> Duration {
        if self.request_delay.is_finite() && self.request_delay > 0.0 {
            Duration::from_secs_f64(self.request_delay)
        } else {
            Duration::ZERO
        }
    }
}

/// A scraping job as persisted in the shared store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapingJob {
    pub id: Uuid,
    pub user_id: String,
    pub tenant_id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub target: ScrapingTarget,
    pub priority: Priority,
    pub status: JobStatus,
    pub max_retries: u32,
    pub current_retry: u32,
    /// Seconds to wait before an automatic retry.
    pub retry_delay: u64,
    pub progress_percentage: f64,
    pub pages_processed: u32,
    pub items_found: u64,
    pub last_error: Option<String>,
    pub error_count: u32,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Worker currently holding the job, if any.
    #[serde(default)]
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ScrapingJob {
    /// Build a new pending job from a creation request.
    pub fn from_request(request: CreateJobRequest) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: request.user_id,
            tenant_id: request.tenant_id,
            title: request.title,
            description: request.description,
            target: request.target,
            priority: request.priority,
            status: JobStatus::Pending,
            max_retries: request.max_retries,
            current_retry: 0,
            retry_delay: request.retry_delay,
            progress_percentage: 0.0,
            pages_processed: 0,
            items_found: 0,
            last_error: None,
            error_count: 0,
            metadata: request.metadata,
            worker_id: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// A failed job may be retried while retries remain.
    pub fn can_retry(&self) -> bool {
        self.status == JobStatus::Failed && self.current_retry < self.max_retries
    }

    /// True when the given user/tenant pair owns this job.
    pub fn is_owned_by(&self, user_id: &str, tenant_id: &str) -> bool {
        self.user_id == user_id && self.tenant_id == tenant_id
    }

    /// Delay before the next automatic retry: `retry_delay * 2^current_retry`, capped.
    pub fn next_retry_delay(&self, cap: Duration) -> Duration {
        let multiplier = 1u32.checked_shl(self.current_retry).unwrap_or(u32::MAX);
        Duration::from_secs(self.retry_delay)
            .checked_mul(multiplier)
            .unwrap_or(cap)
            .min(cap)
    }

    pub fn set_progress(&mut self, percentage: f64) {
        self.progress_percentage = if percentage.is_nan() {
            0.0
        } else {
            percentage.clamp(0.0, 100.0)
        };
    }
}

/// Request to create a new scraping job.
#[derive(Debug, Clone)]
pub struct CreateJobRequest {
    pub user_id: String,
    pub tenant_id: String,
    pub title: String,
    pub description: Option<String>,
    pub target: ScrapingTarget,
    pub priority: Priority,
    pub max_retries: u32,
    pub retry_delay: u64,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl CreateJobRequest {
    pub fn new(
        user_id: impl Into<String>,
        tenant_id: impl Into<String>,
        title: impl Into<String>,
        target: ScrapingTarget,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            tenant_id: tenant_id.into(),
            title: title.into(),
            description: None,
            target,
            priority: Priority::Normal,
            max_retries: 3,
            retry_delay: 60,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn with_retry_delay(mut self, secs: u64) -> Self {
        self.retry_delay = secs;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Outcome record of a finished run. Written once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: Uuid,
    pub items_scraped: u64,
    pub pages_processed: u32,
    pub data_size_bytes: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub success_rate: f64,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub output_location: Option<String>,
}

impl JobResult {
    pub fn duration(&self) -> Duration {
        (self.completed_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }
}

/// Aggregate queue statistics, recomputed from the job set on demand.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total_jobs: u64,
    pub by_status: BTreeMap<JobStatus, u64>,
    pub queue_depth: u64,
    pub depth_by_priority: BTreeMap<Priority, u64>,
    pub active_workers: u64,
    pub average_duration_secs: Option<f64>,
    pub success_rate: Option<f64>,
}

impl QueueStats {
    pub fn count(&self, status: JobStatus) -> u64 {
        self.by_status.get(&status).copied().unwrap_or(0)
    }

    pub fn status_total(&self) -> u64 {
        self.by_status.values().sum()
    }
}

/// In-memory filter applied by `list_jobs`.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub priority: Option<Priority>,
    pub user_id: Option<String>,
    pub tenant_id: Option<String>,
    pub site: Option<String>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl JobFilter {
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn for_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn for_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_site(mut self, site: impl Into<String>) -> Self {
        self.site = Some(site.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn matches(&self, job: &ScrapingJob) -> bool {
        self.status.is_none_or(|s| job.status == s)
            && self.priority.is_none_or(|p| job.priority == p)
            && self.user_id.as_deref().is_none_or(|u| job.user_id == u)
            && self.tenant_id.as_deref().is_none_or(|t| job.tenant_id == t)
            && self.site.as_deref().is_none_or(|s| job.target.site == s)
    }
}
