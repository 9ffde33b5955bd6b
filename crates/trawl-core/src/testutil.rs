//! Test utilities: mock implementations of the core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::engine::EngineConfig;
use crate::error::AppError;
use crate::job::{CreateJobRequest, ScrapingJob, ScrapingTarget};
use crate::models::{PageExtract, RawRecord};
use crate::pacing::PacingConfig;
use crate::retry::RetryPolicy;
use crate::traits::{Fetcher, SiteRules};
use crate::worker::{WorkerEvent, WorkerReporter};

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

/// Mock fetcher that pops queued responses, then falls back to a fixed body.
#[derive(Clone)]
pub struct MockFetcher {
    responses: Arc<Mutex<VecDeque<Result<String, AppError>>>>,
    fallback: String,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockFetcher {
    /// Every call returns `html`.
    pub fn new(html: &str) -> Self {
        Self::with_responses(Vec::new()).with_fallback(html)
    }

    pub fn with_error(error: AppError) -> Self {
        Self::with_responses(vec![Err(error)])
    }

    pub fn with_responses(responses: Vec<Result<String, AppError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into())),
            fallback: "<html><body>default</body></html>".to_string(),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_fallback(mut self, html: &str) -> Self {
        self.fallback = html.to_string();
        self
    }

    /// URLs fetched so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl Fetcher for MockFetcher {
    async fn fetch(&self, url: &str) -> Result<String, AppError> {
        self.calls.lock().unwrap().push(url.to_string());
        let next = self.responses.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(self.fallback.clone()))
    }
}

// ---------------------------------------------------------------------------
// MockRules
// ---------------------------------------------------------------------------

/// Site rules serving canned records, one list per page.
#[derive(Clone)]
pub struct MockRules {
    site: String,
    pages: Vec<Vec<RawRecord>>,
    extract_error: Arc<Mutex<Option<AppError>>>,
}

impl MockRules {
    pub fn new(site: &str) -> Self {
        Self {
            site: site.to_string(),
            pages: Vec::new(),
            extract_error: Arc::new(Mutex::new(None)),
        }
    }

    pub fn page(mut self, records: Vec<RawRecord>) -> Self {
        self.pages.push(records);
        self
    }

    /// The next `extract` call fails with `error`.
    pub fn with_extract_error(self, error: AppError) -> Self {
        *self.extract_error.lock().unwrap() = Some(error);
        self
    }

    pub fn record(title: &str, url: &str) -> RawRecord {
        RawRecord::new()
            .with_title(Some(title.to_string()))
            .with_url(Some(url.to_string()))
    }

    fn page_number(url: &str) -> usize {
        url.rsplit('/')
            .next()
            .and_then(|n| n.parse().ok())
            .unwrap_or(1)
    }
}

impl SiteRules for MockRules {
    fn site(&self) -> &str {
        &self.site
    }

    fn page_url(&self, _target: &ScrapingTarget, page: u32) -> Result<Option<String>, AppError> {
        Ok((page as usize <= self.pages.len())
            .then(|| format!("https://mock.test/{}/page/{page}", self.site)))
    }

    fn extract(&self, _html: &str, page_url: &str) -> Result<PageExtract, AppError> {
        if let Some(e) = self.extract_error.lock().unwrap().take() {
            return Err(e);
        }
        let n = Self::page_number(page_url);
        Ok(PageExtract {
            records: self.pages.get(n.saturating_sub(1)).cloned().unwrap_or_default(),
            has_more: n < self.pages.len(),
        })
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Mock worker reporter that records event labels.
#[derive(Default, Clone)]
pub struct MockReporter {
    pub events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, label: &str) -> usize {
        self.events().iter().filter(|e| *e == label).count()
    }
}

impl WorkerReporter for MockReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        let label = match &event {
            WorkerEvent::Started { .. } => "Started",
            WorkerEvent::Polling { .. } => "Polling",
            WorkerEvent::JobClaimed { .. } => "JobClaimed",
            WorkerEvent::JobCompleted { .. } => "JobCompleted",
            WorkerEvent::JobFailed { .. } => "JobFailed",
            WorkerEvent::CancelledWhileRunning { .. } => "CancelledWhileRunning",
            WorkerEvent::Stopped { .. } => "Stopped",
        };
        self.events.lock().unwrap().push(label.to_string());
    }
}

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

pub fn make_test_target() -> ScrapingTarget {
    ScrapingTarget::new("quotes")
        .with_url("https://quotes.toscrape.com/")
        .with_max_pages(2)
        .with_request_delay(0.0)
}

/// A pending normal-priority job owned by `user-1` / `tenant-1`.
pub fn make_test_job() -> ScrapingJob {
    ScrapingJob::from_request(CreateJobRequest::new(
        "user-1",
        "tenant-1",
        "Test job",
        make_test_target(),
    ))
}

/// No pacing and near-instant retries.
pub fn fast_engine_config(max_attempts: u32) -> EngineConfig {
    EngineConfig {
        pacing: PacingConfig::none(),
        retry: RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            jitter: false,
        },
    }
}
