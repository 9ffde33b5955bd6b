use std::sync::Arc;

use chrono::Utc;

use crate::engine::PageProgress;
use crate::error::AppError;
use crate::job::{JobResult, ScrapingJob};
use crate::manager::JobManager;
use crate::registry::ScraperRegistry;
use crate::store::SharedStore;
use crate::traits::{Fetcher, ItemSink};

/// Worker callback that scrapes a job's target.
///
/// Resolves the site, walks its pages while reporting progress, hands the
/// items to the sink, and returns the run's [`JobResult`]. Completion and
/// failure bookkeeping is left to the dispatch loop.
pub struct ScrapeJobHandler<S, F, K> {
    manager: JobManager<S>,
    registry: Arc<ScraperRegistry<F>>,
    sink: K,
}

impl<S: Clone, F, K: Clone> Clone for ScrapeJobHandler<S, F, K> {
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
            registry: Arc::clone(&self.registry),
            sink: self.sink.clone(),
        }
    }
}

impl<S, F, K> ScrapeJobHandler<S, F, K>
where
    S: SharedStore + 'static,
    F: Fetcher + 'static,
    K: ItemSink + 'static,
{
    pub fn new(manager: JobManager<S>, registry: Arc<ScraperRegistry<F>>, sink: K) -> Self {
        Self {
            manager,
            registry,
            sink,
        }
    }

    pub async fn handle(&self, job: ScrapingJob) -> Result<JobResult, AppError> {
        let started_at = job.started_at.unwrap_or_else(Utc::now);
        let job_id = job.id;
        let scraper = self.registry.resolve(&job.target)?;
        tracing::debug!(%job_id, site = scraper.site(), "Scraper resolved");

        let manager = &self.manager;
        let output = scraper
            .scrape(&job.target, |progress: PageProgress| async move {
                manager
                    .update_job_progress(
                        job_id,
                        progress.percentage(),
                        progress.page,
                        progress.items_found,
                    )
                    .await
                    .map(|_| ())
            })
            .await?;

        let data_size_bytes = output
            .items
            .iter()
            .map(|item| serde_json::to_vec(item).map(|bytes| bytes.len() as u64))
            .sum::<Result<u64, _>>()?;
        let output_location = self.sink.write(job_id, &output.items).await?;

        if output.duplicates > 0 {
            tracing::debug!(%job_id, duplicates = output.duplicates, "Dropped duplicate items");
        }

        Ok(JobResult {
            job_id,
            items_scraped: output.items.len() as u64,
            pages_processed: output.pages_processed,
            data_size_bytes,
            started_at,
            completed_at: Utc::now(),
            success_rate: output.success_rate(),
            errors: output.errors,
            warnings: output.warnings,
            output_location,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{CreateJobRequest, JobStatus, ScrapingTarget};
    use crate::job_queue::JobQueue;
    use crate::memory::MemoryStore;
    use crate::sink::JsonLinesSink;
    use crate::testutil::{MockFetcher, MockRules, fast_engine_config};
    use crate::traits::NullSink;
    use crate::worker::WorkerConfig;

    fn registry(fetcher: MockFetcher) -> Arc<ScraperRegistry<MockFetcher>> {
        let mut registry = ScraperRegistry::new(fetcher, fast_engine_config(1));
        registry
            .register("quotes", &["quotes.toscrape.com"], || {
                Arc::new(
                    MockRules::new("quotes")
                        .page(vec![
                            MockRules::record("Einstein", "https://quotes.toscrape.com/1"),
                            MockRules::record("", "https://quotes.toscrape.com/2"),
                        ])
                        .page(vec![MockRules::record(
                            "Austen",
                            "https://quotes.toscrape.com/3",
                        )]),
                )
            })
            .unwrap();
        Arc::new(registry)
    }

    async fn claimed_job(manager: &JobManager<MemoryStore>, target: ScrapingTarget) -> ScrapingJob {
        manager
            .create_job(CreateJobRequest::new("user-1", "tenant-1", "t", target))
            .await
            .unwrap();
        manager
            .queue()
            .dequeue("w1", std::time::Duration::ZERO)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn handle_builds_result_and_reports_progress() {
        let manager = JobManager::new(JobQueue::new(MemoryStore::new()), WorkerConfig::default());
        let dir = tempfile::tempdir().unwrap();
        let handler = ScrapeJobHandler::new(
            manager.clone(),
            registry(MockFetcher::new("<html/>")),
            JsonLinesSink::new(dir.path()),
        );
        let job = claimed_job(&manager, ScrapingTarget::new("quotes").with_max_pages(2)).await;

        let result = handler.handle(job.clone()).await.unwrap();
        assert_eq!(result.job_id, job.id);
        assert_eq!(result.items_scraped, 2);
        assert_eq!(result.pages_processed, 2);
        assert!((result.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.data_size_bytes > 0);
        let location = result.output_location.unwrap();
        assert_eq!(std::fs::read_to_string(location).unwrap().lines().count(), 2);

        let stored = manager.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Running);
        assert_eq!(stored.progress_percentage, 100.0);
        assert_eq!(stored.pages_processed, 2);
        assert_eq!(stored.items_found, 2);
    }

    #[tokio::test]
    async fn unsupported_site_fails_fast() {
        let manager = JobManager::new(JobQueue::new(MemoryStore::new()), WorkerConfig::default());
        let fetcher = MockFetcher::new("<html/>");
        let handler = ScrapeJobHandler::new(manager.clone(), registry(fetcher.clone()), NullSink);
        let job = claimed_job(&manager, ScrapingTarget::new("nowhere")).await;

        let err = handler.handle(job).await.unwrap_err();
        assert!(matches!(err, AppError::UnsupportedSite(_)));
        assert!(fetcher.calls().is_empty());
    }

    #[tokio::test]
    async fn empty_run_has_full_success_rate() {
        let manager = JobManager::new(JobQueue::new(MemoryStore::new()), WorkerConfig::default());
        let mut registry = ScraperRegistry::new(MockFetcher::new("<html/>"), fast_engine_config(1));
        registry
            .register("empty", &[], || Arc::new(MockRules::new("empty").page(vec![])))
            .unwrap();
        let handler = ScrapeJobHandler::new(manager.clone(), Arc::new(registry), NullSink);
        let job = claimed_job(&manager, ScrapingTarget::new("empty")).await;

        let result = handler.handle(job).await.unwrap();
        assert_eq!(result.items_scraped, 0);
        assert_eq!(result.success_rate, 1.0);
        assert!(result.output_location.is_none());
    }
}
