use std::sync::Arc;

use crate::config::TrawlConfig;
use crate::error::AppError;
use crate::handler::ScrapeJobHandler;
use crate::job_queue::{JobQueue, QueueKeys};
use crate::manager::JobManager;
use crate::registry::ScraperRegistry;
use crate::store::SharedStore;
use crate::traits::{Fetcher, ItemSink, NullSink};

/// Everything a process needs, built once at startup and passed down.
pub struct AppContext<S, F, K = NullSink> {
    config: TrawlConfig,
    manager: JobManager<S>,
    registry: Arc<ScraperRegistry<F>>,
    sink: K,
}

impl<S, F, K> AppContext<S, F, K>
where
    S: SharedStore + 'static,
    F: Fetcher + 'static,
    K: ItemSink + 'static,
{
    pub fn new(config: TrawlConfig, store: S, registry: ScraperRegistry<F>, sink: K) -> Self {
        let queue = JobQueue::with_keys(store, QueueKeys::new(config.key_prefix.clone()));
        let manager = JobManager::new(queue, config.worker_config());
        Self {
            config,
            manager,
            registry: Arc::new(registry),
            sink,
        }
    }

    pub fn config(&self) -> &TrawlConfig {
        &self.config
    }

    pub fn manager(&self) -> &JobManager<S> {
        &self.manager
    }

    pub fn registry(&self) -> &ScraperRegistry<F> {
        &self.registry
    }

    pub fn scrape_handler(&self) -> ScrapeJobHandler<S, F, K> {
        ScrapeJobHandler::new(
            self.manager.clone(),
            Arc::clone(&self.registry),
            self.sink.clone(),
        )
    }

    /// Register a dispatch loop whose jobs are run by the scrape handler.
    pub fn spawn_scrape_worker(&self, worker_id: &str) -> Result<(), AppError> {
        let handler = self.scrape_handler();
        self.manager.register_worker(worker_id, move |job| {
            let handler = handler.clone();
            async move { handler.handle(job).await }
        })
    }

    /// Stop every worker loop registered through this context.
    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
    }
}
