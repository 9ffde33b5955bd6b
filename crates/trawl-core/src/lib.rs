pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod handler;
pub mod job;
pub mod job_queue;
pub mod manager;
pub mod memory;
pub mod models;
pub mod pacing;
pub mod registry;
pub mod retry;
pub mod sink;
pub mod store;
pub mod traits;
pub mod worker;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::TrawlConfig;
pub use context::AppContext;
pub use engine::{EngineConfig, FetchEngine, PageProgress, Scraper};
pub use error::AppError;
pub use handler::ScrapeJobHandler;
pub use job::{
    CreateJobRequest, JobFilter, JobResult, JobStatus, Priority, QueueStats, ScrapingJob,
    ScrapingTarget,
};
pub use job_queue::{CleanupReport, JobQueue, QueueKeys};
pub use manager::JobManager;
pub use memory::MemoryStore;
pub use models::{PageExtract, RawRecord, ScrapeOutput, ScrapedItem, compute_hash};
pub use registry::ScraperRegistry;
pub use sink::JsonLinesSink;
pub use store::SharedStore;
pub use traits::{Fetcher, ItemSink, NullSink, SiteRules};
pub use worker::{TracingWorkerReporter, WorkerConfig, WorkerEvent, WorkerReporter};
