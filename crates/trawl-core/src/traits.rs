use std::future::Future;

use uuid::Uuid;

use crate::error::AppError;
use crate::job::ScrapingTarget;
use crate::models::{PageExtract, ScrapedItem};

/// Fetches raw HTML content from a URL.
///
/// A single call is a single attempt; pacing and retries live in the
/// [`FetchEngine`](crate::engine::FetchEngine). Implementations report a
/// 429 as [`AppError::RateLimited`].
pub trait Fetcher: Send + Sync + Clone {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<String, AppError>> + Send;
}

/// Per-site extraction rules.
///
/// Extraction is synchronous so parsed documents never live across an
/// await point.
pub trait SiteRules: Send + Sync {
    /// Registry key of the site these rules serve.
    fn site(&self) -> &str;

    /// URL of the 1-based `page` for `target`, or `None` past the last page.
    fn page_url(&self, target: &ScrapingTarget, page: u32) -> Result<Option<String>, AppError>;

    /// Pull raw records out of a fetched page.
    ///
    /// Missing elements yield `None` fields, not errors; only markup that
    /// cannot be processed at all is an [`AppError::Parsing`].
    fn extract(&self, html: &str, page_url: &str) -> Result<PageExtract, AppError>;
}

/// Destination for a finished job's items.
pub trait ItemSink: Send + Sync + Clone {
    /// Write the items and return where they went, if anywhere.
    fn write(
        &self,
        job_id: Uuid,
        items: &[ScrapedItem],
    ) -> impl Future<Output = Result<Option<String>, AppError>> + Send;
}

/// A no-op ItemSink for use when output is not needed.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl ItemSink for NullSink {
    async fn write(&self, _job_id: Uuid, _items: &[ScrapedItem]) -> Result<Option<String>, AppError> {
        Ok(None)
    }
}
