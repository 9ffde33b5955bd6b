//! Rate-limited, retrying fetch engine and the page loop built on it.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use crate::error::AppError;
use crate::job::ScrapingTarget;
use crate::models::{ScrapeOutput, ScrapedItem};
use crate::pacing::{Pacer, PacingConfig};
use crate::retry::{RetryAction, RetryPolicy, retry_with_backoff};
use crate::traits::{Fetcher, SiteRules};

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub pacing: PacingConfig,
    pub retry: RetryPolicy,
}

/// One engine per scrape: its pacer tracks that scrape's request history.
pub struct FetchEngine<F> {
    fetcher: F,
    pacer: Pacer,
    retry: RetryPolicy,
}

impl<F: Fetcher> FetchEngine<F> {
    pub fn new(fetcher: F, config: EngineConfig) -> Self {
        Self {
            fetcher,
            pacer: Pacer::new(config.pacing),
            retry: config.retry,
        }
    }

    /// Fetch `url`, pacing every attempt and retrying transient failures.
    ///
    /// [`AppError::RateLimited`] is surfaced on the first occurrence with
    /// its retry-after hint; the engine never waits it out.
    pub async fn fetch(&self, url: &str) -> Result<String, AppError> {
        retry_with_backoff(&self.retry, |attempt| async move {
            self.pacer.wait().await;
            tracing::debug!(%url, attempt = attempt + 1, "Fetching");
            match self.fetcher.fetch(url).await {
                Ok(body) => RetryAction::Success(body),
                Err(e @ AppError::RateLimited { .. }) => RetryAction::Fail(e),
                Err(e) if e.is_retryable() => RetryAction::Retry(e),
                Err(e) => RetryAction::Fail(e),
            }
        })
        .await
    }
}

/// Progress after each processed page.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageProgress {
    pub page: u32,
    pub max_pages: u32,
    pub items_found: u64,
}

impl PageProgress {
    pub fn percentage(&self) -> f64 {
        if self.max_pages == 0 {
            return 100.0;
        }
        (f64::from(self.page) / f64::from(self.max_pages) * 100.0).min(100.0)
    }
}

/// Site rules bound to a fetch engine; what the registry hands out.
pub struct Scraper<F> {
    rules: Arc<dyn SiteRules>,
    engine: FetchEngine<F>,
}

impl<F: Fetcher> Scraper<F> {
    pub fn new(rules: Arc<dyn SiteRules>, engine: FetchEngine<F>) -> Self {
        Self { rules, engine }
    }

    pub fn site(&self) -> &str {
        self.rules.site()
    }

    /// Walk the target's pages and collect validated, de-duplicated items.
    ///
    /// Fetch and parse failures abort the scrape. A record that fails
    /// validation is recorded as a warning and the page carries on.
    /// `on_page` runs after every processed page; its error aborts too.
    pub async fn scrape<P, Fut>(
        &self,
        target: &ScrapingTarget,
        mut on_page: P,
    ) -> Result<ScrapeOutput, AppError>
    where
        P: FnMut(PageProgress) -> Fut,
        Fut: Future<Output = Result<(), AppError>>,
    {
        let max_pages = target.max_pages.max(1);
        let mut output = ScrapeOutput::default();
        let mut seen = HashSet::new();

        for page in 1..=max_pages {
            let Some(url) = self.rules.page_url(target, page)? else {
                break;
            };
            let html = self.engine.fetch(&url).await?;
            let extract = self.rules.extract(&html, &url)?;
            output.pages_processed += 1;

            for (index, raw) in extract.records.into_iter().enumerate() {
                output.records_extracted += 1;
                match ScrapedItem::try_from(raw) {
                    Ok(item) => {
                        output.valid_records += 1;
                        if seen.insert(item.content_hash.clone()) {
                            output.items.push(item);
                        } else {
                            output.duplicates += 1;
                        }
                    }
                    Err(AppError::Validation(msg)) => {
                        output
                            .warnings
                            .push(format!("page {page} record {index}: {msg}"));
                    }
                    Err(e) => {
                        output
                            .errors
                            .push(format!("page {page} record {index}: {e}"));
                    }
                }
            }

            tracing::debug!(
                site = self.rules.site(),
                page,
                items = output.items.len(),
                "Page processed"
            );
            on_page(PageProgress {
                page,
                max_pages,
                items_found: output.items.len() as u64,
            })
            .await?;

            if !extract.has_more {
                break;
            }
        }

        Ok(output)
    }
}
