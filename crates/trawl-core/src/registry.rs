//! Site registry: maps a site key or a URL's domain to extraction rules.
//!
//! Sites are registered explicitly at startup. Resolution tries the
//! target's site key first, then the domain of its URL against each
//! registration's patterns in registration order; the first match wins.

use std::sync::Arc;

use url::Url;

use crate::engine::{EngineConfig, FetchEngine, Scraper};
use crate::error::AppError;
use crate::job::ScrapingTarget;
use crate::traits::{Fetcher, SiteRules};

/// Builds a fresh rules instance for one scrape.
pub type RulesConstructor = Arc<dyn Fn() -> Arc<dyn SiteRules> + Send + Sync>;

struct SiteEntry {
    site: String,
    domains: Vec<String>,
    constructor: RulesConstructor,
}

impl SiteEntry {
    /// `host` equals a pattern or is a subdomain of one.
    fn matches_host(&self, host: &str) -> bool {
        self.domains.iter().any(|domain| {
            host == domain
                || host
                    .strip_suffix(domain.as_str())
                    .is_some_and(|rest| rest.ends_with('.'))
        })
    }
}

pub struct ScraperRegistry<F> {
    fetcher: F,
    config: EngineConfig,
    entries: Vec<SiteEntry>,
}

impl<F: Fetcher> ScraperRegistry<F> {
    pub fn new(fetcher: F, config: EngineConfig) -> Self {
        Self {
            fetcher,
            config,
            entries: Vec::new(),
        }
    }

    /// Register `site` under its key and the given domain patterns.
    ///
    /// Keys are unique; registering one twice is an error.
    pub fn register<C>(&mut self, site: &str, domains: &[&str], constructor: C) -> Result<(), AppError>
    where
        C: Fn() -> Arc<dyn SiteRules> + Send + Sync + 'static,
    {
        if self.entries.iter().any(|e| e.site == site) {
            return Err(AppError::Config(format!("site '{site}' is already registered")));
        }
        self.entries.push(SiteEntry {
            site: site.to_string(),
            domains: domains.iter().map(|d| d.to_ascii_lowercase()).collect(),
            constructor: Arc::new(constructor),
        });
        tracing::debug!(%site, ?domains, "Registered site");
        Ok(())
    }

    /// Registered site keys in registration order.
    pub fn sites(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.site.as_str()).collect()
    }

    fn entry_for_url(&self, url: &str) -> Option<&SiteEntry> {
        let parsed = Url::parse(url).ok()?;
        let host = parsed.host_str()?.to_ascii_lowercase();
        self.entries.iter().find(|e| e.matches_host(&host))
    }

    /// Site key that would serve `url`, if any.
    pub fn site_for_url(&self, url: &str) -> Option<&str> {
        self.entry_for_url(url).map(|e| e.site.as_str())
    }

    pub fn supports_url(&self, url: &str) -> bool {
        self.entry_for_url(url).is_some()
    }

    /// Build a scraper for `target` with its own fetch engine.
    ///
    /// The engine's pacing floor is raised to the target's request delay.
    pub fn resolve(&self, target: &ScrapingTarget) -> Result<Scraper<F>, AppError> {
        let entry = self
            .entries
            .iter()
            .find(|e| e.site == target.site)
            .or_else(|| target.url.as_deref().and_then(|u| self.entry_for_url(u)))
            .ok_or_else(|| {
                AppError::UnsupportedSite(target.url.clone().unwrap_or_else(|| target.site.clone()))
            })?;

        let config = EngineConfig {
            pacing: self.config.pacing.for_target(target),
            retry: self.config.retry.clone(),
        };
        let engine = FetchEngine::new(self.fetcher.clone(), config);
        Ok(Scraper::new((entry.constructor)(), engine))
    }
}
