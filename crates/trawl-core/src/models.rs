use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::AppError;

/// A record as pulled out of markup, before validation.
///
/// Every field is optional: extraction helpers return `None` for elements
/// the page lacked instead of failing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub title: Option<String>,
    pub url: Option<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, serde_json::Value>,
}

impl RawRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_title(mut self, title: Option<String>) -> Self {
        self.title = title;
        self
    }

    pub fn with_url(mut self, url: Option<String>) -> Self {
        self.url = url;
        self
    }

    /// Set a field; `None` values are skipped.
    pub fn with_field(mut self, key: &str, value: Option<impl Into<serde_json::Value>>) -> Self {
        if let Some(value) = value {
            self.fields.insert(key.to_string(), value.into());
        }
        self
    }
}

/// A validated item ready to be written out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapedItem {
    pub title: String,
    pub url: String,
    pub fields: BTreeMap<String, serde_json::Value>,
    /// SHA-256 of `url` and `title`, used to drop duplicates within a run.
    pub content_hash: String,
    pub scraped_at: DateTime<Utc>,
}

impl TryFrom<RawRecord> for ScrapedItem {
    type Error = AppError;

    /// Fails with [`AppError::Validation`] when the title is blank or the
    /// URL is not an absolute http(s) URL.
    fn try_from(raw: RawRecord) -> Result<Self, Self::Error> {
        let title = raw
            .title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AppError::Validation("missing title".into()))?;

        let url = raw
            .url
            .ok_or_else(|| AppError::Validation(format!("'{title}': missing url")))?;
        let parsed = Url::parse(&url)
            .map_err(|e| AppError::Validation(format!("'{title}': invalid url '{url}': {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(AppError::Validation(format!(
                "'{title}': unsupported url scheme '{}'",
                parsed.scheme()
            )));
        }

        let url = String::from(parsed);
        Ok(Self {
            content_hash: compute_hash(&format!("{url}\n{title}")),
            title,
            url,
            fields: raw.fields,
            scraped_at: Utc::now(),
        })
    }
}

/// Records extracted from one page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageExtract {
    pub records: Vec<RawRecord>,
    /// False when the page shows there is nothing further to fetch.
    pub has_more: bool,
}

/// Everything a scrape produced across its pages.
#[derive(Debug, Clone, Default)]
pub struct ScrapeOutput {
    pub items: Vec<ScrapedItem>,
    pub pages_processed: u32,
    pub records_extracted: u64,
    pub valid_records: u64,
    pub duplicates: u64,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ScrapeOutput {
    /// Share of extracted records that passed validation; 1.0 when none were extracted.
    pub fn success_rate(&self) -> f64 {
        if self.records_extracted == 0 {
            1.0
        } else {
            self.valid_records as f64 / self.records_extracted as f64
        }
    }
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
