//! Built-in site rules.
//!
//! Listing sites are described by a static [`SiteProfile`] and served by
//! [`SelectorRules`]. [`GenericRules`] turns every link on a single page
//! into an item.

use std::sync::Arc;

use scraper::Html;
use trawl_core::error::AppError;
use trawl_core::job::ScrapingTarget;
use trawl_core::models::{PageExtract, RawRecord};
use trawl_core::registry::ScraperRegistry;
use trawl_core::traits::{Fetcher, SiteRules};

use crate::parse::{absolutize, compile_selector, element_text, select_all_text, select_attr, select_text};

/// How a value is read from an item element.
#[derive(Debug, Clone, Copy)]
pub enum Pick {
    /// Text of the first match.
    Text(&'static str),
    /// Text of every match, as a JSON array.
    AllText(&'static str),
    /// Attribute of the first match.
    Attr(&'static str, &'static str),
}

/// Page URL pattern used when a target's search criteria contain `key`.
#[derive(Debug, Clone, Copy)]
pub struct CriterionRoute {
    pub key: &'static str,
    /// `{value}` and `{page}` are substituted.
    pub template: &'static str,
}

#[derive(Debug, Clone, Copy)]
pub struct SiteProfile {
    pub site: &'static str,
    pub domains: &'static [&'static str],
    /// `{page}` is substituted with the 1-based page number.
    pub page_template: &'static str,
    pub criteria: &'static [CriterionRoute],
    /// One match per record.
    pub item: &'static str,
    pub title: Pick,
    pub link: Pick,
    pub fields: &'static [(&'static str, Pick)],
    /// Present on a page when another one follows.
    pub next: &'static str,
}

pub const QUOTES: SiteProfile = SiteProfile {
    site: "quotes",
    domains: &["quotes.toscrape.com"],
    page_template: "https://quotes.toscrape.com/page/{page}/",
    criteria: &[CriterionRoute {
        key: "tag",
        template: "https://quotes.toscrape.com/tag/{value}/page/{page}/",
    }],
    item: "div.quote",
    title: Pick::Text("span.text"),
    link: Pick::Attr("span a[href]", "href"),
    fields: &[
        ("author", Pick::Text("small.author")),
        ("tags", Pick::AllText("div.tags a.tag")),
    ],
    next: "li.next a",
};

pub const BOOKS: SiteProfile = SiteProfile {
    site: "books",
    domains: &["books.toscrape.com"],
    page_template: "https://books.toscrape.com/catalogue/page-{page}.html",
    criteria: &[CriterionRoute {
        key: "category",
        template: "https://books.toscrape.com/catalogue/category/books/{value}/page-{page}.html",
    }],
    item: "article.product_pod",
    title: Pick::Attr("h3 a", "title"),
    link: Pick::Attr("h3 a", "href"),
    fields: &[
        ("price", Pick::Text("p.price_color")),
        ("availability", Pick::Text("p.availability")),
        ("rating", Pick::Attr("p.star-rating", "class")),
    ],
    next: "li.next a",
};

pub const HACKERNEWS: SiteProfile = SiteProfile {
    site: "hackernews",
    domains: &["news.ycombinator.com"],
    page_template: "https://news.ycombinator.com/news?p={page}",
    criteria: &[],
    item: "tr.athing",
    title: Pick::Text("span.titleline > a"),
    link: Pick::Attr("span.titleline > a", "href"),
    fields: &[
        ("rank", Pick::Text("span.rank")),
        ("source", Pick::Text("span.sitestr")),
    ],
    next: "a.morelink",
};

/// Selector-driven rules for a paginated listing site.
#[derive(Debug, Clone)]
pub struct SelectorRules {
    profile: SiteProfile,
}

impl SelectorRules {
    pub fn new(profile: SiteProfile) -> Self {
        Self { profile }
    }

    pub fn profile(&self) -> &SiteProfile {
        &self.profile
    }
}

impl SiteRules for SelectorRules {
    fn site(&self) -> &str {
        self.profile.site
    }

    /// A target URL serves as page 1; it pages further only if it
    /// contains a `{page}` placeholder.
    fn page_url(&self, target: &ScrapingTarget, page: u32) -> Result<Option<String>, AppError> {
        let page_str = page.to_string();
        if let Some(url) = target.url.as_deref() {
            return Ok(if url.contains("{page}") {
                Some(url.replace("{page}", &page_str))
            } else if page == 1 {
                Some(url.to_string())
            } else {
                None
            });
        }

        let routed = self.profile.criteria.iter().find_map(|route| {
            target
                .search_criteria
                .get(route.key)
                .map(|value| route.template.replace("{value}", value.trim()))
        });
        let template = routed.unwrap_or_else(|| self.profile.page_template.to_string());
        Ok(Some(template.replace("{page}", &page_str)))
    }

    fn extract(&self, html: &str, page_url: &str) -> Result<PageExtract, AppError> {
        let profile = &self.profile;
        let item = compile_selector(profile.item)?;
        let next = compile_selector(profile.next)?;
        let title = CompiledPick::new(profile.title)?;
        let link = CompiledPick::new(profile.link)?;
        let fields = profile
            .fields
            .iter()
            .map(|(name, pick)| Ok((*name, CompiledPick::new(*pick)?)))
            .collect::<Result<Vec<_>, AppError>>()?;

        let document = Html::parse_document(html);
        let records = document
            .select(&item)
            .map(|el| {
                let url = link
                    .string(el)
                    .and_then(|href| absolutize(page_url, &href));
                fields.iter().fold(
                    RawRecord::new().with_title(title.string(el)).with_url(url),
                    |record, (name, pick)| record.with_field(name, pick.value(el)),
                )
            })
            .collect();
        let has_more = document.select(&next).next().is_some();

        Ok(PageExtract { records, has_more })
    }
}

struct CompiledPick {
    selector: scraper::Selector,
    kind: Pick,
}

impl CompiledPick {
    fn new(kind: Pick) -> Result<Self, AppError> {
        let css = match kind {
            Pick::Text(css) | Pick::AllText(css) | Pick::Attr(css, _) => css,
        };
        Ok(Self {
            selector: compile_selector(css)?,
            kind,
        })
    }

    fn string(&self, scope: scraper::ElementRef<'_>) -> Option<String> {
        match self.kind {
            Pick::Text(_) => select_text(scope, &self.selector),
            Pick::AllText(_) => {
                let all = select_all_text(scope, &self.selector);
                (!all.is_empty()).then(|| all.join(", "))
            }
            Pick::Attr(_, attr) => select_attr(scope, &self.selector, attr),
        }
    }

    fn value(&self, scope: scraper::ElementRef<'_>) -> Option<serde_json::Value> {
        match self.kind {
            Pick::AllText(_) => Some(select_all_text(scope, &self.selector).into()),
            _ => self.string(scope).map(Into::into),
        }
    }
}

/// Every anchor on the target URL becomes an item.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenericRules;

impl SiteRules for GenericRules {
    fn site(&self) -> &str {
        "generic"
    }

    fn page_url(&self, target: &ScrapingTarget, page: u32) -> Result<Option<String>, AppError> {
        let url = target
            .url
            .as_deref()
            .ok_or_else(|| AppError::Scraper("generic scraping requires a target url".into()))?;
        Ok((page == 1).then(|| url.to_string()))
    }

    fn extract(&self, html: &str, page_url: &str) -> Result<PageExtract, AppError> {
        let anchors = compile_selector("a[href]")?;
        let document = Html::parse_document(html);
        let records = document
            .select(&anchors)
            .map(|a| {
                let url = a
                    .value()
                    .attr("href")
                    .and_then(|href| absolutize(page_url, href));
                RawRecord::new()
                    .with_title(element_text(a))
                    .with_url(url)
                    .with_field("rel", a.value().attr("rel"))
            })
            .collect();

        Ok(PageExtract {
            records,
            has_more: false,
        })
    }
}

/// Register the built-in sites; `generic` is reachable by key only.
pub fn register_builtin_sites<F: Fetcher>(registry: &mut ScraperRegistry<F>) -> Result<(), AppError> {
    for profile in [QUOTES, BOOKS, HACKERNEWS] {
        registry.register(profile.site, profile.domains, move || {
            Arc::new(SelectorRules::new(profile))
        })?;
    }
    registry.register("generic", &[], || Arc::new(GenericRules))
}
