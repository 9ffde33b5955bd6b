//! Null-tolerant extraction helpers over the `scraper` crate.
//!
//! Every lookup returns `None` when the element or attribute is missing or
//! has only whitespace, so site rules can build records without branching
//! on each field.

use scraper::{ElementRef, Selector};
use trawl_core::error::AppError;
use url::Url;

pub fn compile_selector(css: &str) -> Result<Selector, AppError> {
    Selector::parse(css).map_err(|e| AppError::Parsing(format!("invalid selector '{css}': {e}")))
}

/// Text of an element with runs of whitespace collapsed to single spaces.
pub fn element_text(element: ElementRef<'_>) -> Option<String> {
    let text = element.text().collect::<Vec<_>>().join(" ");
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    (!collapsed.is_empty()).then_some(collapsed)
}

/// Text of the first match of `selector` under `scope`.
pub fn select_text(scope: ElementRef<'_>, selector: &Selector) -> Option<String> {
    scope.select(selector).find_map(element_text)
}

/// Text of every match of `selector` under `scope`, empty ones dropped.
pub fn select_all_text(scope: ElementRef<'_>, selector: &Selector) -> Vec<String> {
    scope.select(selector).filter_map(element_text).collect()
}

/// Attribute `attr` of the first match of `selector` under `scope`.
pub fn select_attr(scope: ElementRef<'_>, selector: &Selector, attr: &str) -> Option<String> {
    scope
        .select(selector)
        .filter_map(|el| el.value().attr(attr))
        .map(str::trim)
        .find(|v| !v.is_empty())
        .map(str::to_string)
}

/// Resolve `href` against the page it was found on.
pub fn absolutize(base: &str, href: &str) -> Option<String> {
    let base = Url::parse(base).ok()?;
    base.join(href.trim()).ok().map(String::from)
}
