//! Small HTML helpers shared by adapters.
//!
//! All functions are synchronous: `scraper::Html` is not `Send`, so callers
//! parse and extract before their next `.await`.

use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::model::collapse_whitespace;

/// Four-digit year between 1900 and 2099.
#[allow(clippy::expect_used)]
static YEAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(19|20)\d{2}").expect("year regex is valid") // Static pattern, safe to panic
});

#[allow(clippy::expect_used)]
static ANCHOR_SELECTOR: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("a[href]").expect("anchor selector is valid") // Static selector, safe to panic
});

/// Finds the first plausible publication year in `text`.
///
/// ```
/// use harvester_core::adapter::detect_year;
///
/// assert_eq!(detect_year("/events/acl-2023/"), Some(2023));
/// assert_eq!(detect_year("Volume 202"), None);
/// ```
#[must_use]
pub fn detect_year(text: &str) -> Option<i32> {
    YEAR_PATTERN
        .find(text)
        .and_then(|m| m.as_str().parse().ok())
}

/// Returns the first link on the page whose path ends in `.pdf`.
///
/// Relative links are resolved against `page_url`.
#[must_use]
pub fn first_pdf_link(html: &str, page_url: &str) -> Option<String> {
    let base = Url::parse(page_url).ok()?;
    let document = Html::parse_document(html);
    document
        .select(&ANCHOR_SELECTOR)
        .filter_map(|a| a.value().attr("href"))
        .filter_map(|href| resolve_href(&base, href))
        .find(|url| {
            Url::parse(url)
                .map(|u| u.path().to_ascii_lowercase().ends_with(".pdf"))
                .unwrap_or(false)
        })
}

/// Resolves `href` against `base`, keeping only http(s) targets and dropping
/// the fragment.
pub(crate) fn resolve_href(base: &Url, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') {
        return None;
    }
    let mut joined = base.join(href).ok()?;
    if !matches!(joined.scheme(), "http" | "https") {
        return None;
    }
    joined.set_fragment(None);
    Some(joined.to_string())
}

/// Whitespace-collapsed text content of an element.
pub(crate) fn element_text(element: ElementRef<'_>) -> String {
    collapse_whitespace(&element.text().collect::<String>())
}

/// Last non-empty path segment of a URL, used as a stable node id.
pub(crate) fn last_path_segment(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.rfind(|s| !s.is_empty()).map(str::to_string))
        })
        .unwrap_or_else(|| url.to_string())
}
