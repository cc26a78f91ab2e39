//! Declarative CSS-selector adapter.
//!
//! A [`SiteProfile`] describes how to find each level of a catalog with CSS
//! selectors and optional href regexes. The same code then serves any
//! proceedings site; see `demos/` for ACL Anthology and PMLR profiles.
//!
//! ```toml
//! name = "ACL"
//! root_url = "https://aclanthology.org/events/"
//!
//! [collections]
//! href_pattern = '^/events/acl-\d{4}/$'
//!
//! [sub_collections]
//! href_pattern = '^/volumes/'
//!
//! [items]
//! container = "p.d-sm-flex"
//! title = "strong a"
//! artifact = "a[href$='.pdf']"
//! detail = "strong a"
//! ```

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use tracing::{debug, instrument};
use url::Url;

use super::html::{detect_year, element_text, first_pdf_link, last_path_segment, resolve_href};
use super::{AdapterError, SiteAdapter};
use crate::download::{HttpClient, RateLimiter};
use crate::model::{CollectionRef, SubCollectionRef, Track, WorkItemCandidate};

fn default_link_selector() -> String {
    "a[href]".to_string()
}

/// Declarative description of one catalog site.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SiteProfile {
    /// Collection label recorded in metadata (e.g. "ACL", "PMLR").
    pub name: String,
    pub root_url: String,
    /// How to find collections on the root page. Absent: the root itself is
    /// the only collection.
    #[serde(default)]
    pub collections: Option<LinkRule>,
    /// How to find sub-collections on a collection page. Absent: each
    /// collection page is its own single sub-collection.
    #[serde(default)]
    pub sub_collections: Option<LinkRule>,
    pub items: ItemRule,
    /// How to find the artifact on an item's detail page. Absent: the first
    /// link ending in `.pdf`.
    #[serde(default)]
    pub detail: Option<DetailRule>,
}

/// Link extraction for the collection and sub-collection levels.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinkRule {
    #[serde(default = "default_link_selector")]
    pub selector: String,
    /// Regex the raw `href` attribute must match.
    #[serde(default)]
    pub href_pattern: Option<String>,
    /// Fixed track for every node found by this rule; otherwise detected
    /// from the link URL and text.
    #[serde(default)]
    pub track: Option<Track>,
}

/// Item extraction on a sub-collection page.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ItemRule {
    /// One element per item.
    pub container: String,
    /// Title element inside the container.
    pub title: String,
    /// Link to the artifact inside the container.
    #[serde(default)]
    pub artifact: Option<String>,
    /// Link to the item's detail page inside the container.
    #[serde(default)]
    pub detail: Option<String>,
    /// Detect the year from the whole page text (sites that only print it
    /// in a volume header).
    #[serde(default)]
    pub year_from_page: bool,
}

/// Artifact extraction on an item detail page.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DetailRule {
    pub artifact: String,
}

impl SiteProfile {
    /// Parses a profile from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Profile`] for invalid TOML or unknown keys.
    pub fn from_toml_str(raw: &str) -> Result<Self, AdapterError> {
        toml::from_str(raw).map_err(|e| AdapterError::Profile(e.to_string()))
    }

    /// Reads a profile file.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Io`] or [`AdapterError::Toml`].
    pub fn from_file(path: &Path) -> Result<Self, AdapterError> {
        let raw = std::fs::read_to_string(path).map_err(|source| AdapterError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| AdapterError::Toml {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Debug)]
struct CompiledLinkRule {
    selector: Selector,
    href_pattern: Option<Regex>,
    track: Option<Track>,
}

#[derive(Debug)]
struct CompiledItemRule {
    container: Selector,
    title: Selector,
    artifact: Option<Selector>,
    detail: Option<Selector>,
    year_from_page: bool,
}

/// [`SiteAdapter`] driven by a [`SiteProfile`].
#[derive(Debug)]
pub struct SelectorAdapter {
    name: String,
    root_url: String,
    collections: Option<CompiledLinkRule>,
    sub_collections: Option<CompiledLinkRule>,
    items: CompiledItemRule,
    detail_artifact: Option<Selector>,
    client: HttpClient,
    politeness: Option<Arc<RateLimiter>>,
}

impl SelectorAdapter {
    /// Compiles the profile's selectors and patterns.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Profile`] naming the first invalid selector,
    /// regex or root URL.
    pub fn new(profile: SiteProfile, client: HttpClient) -> Result<Self, AdapterError> {
        Url::parse(&profile.root_url)
            .map_err(|e| AdapterError::Profile(format!("root_url '{}': {e}", profile.root_url)))?;

        Ok(Self {
            collections: profile.collections.as_ref().map(compile_link_rule).transpose()?,
            sub_collections: profile
                .sub_collections
                .as_ref()
                .map(compile_link_rule)
                .transpose()?,
            items: CompiledItemRule {
                container: compile_selector(&profile.items.container)?,
                title: compile_selector(&profile.items.title)?,
                artifact: profile.items.artifact.as_deref().map(compile_selector).transpose()?,
                detail: profile.items.detail.as_deref().map(compile_selector).transpose()?,
                year_from_page: profile.items.year_from_page,
            },
            detail_artifact: profile
                .detail
                .as_ref()
                .map(|d| compile_selector(&d.artifact))
                .transpose()?,
            name: profile.name,
            root_url: profile.root_url,
            client,
            politeness: None,
        })
    }

    /// Applies per-host politeness delays to page fetches as well.
    #[must_use]
    pub fn with_politeness(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.politeness = Some(limiter);
        self
    }

    async fn fetch(&self, url: &str) -> Result<String, AdapterError> {
        if let Some(limiter) = &self.politeness {
            limiter.acquire(url).await;
        }
        Ok(self.client.fetch_page(url).await?)
    }
}

#[async_trait]
impl SiteAdapter for SelectorAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self), fields(adapter = %self.name))]
    async fn list_collections(&self) -> Result<Vec<CollectionRef>, AdapterError> {
        let Some(rule) = &self.collections else {
            return Ok(vec![CollectionRef {
                id: self.name.clone(),
                url: self.root_url.clone(),
                year: detect_year(&self.root_url),
            }]);
        };

        let html = self.fetch(&self.root_url).await?;
        let links = extract_links(&html, &self.root_url, rule)?;
        debug!(count = links.len(), "collections found");
        Ok(links
            .into_iter()
            .map(|link| CollectionRef {
                id: self.name.clone(),
                year: detect_year(&link.url).or_else(|| detect_year(&link.text)),
                url: link.url,
            })
            .collect())
    }

    #[instrument(skip(self, collection), fields(url = %collection.url))]
    async fn list_sub_collections(
        &self,
        collection: &CollectionRef,
    ) -> Result<Vec<SubCollectionRef>, AdapterError> {
        let Some(rule) = &self.sub_collections else {
            return Ok(vec![SubCollectionRef {
                collection_id: collection.id.clone(),
                id: last_path_segment(&collection.url),
                url: collection.url.clone(),
                year: collection.year,
                track: Track::detect(&collection.url),
            }]);
        };

        let html = self.fetch(&collection.url).await?;
        let links = extract_links(&html, &collection.url, rule)?;
        debug!(count = links.len(), "sub-collections found");
        Ok(links
            .into_iter()
            .map(|link| SubCollectionRef {
                collection_id: collection.id.clone(),
                id: last_path_segment(&link.url),
                year: detect_year(&link.url)
                    .or_else(|| detect_year(&link.text))
                    .or(collection.year),
                track: rule
                    .track
                    .unwrap_or_else(|| Track::detect(&format!("{} {}", link.url, link.text))),
                url: link.url,
            })
            .collect())
    }

    #[instrument(skip(self, sub_collection), fields(url = %sub_collection.url))]
    async fn list_items(
        &self,
        sub_collection: &SubCollectionRef,
    ) -> Result<Vec<WorkItemCandidate>, AdapterError> {
        let html = self.fetch(&sub_collection.url).await?;
        let items = extract_items(&html, &sub_collection.url, &self.items)?;
        debug!(count = items.len(), "items found");
        Ok(items)
    }

    #[instrument(skip(self, candidate), fields(title = %candidate.display_title))]
    async fn resolve_artifact(
        &self,
        candidate: &WorkItemCandidate,
    ) -> Result<Option<String>, AdapterError> {
        if let Some(url) = &candidate.artifact_url {
            return Ok(Some(url.clone()));
        }
        let Some(detail_url) = &candidate.detail_url else {
            return Ok(None);
        };

        let html = self.fetch(detail_url).await?;
        Ok(match &self.detail_artifact {
            Some(selector) => select_first_href(&html, detail_url, selector)?,
            None => first_pdf_link(&html, detail_url),
        })
    }
}

fn compile_selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Profile(format!("selector '{css}': {e}")))
}

fn compile_link_rule(rule: &LinkRule) -> Result<CompiledLinkRule, AdapterError> {
    Ok(CompiledLinkRule {
        selector: compile_selector(&rule.selector)?,
        href_pattern: rule
            .href_pattern
            .as_deref()
            .map(|p| Regex::new(p).map_err(|e| AdapterError::Profile(format!("regex '{p}': {e}"))))
            .transpose()?,
        track: rule.track,
    })
}

struct Link {
    url: String,
    text: String,
}

fn base_url(page_url: &str) -> Result<Url, AdapterError> {
    Url::parse(page_url).map_err(|e| AdapterError::parse(page_url, e.to_string()))
}

/// Matching links on a page, deduplicated, in document order.
fn extract_links(html: &str, page_url: &str, rule: &CompiledLinkRule) -> Result<Vec<Link>, AdapterError> {
    let base = base_url(page_url)?;
    let document = Html::parse_document(html);
    let mut seen = std::collections::HashSet::new();

    Ok(document
        .select(&rule.selector)
        .filter_map(|element| {
            let href = element.value().attr("href")?;
            if rule.href_pattern.as_ref().is_some_and(|re| !re.is_match(href)) {
                return None;
            }
            let url = resolve_href(&base, href)?;
            seen.insert(url.clone()).then(|| Link {
                url,
                text: element_text(element),
            })
        })
        .collect())
}

fn extract_items(
    html: &str,
    page_url: &str,
    rule: &CompiledItemRule,
) -> Result<Vec<WorkItemCandidate>, AdapterError> {
    let base = base_url(page_url)?;
    let document = Html::parse_document(html);
    let page_year = if rule.year_from_page {
        detect_year(&document.root_element().text().collect::<String>())
    } else {
        None
    };

    let href_in = |container: ElementRef<'_>, selector: &Option<Selector>| {
        selector.as_ref().and_then(|s| {
            container
                .select(s)
                .find_map(|a| a.value().attr("href").and_then(|h| resolve_href(&base, h)))
        })
    };

    Ok(document
        .select(&rule.container)
        .filter_map(|container| {
            let title = container.select(&rule.title).next().map(element_text)?;
            if title.is_empty() {
                return None;
            }
            Some(WorkItemCandidate {
                display_title: title,
                artifact_url: href_in(container, &rule.artifact),
                detail_url: href_in(container, &rule.detail),
                year: page_year,
                track: None,
            })
        })
        .collect())
}

fn select_first_href(
    html: &str,
    page_url: &str,
    selector: &Selector,
) -> Result<Option<String>, AdapterError> {
    let base = base_url(page_url)?;
    let document = Html::parse_document(html);
    Ok(document
        .select(selector)
        .find_map(|a| a.value().attr("href").and_then(|h| resolve_href(&base, h))))
}
