//! Manifest-driven adapter listing the whole hierarchy explicitly.
//!
//! Useful for curated runs (a hand-written TOML manifest of papers) and as a
//! deterministic catalog in tests. Items that only carry a `detail_url` are
//! resolved by fetching the page and taking its first `.pdf` link, when the
//! catalog was given an HTTP client.
//!
//! ```toml
//! [[collections]]
//! id = "PMLR"
//! url = "manifest:pmlr"
//! year = 2023
//!
//! [[collections.sub_collections]]
//! id = "v202"
//! url = "manifest:pmlr/v202"
//!
//! [[collections.sub_collections.items]]
//! display_title = "Some Paper"
//! artifact_url = "https://proceedings.mlr.press/v202/some.pdf"
//! ```

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::html::first_pdf_link;
use super::{AdapterError, SiteAdapter};
use crate::download::{HttpClient, RateLimiter};
use crate::model::{CollectionRef, SubCollectionRef, Track, WorkItemCandidate};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaticCollection {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub sub_collections: Vec<StaticSubCollection>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaticSubCollection {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub track: Track,
    #[serde(default)]
    pub items: Vec<WorkItemCandidate>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Manifest {
    #[serde(default = "default_manifest_name")]
    name: String,
    #[serde(default)]
    collections: Vec<StaticCollection>,
}

fn default_manifest_name() -> String {
    "static".to_string()
}

/// In-memory catalog.
#[derive(Debug, Clone)]
pub struct StaticCatalog {
    name: String,
    collections: Vec<StaticCollection>,
    client: Option<(HttpClient, Arc<RateLimiter>)>,
}

impl StaticCatalog {
    #[must_use]
    pub fn new(name: impl Into<String>, collections: Vec<StaticCollection>) -> Self {
        Self {
            name: name.into(),
            collections,
            client: None,
        }
    }

    /// Parses a TOML manifest.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Profile`] if the manifest is malformed.
    pub fn from_toml_str(raw: &str) -> Result<Self, AdapterError> {
        let manifest: Manifest =
            toml::from_str(raw).map_err(|e| AdapterError::Profile(e.to_string()))?;
        Ok(Self::new(manifest.name, manifest.collections))
    }

    /// Reads a TOML manifest file.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Io`] or [`AdapterError::Toml`].
    pub fn from_file(path: &Path) -> Result<Self, AdapterError> {
        let raw = std::fs::read_to_string(path).map_err(|source| AdapterError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let manifest: Manifest = toml::from_str(&raw).map_err(|source| AdapterError::Toml {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::new(manifest.name, manifest.collections))
    }

    /// Enables detail-page resolution through `client`. Page fetches wait
    /// on `politeness` like artifact downloads to the same host.
    #[must_use]
    pub fn with_client(mut self, client: HttpClient, politeness: Arc<RateLimiter>) -> Self {
        self.client = Some((client, politeness));
        self
    }

    fn find_collection(&self, url: &str) -> Option<&StaticCollection> {
        self.collections.iter().find(|c| c.url == url)
    }
}

#[async_trait]
impl SiteAdapter for StaticCatalog {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_collections(&self) -> Result<Vec<CollectionRef>, AdapterError> {
        Ok(self
            .collections
            .iter()
            .map(|c| CollectionRef {
                id: c.id.clone(),
                url: c.url.clone(),
                year: c.year,
            })
            .collect())
    }

    async fn list_sub_collections(
        &self,
        collection: &CollectionRef,
    ) -> Result<Vec<SubCollectionRef>, AdapterError> {
        let Some(found) = self.find_collection(&collection.url) else {
            return Ok(Vec::new());
        };
        Ok(found
            .sub_collections
            .iter()
            .map(|s| SubCollectionRef {
                collection_id: collection.id.clone(),
                id: s.id.clone(),
                url: s.url.clone(),
                year: s.year.or(collection.year),
                track: s.track,
            })
            .collect())
    }

    async fn list_items(
        &self,
        sub_collection: &SubCollectionRef,
    ) -> Result<Vec<WorkItemCandidate>, AdapterError> {
        Ok(self
            .collections
            .iter()
            .flat_map(|c| &c.sub_collections)
            .find(|s| s.url == sub_collection.url)
            .map(|s| s.items.clone())
            .unwrap_or_default())
    }

    async fn resolve_artifact(
        &self,
        candidate: &WorkItemCandidate,
    ) -> Result<Option<String>, AdapterError> {
        if let Some(url) = &candidate.artifact_url {
            return Ok(Some(url.clone()));
        }
        match (&candidate.detail_url, &self.client) {
            (Some(detail_url), Some((client, politeness))) => {
                politeness.acquire(detail_url).await;
                let html = client.fetch_page(detail_url).await?;
                Ok(first_pdf_link(&html, detail_url))
            }
            _ => Ok(None),
        }
    }
}
