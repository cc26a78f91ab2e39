//! Site adapters: the pluggable capability that reads one catalog.
//!
//! A catalog is a three-level hierarchy (collections → sub-collections →
//! items). The core never parses HTML itself; it only calls the four
//! operations of [`SiteAdapter`]. One implementation is chosen when the
//! orchestrator is built.
//!
//! - [`SelectorAdapter`] - driven by a declarative TOML [`SiteProfile`]
//! - [`StaticCatalog`] - explicit in-memory / TOML manifest of the hierarchy

mod html;
mod selector;
mod static_catalog;

pub use html::{detect_year, first_pdf_link};
pub use selector::{DetailRule, ItemRule, LinkRule, SelectorAdapter, SiteProfile};
pub use static_catalog::{StaticCatalog, StaticCollection, StaticSubCollection};

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

use crate::download::{DownloadError, FailureType, classify_error};
use crate::model::{CollectionRef, SubCollectionRef, WorkItemCandidate};

/// Errors raised by a site adapter for a single catalog node.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// The page could not be fetched.
    #[error("fetch failed: {0}")]
    Fetch(#[from] DownloadError),

    /// The page was fetched but does not have the expected structure.
    #[error("failed to parse {url}: {detail}")]
    Parse { url: String, detail: String },

    /// The adapter configuration itself is unusable.
    #[error("invalid site profile: {0}")]
    Profile(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML in {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl AdapterError {
    pub fn parse(url: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Parse {
            url: url.into(),
            detail: detail.into(),
        }
    }

    /// Retry classification when this error occurs while resolving an artifact.
    ///
    /// Fetch errors follow the download policy; everything else is permanent.
    #[must_use]
    pub fn failure_type(&self) -> FailureType {
        match self {
            Self::Fetch(source) => classify_error(source),
            _ => FailureType::Permanent,
        }
    }

    /// Underlying download error, if any (used for `Retry-After`).
    #[must_use]
    pub fn as_download_error(&self) -> Option<&DownloadError> {
        match self {
            Self::Fetch(source) => Some(source),
            _ => None,
        }
    }
}

/// Capability interface implemented once per source catalog.
///
/// Each call concerns one node. Failures are node-local: the traversal logs
/// them and treats the node as having no children.
#[async_trait]
pub trait SiteAdapter: Send + Sync {
    /// Short label for logs (e.g. "ACL").
    fn name(&self) -> &str;

    /// Lists the top-level collections on the catalog root.
    async fn list_collections(&self) -> Result<Vec<CollectionRef>, AdapterError>;

    /// Lists the sub-collections of one collection.
    async fn list_sub_collections(
        &self,
        collection: &CollectionRef,
    ) -> Result<Vec<SubCollectionRef>, AdapterError>;

    /// Lists the item candidates of one sub-collection.
    async fn list_items(
        &self,
        sub_collection: &SubCollectionRef,
    ) -> Result<Vec<WorkItemCandidate>, AdapterError>;

    /// Resolves the artifact URL of a candidate, fetching its detail page if
    /// needed. `Ok(None)` means the item has no artifact.
    async fn resolve_artifact(
        &self,
        candidate: &WorkItemCandidate,
    ) -> Result<Option<String>, AdapterError> {
        Ok(candidate.artifact_url.clone())
    }
}
