//! Paper Harvester Core Library
//!
//! Resumable, concurrent harvesting of artifacts (PDFs) and per-item
//! metadata from hierarchical proceedings catalogs.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`adapter`] - Site adapter capability and the bundled adapters
//! - [`traversal`] - Lazy, deduplicated walk of the catalog hierarchy
//! - [`ledger`] - Durable record of completed identities
//! - [`download`] - HTTP client, retry policy, politeness and the executor
//! - [`metadata`] - Per-item metadata records and ledger commits
//! - [`orchestrator`] - One harvest run end to end
//! - [`config`] - Run configuration
//! - [`model`] / [`filename`] - Work item types and on-disk naming
//!
//! # Example
//!
//! ```
//! use harvester_core::{OutputLayout, identity_for_title};
//!
//! let identity = identity_for_title("Attention Is All You/Need", 150);
//! let layout = OutputLayout::new("harvest");
//! assert!(layout.artifact_path(&identity).ends_with("pdfs/Attention Is All YouNeed.pdf"));
//! ```

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod adapter;
mod atomic;
pub mod config;
pub mod download;
pub mod filename;
pub mod ledger;
pub mod metadata;
pub mod model;
pub mod orchestrator;
pub mod traversal;
pub mod user_agent;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use adapter::{AdapterError, SelectorAdapter, SiteAdapter, SiteProfile, StaticCatalog};
pub use config::{CancelPolicy, ConfigError, HarvestConfig};
pub use download::{
    DownloadError, Executor, HttpClient, ItemError, Outcome, RateLimiter, RetryPolicy, SkipReason,
};
pub use filename::{OutputLayout, identity_for_title, sanitize_title};
pub use ledger::{Ledger, LedgerBackend, LedgerError};
pub use metadata::{MetadataRecord, MetadataWriter, WriteError};
pub use model::{
    CollectionRef, Hierarchy, LedgerEntry, SubCollectionRef, Track, WorkItem, WorkItemCandidate,
};
pub use orchestrator::{HarvestEvent, Orchestrator, OrchestratorError, RunSummary};
pub use traversal::{Frontier, TraversalStats};
