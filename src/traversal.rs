//! Frontier traversal over the collection → sub-collection → item hierarchy.
//!
//! [`Frontier`] walks the catalog lazily and sequentially: a level is only
//! listed when the consumer has drained everything discovered before it, so
//! downstream backpressure also throttles page fetches. Every level is
//! deduplicated within the run, and candidates whose identity is already in
//! the ledger are dropped before they reach the executor.
//!
//! A fresh frontier over the same catalog and ledger yields the same set of
//! items; there is no state carried between runs other than the ledger.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::adapter::{AdapterError, SiteAdapter};
use crate::ledger::Ledger;
use crate::model::{CollectionRef, SubCollectionRef, WorkItem};

/// Counters accumulated while walking the catalog.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraversalStats {
    pub collections: usize,
    pub sub_collections: usize,
    /// Unique item candidates seen, including ones already in the ledger.
    pub discovered: usize,
    /// Candidates dropped because the ledger already holds their identity.
    pub skipped_duplicate: usize,
    /// Catalog nodes whose listing failed and were treated as empty.
    pub adapter_errors: usize,
}

/// Lazy, finite sequence of not-yet-completed work items.
pub struct Frontier {
    adapter: Arc<dyn SiteAdapter>,
    ledger: Arc<Ledger>,
    max_identity_len: usize,

    collections: Option<VecDeque<CollectionRef>>,
    sub_collections: VecDeque<(CollectionRef, SubCollectionRef)>,
    items: VecDeque<WorkItem>,

    seen_collections: HashSet<String>,
    seen_sub_collections: HashSet<(String, String)>,
    seen_items: HashSet<(String, String, String)>,

    stats: TraversalStats,
}

impl Frontier {
    #[must_use]
    pub fn new(adapter: Arc<dyn SiteAdapter>, ledger: Arc<Ledger>, max_identity_len: usize) -> Self {
        Self {
            adapter,
            ledger,
            max_identity_len,
            collections: None,
            sub_collections: VecDeque::new(),
            items: VecDeque::new(),
            seen_collections: HashSet::new(),
            seen_sub_collections: HashSet::new(),
            seen_items: HashSet::new(),
            stats: TraversalStats::default(),
        }
    }

    #[must_use]
    pub fn stats(&self) -> TraversalStats {
        self.stats
    }

    /// Returns the next work item, listing further catalog nodes as needed.
    ///
    /// Returns `None` once the whole catalog has been walked.
    pub async fn next(&mut self) -> Option<WorkItem> {
        loop {
            if let Some(item) = self.items.pop_front() {
                return Some(item);
            }

            if let Some((collection, sub_collection)) = self.sub_collections.pop_front() {
                self.expand_sub_collection(&collection, &sub_collection).await;
                continue;
            }

            let Some(collections) = self.collections.as_mut() else {
                self.expand_root().await;
                continue;
            };

            match collections.pop_front() {
                Some(collection) => self.expand_collection(&collection).await,
                None => {
                    info!(
                        discovered = self.stats.discovered,
                        skipped_duplicate = self.stats.skipped_duplicate,
                        adapter_errors = self.stats.adapter_errors,
                        "catalog traversal finished"
                    );
                    return None;
                }
            }
        }
    }

    #[instrument(skip(self), fields(adapter = %self.adapter.name()))]
    async fn expand_root(&mut self) {
        let listed = match self.adapter.list_collections().await {
            Ok(listed) => listed,
            Err(error) => {
                self.record_adapter_error("catalog root", &error);
                Vec::new()
            }
        };

        let mut queue = VecDeque::new();
        for collection in listed {
            if self.seen_collections.insert(collection.url.clone()) {
                queue.push_back(collection);
            }
        }
        self.stats.collections += queue.len();
        debug!(count = queue.len(), "collections queued");
        self.collections = Some(queue);
    }

    #[instrument(skip(self, collection), fields(collection = %collection.url))]
    async fn expand_collection(&mut self, collection: &CollectionRef) {
        let listed = match self.adapter.list_sub_collections(collection).await {
            Ok(listed) => listed,
            Err(error) => {
                self.record_adapter_error(&collection.url, &error);
                return;
            }
        };

        for sub_collection in listed {
            let key = (collection.url.clone(), sub_collection.url.clone());
            if self.seen_sub_collections.insert(key) {
                self.stats.sub_collections += 1;
                self.sub_collections
                    .push_back((collection.clone(), sub_collection));
            }
        }
    }

    #[instrument(skip(self, collection, sub_collection), fields(sub_collection = %sub_collection.url))]
    async fn expand_sub_collection(
        &mut self,
        collection: &CollectionRef,
        sub_collection: &SubCollectionRef,
    ) {
        let listed = match self.adapter.list_items(sub_collection).await {
            Ok(listed) => listed,
            Err(error) => {
                self.record_adapter_error(&sub_collection.url, &error);
                return;
            }
        };

        for candidate in listed {
            let item_key = candidate
                .artifact_url
                .clone()
                .or_else(|| candidate.detail_url.clone())
                .unwrap_or_else(|| format!("title:{}", candidate.display_title));
            let key = (collection.url.clone(), sub_collection.url.clone(), item_key);
            if !self.seen_items.insert(key) {
                continue;
            }

            let item =
                WorkItem::from_candidate(candidate, collection, sub_collection, self.max_identity_len);
            self.stats.discovered += 1;

            if self.ledger.contains(&item.identity) {
                debug!(identity = %item.identity, "already in ledger, skipping");
                self.stats.skipped_duplicate += 1;
                continue;
            }
            self.items.push_back(item);
        }
    }

    fn record_adapter_error(&mut self, node: &str, error: &AdapterError) {
        self.stats.adapter_errors += 1;
        warn!(node, error = %error, "catalog node failed, continuing without it");
    }
}
