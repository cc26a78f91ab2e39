//! Wires adapter, frontier, executor and ledger into one harvest run.
//!
//! Traversal is sequential; only downloads run in parallel. The orchestrator
//! pulls the next item from the [`Frontier`] only when fewer than
//! `max_concurrency` workers are busy, so discovery never runs ahead of the
//! pool. Results are collected from a [`JoinSet`] and folded into a
//! [`RunSummary`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use harvester_core::adapter::StaticCatalog;
//! use harvester_core::{HarvestConfig, Orchestrator};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let catalog = StaticCatalog::from_file("papers.toml".as_ref())?;
//! let summary = Orchestrator::new(HarvestConfig::default(), Arc::new(catalog))
//!     .run()
//!     .await?;
//! println!("completed {} failed {}", summary.completed, summary.failed);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::adapter::SiteAdapter;
use crate::config::{CancelPolicy, ConfigError, HarvestConfig};
use crate::download::{
    Executor, HttpClient, ItemError, ItemState, Outcome, RateLimiter, SkipReason,
};
use crate::ledger::{Ledger, LedgerError};
use crate::metadata::MetadataWriter;
use crate::model::WorkItem;
use crate::traversal::Frontier;

/// Time aborted workers get to remove their temporary files before their
/// tasks are torn down.
const ABORT_GRACE: Duration = Duration::from_secs(2);

/// Progress notifications for an external observer.
#[derive(Debug)]
pub enum HarvestEvent {
    Discovered(WorkItem),
    Started {
        identity: String,
    },
    Retrying {
        identity: String,
        attempt: u32,
        delay: Duration,
    },
    Finished(Outcome),
}

/// Errors that abort a whole run. Per-item failures are never reported here.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("ledger unavailable: {0}")]
    Ledger(#[from] LedgerError),

    #[error("failed to prepare output directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

/// Final counts of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Unique candidates seen during traversal.
    pub discovered: usize,
    pub skipped_duplicate: usize,
    pub skipped_no_artifact: usize,
    pub completed: usize,
    pub failed: usize,
    /// Items interrupted or never started because the run was stopped.
    pub cancelled: usize,
    pub retried: usize,
    /// Catalog nodes whose listing failed.
    pub adapter_errors: usize,
    /// Highest number of simultaneous downloads.
    pub peak_in_flight: usize,
}

impl RunSummary {
    fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Completed(_) => self.completed += 1,
            Outcome::Skipped { reason, .. } => match reason {
                SkipReason::Duplicate => self.skipped_duplicate += 1,
                SkipReason::NoArtifact => self.skipped_no_artifact += 1,
                SkipReason::Cancelled => self.cancelled += 1,
            },
            Outcome::Failed { .. } => self.failed += 1,
        }
    }
}

/// One harvest run over one catalog.
pub struct Orchestrator {
    config: HarvestConfig,
    adapter: Arc<dyn SiteAdapter>,
    client: Option<HttpClient>,
    rate_limiter: Option<Arc<RateLimiter>>,
    events: Option<mpsc::UnboundedSender<HarvestEvent>>,
    stop: CancellationToken,
}

impl Orchestrator {
    #[must_use]
    pub fn new(config: HarvestConfig, adapter: Arc<dyn SiteAdapter>) -> Self {
        Self {
            config,
            adapter,
            client: None,
            rate_limiter: None,
            events: None,
            stop: CancellationToken::new(),
        }
    }

    /// Publishes [`HarvestEvent`]s on `events`.
    #[must_use]
    pub fn with_events(mut self, events: mpsc::UnboundedSender<HarvestEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Shares a politeness limiter (e.g. with the adapter's page fetches).
    #[must_use]
    pub fn with_rate_limiter(mut self, rate_limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }

    /// Replaces the HTTP client built from the configuration.
    #[must_use]
    pub fn with_http_client(mut self, client: HttpClient) -> Self {
        self.client = Some(client);
        self
    }

    /// Token that stops the run when cancelled.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Runs the harvest to completion or until stopped.
    ///
    /// # Errors
    ///
    /// Only precondition failures are errors: invalid configuration, an
    /// unusable output directory, or an unreadable ledger.
    #[instrument(skip(self), fields(adapter = %self.adapter.name(), root = %self.config.output_root.display()))]
    pub async fn run(self) -> Result<RunSummary, OrchestratorError> {
        let config = &self.config;
        config.validate()?;

        let layout = config.layout();
        layout
            .ensure_dirs()
            .await
            .map_err(|source| OrchestratorError::Io {
                path: layout.root().to_path_buf(),
                source,
            })?;
        let stale = layout
            .remove_stale_partials()
            .await
            .map_err(|source| OrchestratorError::Io {
                path: layout.pdf_dir(),
                source,
            })?;
        if stale > 0 {
            info!(removed = stale, "removed partial downloads left by an interrupted run");
        }

        let ledger = Arc::new(Ledger::open_backend(config.ledger_backend, &layout).await?);
        let client = match self.client.clone() {
            Some(client) => client,
            None => config.http_client().map_err(OrchestratorError::Client)?,
        };
        let politeness = self
            .rate_limiter
            .clone()
            .unwrap_or_else(|| Arc::new(config.rate_limiter()));

        let abort = CancellationToken::new();
        let writer = MetadataWriter::new(layout.clone(), Arc::clone(&ledger));
        let mut executor = Executor::new(
            Arc::clone(&self.adapter),
            client,
            writer,
            layout,
            config.max_concurrency,
        )
        .with_retry_policy(config.retry_policy())
        .with_politeness(Arc::clone(&politeness))
        .with_cancellation(self.stop.clone(), abort.clone());
        if let Some(events) = &self.events {
            executor = executor.with_events(events.clone());
        }

        let (min_delay, max_delay) = politeness.delay_range();
        info!(
            max_concurrency = config.max_concurrency,
            host_delay_ms = %format!("{}..{}", min_delay.as_millis(), max_delay.as_millis()),
            ledger = %ledger.location(),
            already_completed = ledger.len(),
            "harvest starting"
        );

        let mut frontier = Frontier::new(
            Arc::clone(&self.adapter),
            Arc::clone(&ledger),
            config.max_filename_len,
        );
        let mut pool = WorkerPool::new(self.events.clone());

        loop {
            if pool.len() >= config.max_concurrency {
                tokio::select! {
                    biased;
                    () = self.stop.cancelled() => break,
                    Some(joined) = pool.workers.join_next_with_id() => pool.record(joined),
                }
                continue;
            }

            let next = tokio::select! {
                biased;
                () = self.stop.cancelled() => break,
                next = frontier.next() => next,
            };
            let Some(item) = next else {
                break;
            };

            debug!(identity = %item.identity, state = %ItemState::Discovered);
            pool.emit(HarvestEvent::Discovered(item.clone()));
            let worker = executor.clone();
            pool.spawn(item.identity.clone(), async move { worker.submit(item).await });
        }

        // Traversal is done (or stopped); a stop may still arrive while the
        // last items are running.
        tokio::select! {
            biased;
            () = self.stop.cancelled() => {}
            () = pool.drain() => {}
        }
        if self.stop.is_cancelled() {
            self.shutdown(&mut pool, &abort).await;
        }
        pool.drain().await;
        ledger.close().await;

        let traversal = frontier.stats();
        let executed = executor.stats();
        let mut summary = pool.summary;
        summary.discovered = traversal.discovered;
        summary.skipped_duplicate += traversal.skipped_duplicate;
        summary.adapter_errors = traversal.adapter_errors;
        summary.retried = executed.retried;
        summary.peak_in_flight = executed.peak_in_flight;

        info!(
            discovered = summary.discovered,
            skipped_duplicate = summary.skipped_duplicate,
            skipped_no_artifact = summary.skipped_no_artifact,
            completed = summary.completed,
            failed = summary.failed,
            cancelled = summary.cancelled,
            retried = summary.retried,
            "harvest finished"
        );
        Ok(summary)
    }

    /// Lets in-flight items finish (bounded) or aborts them, per policy.
    async fn shutdown(&self, pool: &mut WorkerPool, abort: &CancellationToken) {
        let in_flight = pool.len();
        info!(
            in_flight,
            policy = ?self.config.cancel_policy,
            "stop requested, no new items will start"
        );

        if self.config.cancel_policy == CancelPolicy::Abort {
            abort.cancel();
        }
        if tokio::time::timeout(self.config.drain_timeout(), pool.drain())
            .await
            .is_ok()
        {
            return;
        }

        warn!(
            remaining = pool.len(),
            timeout_ms = self.config.drain_timeout_ms,
            "drain timeout reached, aborting in-flight items"
        );
        abort.cancel();
        if tokio::time::timeout(ABORT_GRACE, pool.drain()).await.is_err() {
            warn!(remaining = pool.len(), "workers did not stop in time, tearing down");
            pool.workers.abort_all();
        }
    }
}

/// Spawned workers plus the bookkeeping needed to attribute their results.
struct WorkerPool {
    workers: JoinSet<Outcome>,
    identities: HashMap<Id, String>,
    events: Option<mpsc::UnboundedSender<HarvestEvent>>,
    summary: RunSummary,
}

impl WorkerPool {
    fn new(events: Option<mpsc::UnboundedSender<HarvestEvent>>) -> Self {
        Self {
            workers: JoinSet::new(),
            identities: HashMap::new(),
            events,
            summary: RunSummary::default(),
        }
    }

    fn len(&self) -> usize {
        self.workers.len()
    }

    fn spawn<F>(&mut self, identity: String, task: F)
    where
        F: Future<Output = Outcome> + Send + 'static,
    {
        let handle = self.workers.spawn(task);
        self.identities.insert(handle.id(), identity);
    }

    async fn drain(&mut self) {
        while let Some(joined) = self.workers.join_next_with_id().await {
            self.record(joined);
        }
    }

    fn record(&mut self, joined: Result<(Id, Outcome), JoinError>) {
        let outcome = match joined {
            Ok((id, outcome)) => {
                self.identities.remove(&id);
                outcome
            }
            Err(error) => {
                let identity = self.identities.remove(&error.id()).unwrap_or_default();
                if error.is_cancelled() {
                    Outcome::Skipped {
                        identity,
                        reason: SkipReason::Cancelled,
                    }
                } else {
                    warn!(identity = %identity, error = %error, "worker task panicked");
                    Outcome::Failed {
                        identity,
                        error: ItemError::Task(error.to_string()),
                    }
                }
            }
        };
        self.summary.record(&outcome);
        self.emit(HarvestEvent::Finished(outcome));
    }

    fn emit(&self, event: HarvestEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::adapter::{StaticCatalog, StaticCollection, StaticSubCollection};
    use crate::ledger::test_entries::entry;
    use crate::ledger::LedgerBackend;
    use crate::model::{Track, WorkItemCandidate};

    fn catalog(titles: &[&str]) -> Arc<StaticCatalog> {
        let items = titles
            .iter()
            .map(|title| WorkItemCandidate {
                display_title: (*title).to_string(),
                ..WorkItemCandidate::default()
            })
            .collect();
        Arc::new(StaticCatalog::new(
            "test",
            vec![StaticCollection {
                id: "ACL".to_string(),
                url: "manifest:acl".to_string(),
                year: Some(2023),
                sub_collections: vec![StaticSubCollection {
                    id: "2023.acl-long".to_string(),
                    url: "manifest:acl/2023.acl-long".to_string(),
                    year: None,
                    track: Track::Main,
                    items,
                }],
            }],
        ))
    }

    fn config(dir: &TempDir) -> HarvestConfig {
        HarvestConfig {
            output_root: dir.path().to_path_buf(),
            politeness: crate::config::PolitenessSettings {
                min_delay_ms: 0,
                max_delay_ms: 0,
            },
            ..HarvestConfig::default()
        }
    }

    #[tokio::test]
    async fn test_items_without_artifacts_are_counted_as_skipped() {
        let dir = TempDir::new().unwrap();
        let summary = Orchestrator::new(config(&dir), catalog(&["First", "Second"]))
            .run()
            .await
            .unwrap();

        assert_eq!(summary.discovered, 2);
        assert_eq!(summary.skipped_no_artifact, 2);
        assert_eq!(summary.completed, 0);
        assert_eq!(summary.failed, 0);
        assert!(dir.path().join("pdfs").is_dir());
        assert!(dir.path().join("json").is_dir());
    }

    #[tokio::test]
    async fn test_ledger_duplicates_are_counted() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        {
            let ledger = Ledger::open_backend(LedgerBackend::Json, &config.layout())
                .await
                .unwrap();
            ledger.commit(entry("First")).await.unwrap();
        }

        let summary = Orchestrator::new(config, catalog(&["First", "Second"]))
            .run()
            .await
            .unwrap();

        assert_eq!(summary.discovered, 2);
        assert_eq!(summary.skipped_duplicate, 1);
        assert_eq!(summary.skipped_no_artifact, 1);
    }

    #[tokio::test]
    async fn test_corrupt_ledger_aborts_run() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("ledger.json"), "{not json").unwrap();

        let result = Orchestrator::new(config(&dir), catalog(&["First"]))
            .run()
            .await;

        match result {
            Err(OrchestratorError::Ledger(error)) => assert!(error.is_corrupt()),
            other => panic!("expected corrupt ledger, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let dir = TempDir::new().unwrap();
        let config = HarvestConfig {
            max_concurrency: 0,
            ..config(&dir)
        };
        let result = Orchestrator::new(config, catalog(&["First"])).run().await;
        assert!(matches!(result, Err(OrchestratorError::Config(_))));
    }

    #[tokio::test]
    async fn test_stopped_run_starts_nothing() {
        let dir = TempDir::new().unwrap();
        let orchestrator = Orchestrator::new(config(&dir), catalog(&["First", "Second"]));
        orchestrator.cancellation_token().cancel();

        let summary = orchestrator.run().await.unwrap();

        assert_eq!(summary.completed + summary.skipped_no_artifact, 0);
        assert_eq!(summary.discovered, 0);
    }

    #[tokio::test]
    async fn test_events_cover_each_item() {
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let summary = Orchestrator::new(config(&dir), catalog(&["First", "Second"]))
            .with_events(tx)
            .run()
            .await
            .unwrap();
        assert_eq!(summary.discovered, 2);

        let mut discovered = 0;
        let mut finished = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                HarvestEvent::Discovered(_) => discovered += 1,
                HarvestEvent::Finished(outcome) => {
                    assert!(!outcome.is_completed());
                    finished += 1;
                }
                HarvestEvent::Started { .. } | HarvestEvent::Retrying { .. } => {}
            }
        }
        assert_eq!((discovered, finished), (2, 2));
    }
}
