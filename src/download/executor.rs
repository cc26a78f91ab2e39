//! Per-item state machine and the bounded worker pool that runs it.
//!
//! [`Executor::submit`] drives one [`WorkItem`] through
//!
//! ```text
//! Discovered -> DetailResolving -> ArtifactResolved -> Downloading -> Completed
//!                     |                                   |  ^
//!                     v                                   v  |
//!                  Skipped                          Retrying / FailedPermanent
//! ```
//!
//! Concurrency is bounded by a semaphore sized at construction; the permit
//! is held from detail resolution until the ledger commit. Two cancellation
//! tokens are observed: `stop` prevents items from starting, `abort`
//! interrupts items already running (their temporary files are removed).

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashSet;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::client::{DownloadedArtifact, HttpClient};
use super::error::DownloadError;
use super::rate_limiter::{RateLimiter, parse_retry_after};
use super::retry::{RetryDecision, RetryPolicy};
use crate::adapter::{AdapterError, SiteAdapter};
use crate::filename::OutputLayout;
use crate::metadata::{MetadataPayload, MetadataWriter, WriteError};
use crate::model::{LedgerEntry, WorkItem};
use crate::orchestrator::HarvestEvent;

/// Lifecycle states of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    Discovered,
    DetailResolving,
    ArtifactResolved,
    Downloading,
    Retrying,
    Completed,
    FailedPermanent,
    Skipped,
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Discovered => "discovered",
            Self::DetailResolving => "detail_resolving",
            Self::ArtifactResolved => "artifact_resolved",
            Self::Downloading => "downloading",
            Self::Retrying => "retrying",
            Self::Completed => "completed",
            Self::FailedPermanent => "failed_permanent",
            Self::Skipped => "skipped",
        };
        f.write_str(label)
    }
}

/// Why an item ended without a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Identity already in the ledger, or already being downloaded.
    Duplicate,
    /// The item has no resolvable artifact URL.
    NoArtifact,
    /// The run was stopped before the item finished.
    Cancelled,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Duplicate => "duplicate",
            Self::NoArtifact => "no artifact",
            Self::Cancelled => "cancelled",
        })
    }
}

/// Terminal failure of one item. Never aborts the run.
#[derive(Debug, Error)]
pub enum ItemError {
    #[error("artifact resolution failed: {0}")]
    Resolve(#[source] AdapterError),

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error(transparent)]
    Write(#[from] WriteError),

    /// The worker task panicked or was torn down.
    #[error("worker task failed: {0}")]
    Task(String),
}

/// Terminal result of [`Executor::submit`].
#[derive(Debug)]
pub enum Outcome {
    Completed(LedgerEntry),
    Skipped { identity: String, reason: SkipReason },
    Failed { identity: String, error: ItemError },
}

impl Outcome {
    #[must_use]
    pub fn identity(&self) -> &str {
        match self {
            Self::Completed(entry) => &entry.identity,
            Self::Skipped { identity, .. } | Self::Failed { identity, .. } => identity,
        }
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    fn skipped(identity: &str, reason: SkipReason) -> Self {
        Self::Skipped {
            identity: identity.to_string(),
            reason,
        }
    }

    fn failed(identity: &str, error: impl Into<ItemError>) -> Self {
        Self::Failed {
            identity: identity.to_string(),
            error: error.into(),
        }
    }
}

/// Counters shared by every clone of an executor.
#[derive(Debug, Default)]
struct Counters {
    downloading: AtomicUsize,
    peak_downloading: AtomicUsize,
    retried: AtomicUsize,
}

/// Snapshot of executor counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutorStats {
    /// Retry attempts scheduled (detail resolution and download).
    pub retried: usize,
    /// Highest number of items simultaneously in `Downloading`.
    pub peak_in_flight: usize,
}

/// Bounded pool running the per-item state machine. Cheap to clone; clones
/// share the pool, the in-flight guard and the counters.
#[derive(Clone)]
pub struct Executor {
    adapter: Arc<dyn SiteAdapter>,
    client: HttpClient,
    writer: MetadataWriter,
    layout: OutputLayout,
    retry: RetryPolicy,
    politeness: Arc<RateLimiter>,
    permits: Arc<Semaphore>,
    in_flight: Arc<DashSet<String>>,
    counters: Arc<Counters>,
    stop: CancellationToken,
    abort: CancellationToken,
    events: Option<mpsc::UnboundedSender<HarvestEvent>>,
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("adapter", &self.adapter.name())
            .field("available_permits", &self.permits.available_permits())
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl Executor {
    /// Creates an executor running at most `max_concurrency` items at once.
    ///
    /// `max_concurrency` is clamped to at least 1. Politeness is disabled
    /// until [`with_politeness`](Self::with_politeness) is called.
    #[must_use]
    pub fn new(
        adapter: Arc<dyn SiteAdapter>,
        client: HttpClient,
        writer: MetadataWriter,
        layout: OutputLayout,
        max_concurrency: usize,
    ) -> Self {
        Self {
            adapter,
            client,
            writer,
            layout,
            retry: RetryPolicy::default(),
            politeness: Arc::new(RateLimiter::disabled()),
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            in_flight: Arc::new(DashSet::new()),
            counters: Arc::new(Counters::default()),
            stop: CancellationToken::new(),
            abort: CancellationToken::new(),
            events: None,
        }
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_politeness(mut self, politeness: Arc<RateLimiter>) -> Self {
        self.politeness = politeness;
        self
    }

    #[must_use]
    pub fn with_events(mut self, events: mpsc::UnboundedSender<HarvestEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Installs the run's cancellation tokens.
    ///
    /// Once `stop` fires no new item starts; once `abort` fires running items
    /// are interrupted and report [`SkipReason::Cancelled`].
    #[must_use]
    pub fn with_cancellation(mut self, stop: CancellationToken, abort: CancellationToken) -> Self {
        self.stop = stop;
        self.abort = abort;
        self
    }

    #[must_use]
    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            retried: self.counters.retried.load(Ordering::SeqCst),
            peak_in_flight: self.counters.peak_downloading.load(Ordering::SeqCst),
        }
    }

    /// Runs one item to a terminal outcome.
    ///
    /// Never issues a request for an identity the ledger already contains.
    #[instrument(skip(self, item), fields(identity = %item.identity))]
    pub async fn submit(&self, item: WorkItem) -> Outcome {
        let identity = item.identity.clone();
        let ledger = self.writer.ledger();

        if ledger.contains(&identity) {
            debug!("already in ledger");
            return Outcome::skipped(&identity, SkipReason::Duplicate);
        }

        let Some(_guard) = InFlightGuard::claim(&self.in_flight, &identity) else {
            debug!("same identity already in flight");
            return Outcome::skipped(&identity, SkipReason::Duplicate);
        };

        let Some(_permit) = self.reserve_slot().await else {
            return Outcome::skipped(&identity, SkipReason::Cancelled);
        };

        // The ledger may have changed while waiting for the slot.
        if ledger.contains(&identity) {
            debug!("committed while waiting for a worker slot");
            return Outcome::skipped(&identity, SkipReason::Duplicate);
        }

        self.emit(HarvestEvent::Started {
            identity: identity.clone(),
        });
        let outcome = self.run_item(item).await;
        let state = match &outcome {
            Outcome::Completed(_) => ItemState::Completed,
            Outcome::Skipped { .. } => ItemState::Skipped,
            Outcome::Failed { .. } => ItemState::FailedPermanent,
        };
        debug!(%state, "item finished");
        outcome
    }

    async fn reserve_slot(&self) -> Option<OwnedSemaphorePermit> {
        if self.stop.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            () = self.stop.cancelled() => None,
            permit = Arc::clone(&self.permits).acquire_owned() => permit.ok(),
        }
    }

    async fn run_item(&self, item: WorkItem) -> Outcome {
        let identity = item.identity.clone();

        debug!(state = %ItemState::DetailResolving, "resolving artifact");
        let artifact_url = match self.resolve_artifact(&item).await {
            Ok(Some(url)) => url,
            Ok(None) => {
                info!("no artifact link, skipping");
                return Outcome::skipped(&identity, SkipReason::NoArtifact);
            }
            Err(ResolveFailure::Cancelled) => {
                return Outcome::skipped(&identity, SkipReason::Cancelled);
            }
            Err(ResolveFailure::Adapter(error)) => {
                warn!(error = %error, "artifact resolution failed");
                return Outcome::failed(&identity, ItemError::Resolve(error));
            }
        };
        debug!(state = %ItemState::ArtifactResolved, url = %artifact_url);

        let artifact = {
            let _downloading = DownloadingGuard::enter(&self.counters);
            match self.download(&identity, &artifact_url).await {
                Ok(artifact) => artifact,
                Err(error) if matches!(error, DownloadError::Cancelled { .. }) => {
                    info!("download cancelled");
                    return Outcome::skipped(&identity, SkipReason::Cancelled);
                }
                Err(error) => {
                    warn!(url = %artifact_url, error = %error, "download failed");
                    return Outcome::failed(&identity, error);
                }
            }
        };

        let payload = MetadataPayload {
            item,
            artifact_url,
            artifact,
        };
        match self.writer.write(payload).await {
            Ok(entry) => {
                info!(bytes = entry.bytes, "item completed");
                Outcome::Completed(entry)
            }
            Err(error) => {
                warn!(error = %error, "metadata write failed");
                Outcome::failed(&identity, error)
            }
        }
    }

    /// `DetailResolving` with its own retry loop.
    async fn resolve_artifact(&self, item: &WorkItem) -> Result<Option<String>, ResolveFailure> {
        let candidate = item.to_candidate();
        let mut attempt = 1;
        loop {
            let result = tokio::select! {
                () = self.abort.cancelled() => return Err(ResolveFailure::Cancelled),
                result = self.adapter.resolve_artifact(&candidate) => result,
            };
            let error = match result {
                Ok(url) => return Ok(url),
                Err(error) => error,
            };

            let decision = match error.as_download_error() {
                Some(download) => self.retry.decide(download, attempt),
                None => self.retry.should_retry(error.failure_type(), attempt),
            };
            match decision {
                RetryDecision::Retry {
                    delay,
                    attempt: next,
                } => {
                    self.note_retry(&item.identity, next, delay, &error.to_string());
                    if !self.backoff(delay).await {
                        return Err(ResolveFailure::Cancelled);
                    }
                    attempt = next;
                }
                RetryDecision::DoNotRetry { reason } => {
                    debug!(attempt, reason = %reason, "not retrying resolution");
                    return Err(ResolveFailure::Adapter(error));
                }
            }
        }
    }

    /// `Downloading` with the bounded `Retrying` sub-loop.
    async fn download(
        &self,
        identity: &str,
        url: &str,
    ) -> Result<DownloadedArtifact, DownloadError> {
        let final_path = self.layout.artifact_path(identity);
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadError::io(parent, e))?;
        }

        let mut attempt = 1;
        loop {
            tokio::select! {
                () = self.abort.cancelled() => return Err(DownloadError::cancelled(url)),
                () = self.politeness.acquire(url) => {}
            }
            debug!(state = %ItemState::Downloading, attempt, "requesting artifact");

            let error = match self
                .client
                .download_to_path(url, &final_path, &self.abort)
                .await
            {
                Ok(artifact) => return Ok(artifact),
                Err(error) => error,
            };
            if matches!(error, DownloadError::Cancelled { .. }) {
                return Err(error);
            }

            if let Some(delay) = error.retry_after().and_then(parse_retry_after) {
                self.politeness.record_rate_limit(url, delay);
            }

            match self.retry.decide(&error, attempt) {
                RetryDecision::Retry {
                    delay,
                    attempt: next,
                } => {
                    self.note_retry(identity, next, delay, &error.to_string());
                    if !self.backoff(delay).await {
                        return Err(DownloadError::cancelled(url));
                    }
                    attempt = next;
                }
                RetryDecision::DoNotRetry { reason } => {
                    debug!(attempt, reason = %reason, "giving up");
                    return Err(error);
                }
            }
        }
    }

    fn note_retry(&self, identity: &str, attempt: u32, delay: Duration, reason: &str) {
        self.counters.retried.fetch_add(1, Ordering::SeqCst);
        info!(
            state = %ItemState::Retrying,
            attempt,
            delay_ms = delay.as_millis(),
            reason,
            "retrying"
        );
        self.emit(HarvestEvent::Retrying {
            identity: identity.to_string(),
            attempt,
            delay,
        });
    }

    /// Sleeps for `delay`; returns `false` if aborted first.
    async fn backoff(&self, delay: Duration) -> bool {
        tokio::select! {
            () = self.abort.cancelled() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }

    fn emit(&self, event: HarvestEvent) {
        if let Some(events) = &self.events {
            // A dropped receiver only means nobody is watching.
            let _ = events.send(event);
        }
    }
}

enum ResolveFailure {
    Cancelled,
    Adapter(AdapterError),
}

/// Holds an identity in the in-flight set until dropped.
struct InFlightGuard<'a> {
    set: &'a DashSet<String>,
    identity: String,
}

impl<'a> InFlightGuard<'a> {
    fn claim(set: &'a DashSet<String>, identity: &str) -> Option<Self> {
        set.insert(identity.to_string()).then(|| Self {
            set,
            identity: identity.to_string(),
        })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.identity);
    }
}

/// Counts an item as `Downloading` and tracks the peak.
struct DownloadingGuard<'a> {
    counters: &'a Counters,
}

impl<'a> DownloadingGuard<'a> {
    fn enter(counters: &'a Counters) -> Self {
        let now = counters.downloading.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak_downloading.fetch_max(now, Ordering::SeqCst);
        Self { counters }
    }
}

impl Drop for DownloadingGuard<'_> {
    fn drop(&mut self) {
        self.counters.downloading.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    use super::*;
    use crate::ledger::test_entries::entry;
    use crate::ledger::{Ledger, LedgerBackend};
    use crate::model::{CollectionRef, Hierarchy, SubCollectionRef, Track, WorkItemCandidate};

    /// Adapter whose `resolve_artifact` replays scripted results.
    struct ScriptedResolver {
        script: Mutex<Vec<Result<Option<String>, AdapterError>>>,
        calls: AtomicUsize,
        gate: Option<Arc<Notify>>,
    }

    impl ScriptedResolver {
        fn new(script: Vec<Result<Option<String>, AdapterError>>) -> Self {
            Self {
                script: Mutex::new(script.into_iter().rev().collect()),
                calls: AtomicUsize::new(0),
                gate: None,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SiteAdapter for ScriptedResolver {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn list_collections(&self) -> Result<Vec<CollectionRef>, AdapterError> {
            Ok(Vec::new())
        }

        async fn list_sub_collections(
            &self,
            _collection: &CollectionRef,
        ) -> Result<Vec<SubCollectionRef>, AdapterError> {
            Ok(Vec::new())
        }

        async fn list_items(
            &self,
            _sub_collection: &SubCollectionRef,
        ) -> Result<Vec<WorkItemCandidate>, AdapterError> {
            Ok(Vec::new())
        }

        async fn resolve_artifact(
            &self,
            _candidate: &WorkItemCandidate,
        ) -> Result<Option<String>, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.script.lock().unwrap().pop().unwrap_or(Ok(None))
        }
    }

    fn item(title: &str) -> WorkItem {
        WorkItem {
            identity: title.to_string(),
            display_title: title.to_string(),
            hierarchy: Hierarchy {
                collection_id: "ACL".to_string(),
                sub_collection_id: "2023.acl-long".to_string(),
                year: 2023,
                track: Track::Main,
            },
            detail_url: Some("https://aclanthology.org/2023.acl-long.1/".to_string()),
            artifact_url: None,
        }
    }

    async fn executor(dir: &TempDir, adapter: Arc<ScriptedResolver>) -> (Executor, Arc<Ledger>) {
        let layout = OutputLayout::new(dir.path());
        layout.ensure_dirs().await.unwrap();
        let ledger = Arc::new(
            Ledger::open_backend(LedgerBackend::Json, &layout)
                .await
                .unwrap(),
        );
        let writer = MetadataWriter::new(layout.clone(), Arc::clone(&ledger));
        let executor = Executor::new(adapter, HttpClient::new().unwrap(), writer, layout, 2)
            .with_retry_policy(
                RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(1))
                    .with_max_jitter(Duration::ZERO),
            );
        (executor, ledger)
    }

    #[tokio::test]
    async fn test_ledger_hit_skips_without_calling_adapter() {
        let dir = TempDir::new().unwrap();
        let adapter = Arc::new(ScriptedResolver::new(vec![]));
        let (executor, ledger) = executor(&dir, Arc::clone(&adapter)).await;
        ledger.commit(entry("Known Paper")).await.unwrap();

        let outcome = executor.submit(item("Known Paper")).await;

        assert!(matches!(
            outcome,
            Outcome::Skipped {
                reason: SkipReason::Duplicate,
                ..
            }
        ));
        assert_eq!(adapter.calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_artifact_is_skipped_not_failed() {
        let dir = TempDir::new().unwrap();
        let adapter = Arc::new(ScriptedResolver::new(vec![Ok(None)]));
        let (executor, ledger) = executor(&dir, adapter).await;

        let outcome = executor.submit(item("No Link")).await;

        assert!(matches!(
            outcome,
            Outcome::Skipped {
                reason: SkipReason::NoArtifact,
                ..
            }
        ));
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn test_transient_resolution_error_is_retried() {
        tokio::time::pause();
        let dir = TempDir::new().unwrap();
        let adapter = Arc::new(ScriptedResolver::new(vec![
            Err(DownloadError::http_status("https://x.example/d", 503).into()),
            Ok(None),
        ]));
        let (executor, _ledger) = executor(&dir, Arc::clone(&adapter)).await;

        let outcome = executor.submit(item("Flaky Detail")).await;

        assert!(matches!(
            outcome,
            Outcome::Skipped {
                reason: SkipReason::NoArtifact,
                ..
            }
        ));
        assert_eq!(adapter.calls(), 2);
        assert_eq!(executor.stats().retried, 1);
    }

    #[tokio::test]
    async fn test_permanent_resolution_error_fails_without_retry() {
        let dir = TempDir::new().unwrap();
        let adapter = Arc::new(ScriptedResolver::new(vec![Err(AdapterError::parse(
            "https://x.example/d",
            "no title",
        ))]));
        let (executor, ledger) = executor(&dir, Arc::clone(&adapter)).await;

        let outcome = executor.submit(item("Broken Detail")).await;

        assert!(matches!(
            outcome,
            Outcome::Failed {
                error: ItemError::Resolve(_),
                ..
            }
        ));
        assert_eq!(adapter.calls(), 1);
        assert_eq!(executor.stats().retried, 0);
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn test_resolution_retries_are_bounded() {
        tokio::time::pause();
        let dir = TempDir::new().unwrap();
        let adapter = Arc::new(ScriptedResolver::new(
            (0..5)
                .map(|_| Err(DownloadError::timeout("https://x.example/d").into()))
                .collect(),
        ));
        let (executor, _ledger) = executor(&dir, Arc::clone(&adapter)).await;

        let outcome = executor.submit(item("Always Slow")).await;

        assert!(matches!(outcome, Outcome::Failed { .. }));
        assert_eq!(adapter.calls(), 3);
    }

    #[tokio::test]
    async fn test_same_identity_in_flight_is_duplicate() {
        let dir = TempDir::new().unwrap();
        let gate = Arc::new(Notify::new());
        let mut resolver = ScriptedResolver::new(vec![Ok(None)]);
        resolver.gate = Some(Arc::clone(&gate));
        let adapter = Arc::new(resolver);
        let (executor, _ledger) = executor(&dir, Arc::clone(&adapter)).await;

        let first = {
            let executor = executor.clone();
            tokio::spawn(async move { executor.submit(item("Shared Title")).await })
        };
        while adapter.calls() == 0 {
            tokio::task::yield_now().await;
        }

        let second = executor.submit(item("Shared Title")).await;
        assert!(matches!(
            second,
            Outcome::Skipped {
                reason: SkipReason::Duplicate,
                ..
            }
        ));

        gate.notify_one();
        let first = first.await.unwrap();
        assert!(matches!(
            first,
            Outcome::Skipped {
                reason: SkipReason::NoArtifact,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_stopped_executor_does_not_start_items() {
        let dir = TempDir::new().unwrap();
        let adapter = Arc::new(ScriptedResolver::new(vec![Ok(None)]));
        let (executor, _ledger) = executor(&dir, Arc::clone(&adapter)).await;
        let stop = CancellationToken::new();
        let executor = executor.with_cancellation(stop.clone(), CancellationToken::new());
        stop.cancel();

        let outcome = executor.submit(item("Late")).await;

        assert!(matches!(
            outcome,
            Outcome::Skipped {
                reason: SkipReason::Cancelled,
                ..
            }
        ));
        assert_eq!(adapter.calls(), 0);
    }

    #[test]
    fn test_item_state_labels() {
        assert_eq!(ItemState::DetailResolving.to_string(), "detail_resolving");
        assert_eq!(ItemState::FailedPermanent.to_string(), "failed_permanent");
        assert_eq!(SkipReason::NoArtifact.to_string(), "no artifact");
    }
}
