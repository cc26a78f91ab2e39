//! Dedup ledger: the durable record of completed work items.
//!
//! The [`Ledger`] is the single source of truth for "already done". It is
//! loaded once at startup, answers [`contains`](Ledger::contains) from memory
//! and makes every [`commit`](Ledger::commit) durable through a
//! [`LedgerStore`] before the entry becomes visible.
//!
//! Commits are serialized by an internal mutex, so the backing store never
//! sees two concurrent writes. Reads never wait on a commit in progress.
//!
//! # Example
//!
//! ```no_run
//! use harvester_core::ledger::{JsonLedgerStore, Ledger};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let ledger = Ledger::open(JsonLedgerStore::new("harvest/ledger.json")).await?;
//! if !ledger.contains("Attention Is All You Need") {
//!     // schedule the download
//! }
//! # Ok(())
//! # }
//! ```

mod json_store;
mod sqlite_store;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

pub use json_store::JsonLedgerStore;
pub use sqlite_store::SqliteLedgerStore;

use crate::filename::OutputLayout;
use crate::model::LedgerEntry;

/// Ledger errors.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The persisted store exists but cannot be read or parsed. Fatal for a run.
    #[error("ledger at {path} is corrupt: {detail}")]
    Corrupt { path: PathBuf, detail: String },

    /// Writing the store failed; the entry was not committed.
    #[error("failed to persist ledger at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// SQLite store failure.
    #[error("ledger database error: {0}")]
    Database(#[from] sqlx::Error),

    /// SQLite schema migration failure.
    #[error("ledger migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl LedgerError {
    pub fn corrupt(path: impl Into<PathBuf>, detail: impl fmt::Display) -> Self {
        Self::Corrupt {
            path: path.into(),
            detail: detail.to_string(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    #[must_use]
    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt { .. })
    }
}

/// Durable backing store for a [`Ledger`].
///
/// Implementations need not be internally synchronized for writes: the
/// ledger never calls [`persist`](Self::persist) concurrently.
#[async_trait]
pub trait LedgerStore: Send + Sync + fmt::Debug {
    /// Reads every persisted entry. A store that does not exist yet is empty.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Corrupt`] when the store exists but is unreadable.
    async fn load(&self) -> Result<Vec<LedgerEntry>, LedgerError>;

    /// Durably adds `entry`. `all` is the full ledger content including
    /// `entry`, ordered by identity, for stores that rewrite wholesale.
    ///
    /// Must leave the store in either its previous or its updated state.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry could not be made durable.
    async fn persist(&self, entry: &LedgerEntry, all: &[LedgerEntry]) -> Result<(), LedgerError>;

    /// Human-readable location for logs.
    fn location(&self) -> String;

    /// Releases connections or handles. Called once no more commits follow.
    async fn close(&self) {}
}

/// Which [`LedgerStore`] backs the ledger of an output root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    /// `{root}/ledger.json`, rewritten atomically on each commit.
    #[default]
    Json,
    /// `{root}/ledger.db`, one transactional insert per commit.
    Sqlite,
}

impl FromStr for LedgerBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(format!("unknown ledger backend '{other}' (expected json or sqlite)")),
        }
    }
}

impl fmt::Display for LedgerBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Json => "json",
            Self::Sqlite => "sqlite",
        })
    }
}

/// Result of a [`Ledger::commit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStatus {
    /// The entry is now durable and visible.
    Inserted,
    /// An entry with this identity already existed; nothing was written.
    AlreadyPresent,
}

/// In-memory view of the durable ledger.
#[derive(Debug)]
pub struct Ledger {
    store: Box<dyn LedgerStore>,
    entries: RwLock<BTreeMap<String, LedgerEntry>>,
    commit_lock: Mutex<()>,
}

impl Ledger {
    /// Loads the ledger from `store`.
    ///
    /// # Errors
    ///
    /// Propagates [`LedgerError::Corrupt`]; callers must not fall back to an
    /// empty ledger.
    #[instrument(skip(store), fields(store = %store.location()))]
    pub async fn open(store: impl LedgerStore + 'static) -> Result<Self, LedgerError> {
        Self::open_boxed(Box::new(store)).await
    }

    /// Opens the ledger of `layout` with the chosen backend.
    ///
    /// # Errors
    ///
    /// See [`Ledger::open`].
    pub async fn open_backend(
        backend: LedgerBackend,
        layout: &OutputLayout,
    ) -> Result<Self, LedgerError> {
        match backend {
            LedgerBackend::Json => Self::open(JsonLedgerStore::new(layout.ledger_json_path())).await,
            LedgerBackend::Sqlite => {
                Self::open(SqliteLedgerStore::connect(&layout.ledger_db_path()).await?).await
            }
        }
    }

    async fn open_boxed(store: Box<dyn LedgerStore>) -> Result<Self, LedgerError> {
        let loaded = store.load().await?;
        let mut entries = BTreeMap::new();
        for entry in loaded {
            if entries.contains_key(&entry.identity) {
                warn!(identity = %entry.identity, "duplicate ledger record ignored");
                continue;
            }
            entries.insert(entry.identity.clone(), entry);
        }
        info!(entries = entries.len(), store = %store.location(), "ledger loaded");

        Ok(Self {
            store,
            entries: RwLock::new(entries),
            commit_lock: Mutex::new(()),
        })
    }

    /// Returns whether `identity` has a completion record.
    #[must_use]
    pub fn contains(&self, identity: &str) -> bool {
        self.read().contains_key(identity)
    }

    #[must_use]
    pub fn get(&self, identity: &str) -> Option<LedgerEntry> {
        self.read().get(identity).cloned()
    }

    /// Durably records `entry`, then makes it visible to [`contains`](Self::contains).
    ///
    /// Committing an identity that is already present is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the store error; the in-memory view is left unchanged.
    #[instrument(skip(self, entry), fields(identity = %entry.identity))]
    pub async fn commit(&self, entry: LedgerEntry) -> Result<CommitStatus, LedgerError> {
        let _writer = self.commit_lock.lock().await;

        let all = {
            let entries = self.read();
            if entries.contains_key(&entry.identity) {
                debug!("identity already in ledger");
                return Ok(CommitStatus::AlreadyPresent);
            }
            let mut all: Vec<LedgerEntry> = entries.values().cloned().collect();
            let at = all.partition_point(|e| e.identity < entry.identity);
            all.insert(at, entry.clone());
            all
        };

        self.store.persist(&entry, &all).await?;

        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entry.identity.clone(), entry);
        debug!("ledger commit durable");
        Ok(CommitStatus::Inserted)
    }

    /// Snapshot of every entry, ordered by identity.
    #[must_use]
    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.read().values().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    #[must_use]
    pub fn location(&self) -> String {
        self.store.location()
    }

    /// Closes the backing store. Commits after this point fail.
    pub async fn close(&self) {
        self.store.close().await;
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, LedgerEntry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }
}
