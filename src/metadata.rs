//! Per-item metadata records and the ledger commit that completes an item.
//!
//! [`MetadataWriter::write`] is the durability boundary of the pipeline: the
//! artifact is already at its final path, the JSON record is written
//! atomically next, and only then is the identity committed to the ledger.
//! An interruption anywhere before the commit leaves the identity absent, so
//! the next run re-attempts the item.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::atomic::write_atomic_async;
use crate::download::DownloadedArtifact;
use crate::filename::OutputLayout;
use crate::ledger::{Ledger, LedgerError};
use crate::model::{LedgerEntry, Track, WorkItem};

/// Failure to record a completed download.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("failed to write metadata {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize metadata for '{identity}': {source}")]
    Serialize {
        identity: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("ledger commit failed: {0}")]
    Ledger(#[from] LedgerError),
}

/// On-disk shape of `{root}/json/{identity}.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub title: String,
    pub year: i32,
    pub collection_id: String,
    pub sub_collection_id: String,
    pub track: Track,
    pub pdf_path: PathBuf,
    pub artifact_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail_url: Option<String>,
    pub bytes: u64,
    pub sha256: String,
    pub completed_at: DateTime<Utc>,
}

/// Everything known about an item once its artifact is on disk.
#[derive(Debug, Clone)]
pub struct MetadataPayload {
    pub item: WorkItem,
    pub artifact_url: String,
    pub artifact: DownloadedArtifact,
}

/// Writes metadata records and commits ledger entries. Cheap to share.
#[derive(Debug, Clone)]
pub struct MetadataWriter {
    layout: OutputLayout,
    ledger: Arc<Ledger>,
}

impl MetadataWriter {
    #[must_use]
    pub fn new(layout: OutputLayout, ledger: Arc<Ledger>) -> Self {
        Self { layout, ledger }
    }

    #[must_use]
    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Writes the item's metadata record and commits its ledger entry.
    ///
    /// Called once per downloaded item. If the identity was committed
    /// concurrently by someone else the existing entry is returned.
    ///
    /// # Errors
    ///
    /// Returns [`WriteError`] if the record cannot be written or the ledger
    /// commit fails; in both cases the identity stays uncommitted.
    #[instrument(skip(self, payload), fields(identity = %payload.item.identity))]
    pub async fn write(&self, payload: MetadataPayload) -> Result<LedgerEntry, WriteError> {
        let MetadataPayload {
            item,
            artifact_url,
            artifact,
        } = payload;
        let completed_at = Utc::now();

        let record = MetadataRecord {
            title: item.display_title.clone(),
            year: item.hierarchy.year,
            collection_id: item.hierarchy.collection_id.clone(),
            sub_collection_id: item.hierarchy.sub_collection_id.clone(),
            track: item.hierarchy.track,
            pdf_path: artifact.path.clone(),
            artifact_url: artifact_url.clone(),
            detail_url: item.detail_url.clone(),
            bytes: artifact.bytes,
            sha256: artifact.sha256.clone(),
            completed_at,
        };
        let mut body =
            serde_json::to_vec_pretty(&record).map_err(|source| WriteError::Serialize {
                identity: item.identity.clone(),
                source,
            })?;
        body.push(b'\n');

        let path = self.layout.metadata_path(&item.identity);
        write_atomic_async(&path, body)
            .await
            .map_err(|source| WriteError::Io {
                path: path.clone(),
                source,
            })?;
        debug!(path = %path.display(), "metadata written");

        let entry = LedgerEntry {
            identity: item.identity,
            local_path: artifact.path,
            year: item.hierarchy.year,
            collection_id: item.hierarchy.collection_id,
            track: item.hierarchy.track,
            completed_at,
            display_title: item.display_title,
            sub_collection_id: item.hierarchy.sub_collection_id,
            artifact_url,
            bytes: artifact.bytes,
            sha256: artifact.sha256,
        };

        self.ledger.commit(entry.clone()).await?;
        Ok(self.ledger.get(&entry.identity).unwrap_or(entry))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::ledger::JsonLedgerStore;
    use crate::model::Hierarchy;
    use tempfile::TempDir;

    fn item(title: &str) -> WorkItem {
        WorkItem {
            identity: title.to_string(),
            display_title: title.to_string(),
            hierarchy: Hierarchy {
                collection_id: "PMLR".to_string(),
                sub_collection_id: "v202".to_string(),
                year: 2023,
                track: Track::Main,
            },
            detail_url: None,
            artifact_url: Some("https://example.org/a.pdf".to_string()),
        }
    }

    async fn writer(temp: &TempDir) -> MetadataWriter {
        let layout = OutputLayout::new(temp.path());
        layout.ensure_dirs().await.unwrap();
        let ledger = Ledger::open(JsonLedgerStore::new(layout.ledger_json_path()))
            .await
            .unwrap();
        MetadataWriter::new(layout, Arc::new(ledger))
    }

    fn payload(layout: &OutputLayout, title: &str) -> MetadataPayload {
        MetadataPayload {
            item: item(title),
            artifact_url: "https://example.org/a.pdf".to_string(),
            artifact: DownloadedArtifact {
                path: layout.artifact_path(title),
                bytes: 9,
                sha256: "00".repeat(32),
            },
        }
    }

    #[tokio::test]
    async fn test_write_creates_record_then_commits() {
        let temp = TempDir::new().unwrap();
        let writer = writer(&temp).await;
        let layout = OutputLayout::new(temp.path());

        let entry = writer.write(payload(&layout, "Some Paper")).await.unwrap();

        assert_eq!(entry.identity, "Some Paper");
        assert_eq!(entry.local_path, layout.artifact_path("Some Paper"));
        assert!(writer.ledger().contains("Some Paper"));

        let record: MetadataRecord =
            serde_json::from_slice(&std::fs::read(layout.metadata_path("Some Paper")).unwrap())
                .unwrap();
        assert_eq!(record.title, "Some Paper");
        assert_eq!(record.year, 2023);
        assert_eq!(record.collection_id, "PMLR");
        assert_eq!(record.track, Track::Main);
        assert_eq!(record.pdf_path, layout.artifact_path("Some Paper"));
    }

    #[tokio::test]
    async fn test_write_failure_leaves_identity_uncommitted() {
        let temp = TempDir::new().unwrap();
        let writer = writer(&temp).await;
        let layout = OutputLayout::new(temp.path());
        std::fs::remove_dir_all(layout.json_dir()).unwrap();

        let err = writer.write(payload(&layout, "Lost")).await.unwrap_err();
        assert!(matches!(err, WriteError::Io { .. }), "got {err:?}");
        assert!(!writer.ledger().contains("Lost"));
    }
}
