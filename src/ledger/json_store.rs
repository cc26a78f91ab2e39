//! JSON ledger store: one pretty-printed array rewritten atomically per commit.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::{LedgerError, LedgerStore};
use crate::atomic::write_atomic_async;
use crate::model::LedgerEntry;

/// Consolidated JSON index at a fixed path (normally `{root}/ledger.json`).
#[derive(Debug, Clone)]
pub struct JsonLedgerStore {
    path: PathBuf,
}

impl JsonLedgerStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl LedgerStore for JsonLedgerStore {
    #[instrument(skip(self), fields(path = %self.path.display()))]
    async fn load(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no ledger yet, starting empty");
                return Ok(Vec::new());
            }
            Err(e) => return Err(LedgerError::corrupt(&self.path, e)),
        };

        serde_json::from_slice(&raw).map_err(|e| LedgerError::corrupt(&self.path, e))
    }

    async fn persist(&self, _entry: &LedgerEntry, all: &[LedgerEntry]) -> Result<(), LedgerError> {
        let mut body = serde_json::to_vec_pretty(all)
            .map_err(|e| LedgerError::io(&self.path, std::io::Error::other(e)))?;
        body.push(b'\n');

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| LedgerError::io(parent, e))?;
        }

        write_atomic_async(&self.path, body)
            .await
            .map_err(|e| LedgerError::io(&self.path, e))
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}
