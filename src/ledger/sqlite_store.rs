//! SQLite ledger store backed by `sqlx`.
//!
//! Each commit is a single `INSERT OR IGNORE` in its own transaction, so the
//! database holds either the pre- or post-commit state after a crash.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use tracing::instrument;

use super::{LedgerError, LedgerStore};
use crate::model::{LedgerEntry, Track};

/// Kept low for SQLite since it uses file-level locking.
const DEFAULT_MAX_CONNECTIONS: u32 = 4;

/// Connections wait this long before returning `SQLITE_BUSY`.
const BUSY_TIMEOUT_MS: u32 = 5000;

#[derive(Debug, Clone)]
pub struct SqliteLedgerStore {
    pool: SqlitePool,
    location: String,
}

impl SqliteLedgerStore {
    /// Opens (creating if needed) the database at `db_path`, enables WAL and
    /// runs migrations.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Corrupt`] if the file is not a usable SQLite
    /// database, or a migration error.
    #[instrument(skip(db_path), fields(path = %db_path.display()))]
    pub async fn connect(db_path: &Path) -> Result<Self, LedgerError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .connect(&db_url)
            .await
            .map_err(|e| LedgerError::corrupt(db_path, e))?;

        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&pool)
            .await
            .map_err(|e| LedgerError::corrupt(db_path, e))?;
        sqlx::query(&format!("PRAGMA busy_timeout={BUSY_TIMEOUT_MS}"))
            .execute(&pool)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self {
            pool,
            location: db_path.display().to_string(),
        })
    }

    /// In-memory database for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or migrations fail.
    pub async fn in_memory() -> Result<Self, LedgerError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self {
            pool,
            location: ":memory:".to_string(),
        })
    }

    fn entry_from_row(&self, row: &SqliteRow) -> Result<LedgerEntry, LedgerError> {
        let track: String = row.try_get("track")?;
        let completed_at: String = row.try_get("completed_at")?;
        let bytes: i64 = row.try_get("bytes")?;
        let local_path: String = row.try_get("local_path")?;

        Ok(LedgerEntry {
            identity: row.try_get("identity")?,
            local_path: local_path.into(),
            year: row.try_get("year")?,
            collection_id: row.try_get("collection_id")?,
            track: track
                .parse::<Track>()
                .map_err(|e| LedgerError::corrupt(&self.location, e))?,
            completed_at: DateTime::parse_from_rfc3339(&completed_at)
                .map_err(|e| LedgerError::corrupt(&self.location, e))?
                .with_timezone(&Utc),
            display_title: row.try_get("display_title")?,
            sub_collection_id: row.try_get("sub_collection_id")?,
            artifact_url: row.try_get("artifact_url")?,
            bytes: u64::try_from(bytes).unwrap_or_default(),
            sha256: row.try_get("sha256")?,
        })
    }
}

#[async_trait]
impl LedgerStore for SqliteLedgerStore {
    async fn load(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
        let rows = sqlx::query("SELECT * FROM ledger ORDER BY identity")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| LedgerError::corrupt(&self.location, e))?;
        rows.iter().map(|row| self.entry_from_row(row)).collect()
    }

    async fn persist(&self, entry: &LedgerEntry, _all: &[LedgerEntry]) -> Result<(), LedgerError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT OR IGNORE INTO ledger \
             (identity, local_path, year, collection_id, sub_collection_id, track, \
              display_title, artifact_url, bytes, sha256, completed_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.identity)
        .bind(entry.local_path.to_string_lossy().into_owned())
        .bind(entry.year)
        .bind(&entry.collection_id)
        .bind(&entry.sub_collection_id)
        .bind(entry.track.as_str())
        .bind(&entry.display_title)
        .bind(&entry.artifact_url)
        .bind(i64::try_from(entry.bytes).unwrap_or(i64::MAX))
        .bind(&entry.sha256)
        .bind(entry.completed_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    fn location(&self) -> String {
        self.location.clone()
    }

    /// Checkpoints the WAL and closes every pooled connection.
    async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::ledger::Ledger;
    use crate::ledger::test_entries::entry;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sqlite_store_round_trips_entry() {
        let store = SqliteLedgerStore::in_memory().await.unwrap();
        store.persist(&entry("Paper"), &[]).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, vec![entry("Paper")]);
    }

    #[tokio::test]
    async fn test_sqlite_store_insert_or_ignore() {
        let store = SqliteLedgerStore::in_memory().await.unwrap();
        store.persist(&entry("Paper"), &[]).await.unwrap();
        let mut other = entry("Paper");
        other.year = 1990;
        store.persist(&other, &[]).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].year, 2023);
    }

    #[tokio::test]
    async fn test_sqlite_ledger_survives_reopen_with_wal() {
        let temp = TempDir::new().unwrap();
        let db_path = temp.path().join("ledger.db");

        let store = SqliteLedgerStore::connect(&db_path).await.unwrap();
        let ledger = Ledger::open(store).await.unwrap();
        ledger.commit(entry("A")).await.unwrap();
        ledger.close().await;
        assert!(ledger.commit(entry("B")).await.is_err());
        drop(ledger);

        let reopened = Ledger::open(SqliteLedgerStore::connect(&db_path).await.unwrap())
            .await
            .unwrap();
        assert!(reopened.contains("A"));
    }

    #[tokio::test]
    async fn test_sqlite_garbage_file_is_corrupt() {
        let temp = TempDir::new().unwrap();
        let db_path = temp.path().join("ledger.db");
        std::fs::write(&db_path, vec![0x42; 4096]).unwrap();

        let err = SqliteLedgerStore::connect(&db_path).await.unwrap_err();
        assert!(err.is_corrupt(), "got {err:?}");
    }
}
