//! Title sanitization, identity derivation and output layout.
//!
//! Every artifact and metadata file is named after the item identity, which is
//! the sanitized display title. Two items sharing a title therefore share an
//! identity (and a file name); see `DESIGN.md` for why this is kept.

use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};

/// Default maximum identity length in characters.
pub const DEFAULT_MAX_FILENAME_LEN: usize = 150;

/// Subdirectory of the output root holding artifacts.
pub const PDF_DIR: &str = "pdfs";

/// Subdirectory of the output root holding per-item metadata records.
pub const JSON_DIR: &str = "json";

/// File name of the JSON ledger store.
pub const LEDGER_JSON_FILE: &str = "ledger.json";

/// File name of the SQLite ledger store.
pub const LEDGER_DB_FILE: &str = "ledger.db";

/// Suffix of an artifact still being streamed (`pdfs/.<random>.part`).
pub const PARTIAL_SUFFIX: &str = ".part";

/// Sanitizes a display title into a filesystem-safe name.
///
/// Keeps alphanumerics (any script), space, `_` and `-`; strips everything
/// else; collapses whitespace runs into a single space and truncates to
/// `max_len` characters.
///
/// ```
/// use harvester_core::filename::sanitize_title;
///
/// assert_eq!(
///     sanitize_title("Attention Is All You/Need: A*Study?", 150),
///     "Attention Is All YouNeed AStudy"
/// );
/// assert_eq!(sanitize_title("Attention Is All You/Need", 9), "Attention");
/// ```
#[must_use]
pub fn sanitize_title(title: &str, max_len: usize) -> String {
    let mut out = String::with_capacity(title.len());
    let mut pending_space = false;

    for ch in title.chars() {
        if ch.is_whitespace() {
            pending_space = !out.is_empty();
            continue;
        }
        if !(ch.is_alphanumeric() || ch == '_' || ch == '-') {
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        out.push(ch);
    }

    let truncated: String = out.chars().take(max_len.max(1)).collect();
    truncated.trim_end().to_string()
}

/// Derives the dedup identity for a display title.
///
/// Titles that sanitize to nothing (e.g. only punctuation) get a stable
/// `untitled-<hash>` identity so they still have a usable file name.
#[must_use]
pub fn identity_for_title(title: &str, max_len: usize) -> String {
    let sanitized = sanitize_title(title, max_len);
    if !sanitized.is_empty() && is_safe_filename_segment(&sanitized) {
        return sanitized;
    }
    let digest = Sha256::digest(title.as_bytes());
    let hex = format!("{digest:x}");
    format!("untitled-{}", &hex[..12])
}

fn is_safe_filename_segment(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(components.next(), Some(Component::Normal(_))) && components.next().is_none()
}

/// On-disk layout of one output root.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    /// Creates a layout rooted at `root`. Nothing is created on disk.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn pdf_dir(&self) -> PathBuf {
        self.root.join(PDF_DIR)
    }

    #[must_use]
    pub fn json_dir(&self) -> PathBuf {
        self.root.join(JSON_DIR)
    }

    /// Final artifact path for an identity: `{root}/pdfs/{identity}.pdf`.
    #[must_use]
    pub fn artifact_path(&self, identity: &str) -> PathBuf {
        self.pdf_dir().join(format!("{identity}.pdf"))
    }

    /// Metadata path for an identity: `{root}/json/{identity}.json`.
    #[must_use]
    pub fn metadata_path(&self, identity: &str) -> PathBuf {
        self.json_dir().join(format!("{identity}.json"))
    }

    #[must_use]
    pub fn ledger_json_path(&self) -> PathBuf {
        self.root.join(LEDGER_JSON_FILE)
    }

    #[must_use]
    pub fn ledger_db_path(&self) -> PathBuf {
        self.root.join(LEDGER_DB_FILE)
    }

    /// Creates the root, `pdfs/` and `json/` directories if missing.
    ///
    /// # Errors
    ///
    /// Returns the underlying IO error when a directory cannot be created.
    pub async fn ensure_dirs(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(self.pdf_dir()).await?;
        tokio::fs::create_dir_all(self.json_dir()).await
    }

    /// Deletes partial artifacts left in `pdfs/` by a killed run and returns
    /// how many were removed.
    ///
    /// Only call this before the run's first download starts.
    ///
    /// # Errors
    ///
    /// Returns the underlying IO error when the directory cannot be listed or
    /// a file cannot be removed.
    pub async fn remove_stale_partials(&self) -> std::io::Result<usize> {
        let mut entries = match tokio::fs::read_dir(self.pdf_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.')
                && name.ends_with(PARTIAL_SUFFIX)
                && entry.file_type().await?.is_file()
            {
                tokio::fs::remove_file(entry.path()).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
