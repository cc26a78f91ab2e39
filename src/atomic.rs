//! Crash-consistent whole-file writes.

use std::io::{self, Write};
use std::path::Path;

use tempfile::NamedTempFile;

/// Replaces `target` with `content` so that readers see either the previous
/// file or the complete new one, never a torn write.
///
/// The content is written to a hidden temp file in the same directory,
/// fsynced, then renamed over `target`. The directory entry is synced where
/// the platform allows it.
pub(crate) fn write_atomic(target: &Path, content: &[u8]) -> io::Result<()> {
    let dir = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut tmp = tempfile::Builder::new()
        .prefix(".")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    tmp.write_all(content)?;
    tmp.flush()?;
    tmp.as_file_mut().sync_all()?;
    persist(tmp, target)?;

    sync_dir(dir);
    Ok(())
}

/// Async wrapper running [`write_atomic`] on the blocking pool.
pub(crate) async fn write_atomic_async(target: &Path, content: Vec<u8>) -> io::Result<()> {
    let target = target.to_path_buf();
    tokio::task::spawn_blocking(move || write_atomic(&target, &content))
        .await
        .map_err(io::Error::other)?
}

fn persist(tmp: NamedTempFile, target: &Path) -> io::Result<()> {
    tmp.persist(target).map(|_| ()).map_err(|e| e.error)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(handle) = std::fs::File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}
