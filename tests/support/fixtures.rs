use std::path::{Path, PathBuf};
use std::sync::Arc;

use harvester_core::adapter::{StaticCollection, StaticSubCollection};
use harvester_core::config::{PolitenessSettings, RetrySettings};
use harvester_core::{
    HarvestConfig, Ledger, LedgerBackend, OutputLayout, StaticCatalog, Track, WorkItemCandidate,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use super::socket_guard::should_skip_socket_bound_test;

/// Minimal body that passes the `%PDF-` signature check.
#[must_use]
pub fn pdf_body(tag: &str) -> Vec<u8> {
    format!("%PDF-1.7\n% {tag}\n%%EOF\n").into_bytes()
}

/// Candidate with an artifact URL (or none).
#[must_use]
pub fn candidate(title: &str, artifact_url: Option<String>) -> WorkItemCandidate {
    WorkItemCandidate {
        display_title: title.to_string(),
        artifact_url,
        ..WorkItemCandidate::default()
    }
}

/// One collection with one sub-collection holding `items`.
#[must_use]
pub fn single_volume_catalog(items: Vec<WorkItemCandidate>) -> StaticCatalog {
    StaticCatalog::new(
        "test",
        vec![StaticCollection {
            id: "ACL".to_string(),
            url: "manifest:acl-2023".to_string(),
            year: Some(2023),
            sub_collections: vec![StaticSubCollection {
                id: "2023.acl-long".to_string(),
                url: "manifest:acl-2023/long".to_string(),
                year: None,
                track: Track::Main,
                items,
            }],
        }],
    )
}

pub fn shared(catalog: StaticCatalog) -> Arc<StaticCatalog> {
    Arc::new(catalog)
}

/// Fast, deterministic configuration: no politeness delay, no jitter, short
/// backoff.
#[must_use]
pub fn test_config(root: &Path) -> HarvestConfig {
    HarvestConfig {
        output_root: root.to_path_buf(),
        retry: RetrySettings {
            max_attempts: 3,
            base_delay_ms: 10,
            max_delay_ms: 50,
            jitter_ms: 0,
        },
        politeness: PolitenessSettings {
            min_delay_ms: 0,
            max_delay_ms: 0,
        },
        drain_timeout_ms: 500,
        ..HarvestConfig::default()
    }
}

pub async fn open_ledger(root: &Path, backend: LedgerBackend) -> Ledger {
    Ledger::open_backend(backend, &OutputLayout::new(root))
        .await
        .unwrap()
}

/// Files under `dir` whose name ends with `.part`.
#[must_use]
pub fn partial_files(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .map(|entry| entry.path())
                .filter(|path| path.to_string_lossy().ends_with(".part"))
                .collect()
        })
        .unwrap_or_default()
}

/// Starts a server whose artifact responses send headers and the first body
/// bytes, then never finish. Returns the artifact URL, or `None` when
/// localhost sockets are unavailable.
pub async fn start_stalling_artifact_server() -> Option<String> {
    if should_skip_socket_bound_test() {
        return None;
    }
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        // Connections are held open until the runtime shuts down.
        let mut held = Vec::new();
        while let Ok((mut socket, _)) = listener.accept().await {
            let mut request = [0u8; 2048];
            let _ = socket.read(&mut request).await;
            let _ = socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\n\
                      Content-Type: application/pdf\r\n\
                      Content-Length: 1048576\r\n\
                      \r\n\
                      %PDF-1.7\n% first bytes of a much larger file\n",
                )
                .await;
            let _ = socket.flush().await;
            held.push(socket);
        }
    });

    Some(format!("http://{addr}/stalled.pdf"))
}
