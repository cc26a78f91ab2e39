//! Artifact fetching: HTTP client, retry policy, politeness and the
//! bounded executor that runs each work item to completion.
//!
//! # Features
//!
//! - Streaming downloads into a temporary file, renamed into place only
//!   once complete (a partial artifact is never visible under its final name)
//! - SHA-256 and byte count computed while streaming
//! - Exponential backoff with jitter for transient failures, honoring
//!   `Retry-After` on 429
//! - Per-host randomized politeness delay
//!
//! # Example
//!
//! ```no_run
//! use harvester_core::download::HttpClient;
//! use std::path::Path;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = HttpClient::new()?;
//! let artifact = client
//!     .download_to_path(
//!         "https://aclanthology.org/2023.acl-long.1.pdf",
//!         Path::new("./harvest/pdfs/Some Paper.pdf"),
//!         &CancellationToken::new(),
//!     )
//!     .await?;
//! println!("{} bytes, sha256 {}", artifact.bytes, artifact.sha256);
//! # Ok(())
//! # }
//! ```

mod client;
mod error;
mod executor;
pub mod rate_limiter;
mod retry;

pub use client::{DEFAULT_NETWORK_TIMEOUT, DownloadedArtifact, HttpClient};
pub use error::DownloadError;
pub use executor::{Executor, ExecutorStats, ItemError, ItemState, Outcome, SkipReason};
pub use rate_limiter::{RateLimiter, extract_domain, parse_retry_after};
pub use retry::{
    DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY, DEFAULT_MAX_JITTER, FailureType,
    RetryDecision, RetryPolicy, classify_error, classify_http_status,
};
