//! HTTP client wrapper for catalog pages and artifact downloads.
//!
//! Artifacts are streamed into a hidden temporary file next to their final
//! path and only renamed into place once complete, non-empty and (optionally)
//! signature-checked. The temporary file is deleted on every error path and
//! when the download future is dropped mid-stream.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::RETRY_AFTER;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use url::Url;

use super::error::DownloadError;
use crate::filename::PARTIAL_SUFFIX;
use crate::user_agent;

/// Default per-call connect and read timeout (30 seconds).
pub const DEFAULT_NETWORK_TIMEOUT: Duration = Duration::from_secs(30);

/// Leading bytes of every PDF document.
const PDF_SIGNATURE: &[u8] = b"%PDF-";

/// HTTP client with connection pooling, shared by all workers.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    verify_pdf_signature: bool,
}

/// Result of a successful artifact download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedArtifact {
    /// Final path; the file there is complete.
    pub path: PathBuf,
    pub bytes: u64,
    /// Lowercase hex SHA-256 of the content.
    pub sha256: String,
}

impl HttpClient {
    /// Creates a client with the crate User-Agent and default timeouts.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialized.
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_options(&user_agent::default_user_agent(), DEFAULT_NETWORK_TIMEOUT)
    }

    /// Creates a client with an explicit User-Agent and per-call timeout.
    ///
    /// The timeout bounds connecting and each individual read, not the whole
    /// transfer, so large artifacts on slow links still complete.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialized.
    pub fn with_options(user_agent: &str, network_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(network_timeout)
            .read_timeout(network_timeout)
            .gzip(true)
            .user_agent(user_agent)
            .build()?;
        Ok(Self {
            client,
            verify_pdf_signature: true,
        })
    }

    /// Enables or disables the `%PDF-` signature check on artifacts.
    #[must_use]
    pub fn with_pdf_signature_check(mut self, enabled: bool) -> Self {
        self.verify_pdf_signature = enabled;
        self
    }

    /// Fetches a catalog page as text.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError`] for invalid URLs, network failures, timeouts
    /// and non-success statuses.
    #[instrument(skip(self))]
    pub async fn fetch_page(&self, url: &str) -> Result<String, DownloadError> {
        let response = self.send_get(url).await?;
        response
            .text()
            .await
            .map_err(|e| DownloadError::from_reqwest(url, e))
    }

    /// Streams `url` into `final_path` atomically.
    ///
    /// The parent directory of `final_path` must exist. If `cancel` fires
    /// mid-stream the temporary file is removed and
    /// [`DownloadError::Cancelled`] is returned.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError`] on network or HTTP failure, an empty body, a
    /// body failing the signature check, or a local IO failure.
    #[instrument(skip(self, cancel), fields(path = %final_path.display()))]
    pub async fn download_to_path(
        &self,
        url: &str,
        final_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<DownloadedArtifact, DownloadError> {
        let response = tokio::select! {
            () = cancel.cancelled() => return Err(DownloadError::cancelled(url)),
            response = self.send_get(url) => response?,
        };

        let parent = final_path.parent().unwrap_or_else(|| Path::new("."));
        let temp = tempfile::Builder::new()
            .prefix(".")
            .suffix(PARTIAL_SUFFIX)
            .tempfile_in(parent)
            .map_err(|e| DownloadError::io(parent, e))?;
        let (std_file, temp_path) = temp.into_parts();
        debug!(temp = %temp_path.display(), "streaming to temporary file");

        let mut file = tokio::fs::File::from_std(std_file);
        let streamed = tokio::select! {
            () = cancel.cancelled() => Err(DownloadError::cancelled(url)),
            streamed = stream_body(&mut file, response, url, &temp_path, self.verify_pdf_signature) => streamed,
        };
        // On error `temp_path` is dropped here, which deletes the partial file.
        let (bytes, sha256) = streamed?;
        drop(file);

        temp_path
            .persist(final_path)
            .map_err(|e| DownloadError::io(final_path, e.error))?;

        info!(bytes, "artifact complete");
        Ok(DownloadedArtifact {
            path: final_path.to_path_buf(),
            bytes,
            sha256,
        })
    }

    async fn send_get(&self, url: &str) -> Result<reqwest::Response, DownloadError> {
        let parsed = Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(DownloadError::invalid_url(url));
        }

        let response = self
            .client
            .get(parsed)
            .send()
            .await
            .map_err(|e| DownloadError::from_reqwest(url, e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            return Err(DownloadError::http_status_with_retry_after(
                url,
                status.as_u16(),
                retry_after,
            ));
        }

        Ok(response)
    }
}

/// Streams the body, hashing as it goes. Returns `(bytes, sha256_hex)`.
async fn stream_body(
    file: &mut tokio::fs::File,
    response: reqwest::Response,
    url: &str,
    temp_path: &Path,
    verify_pdf_signature: bool,
) -> Result<(u64, String), DownloadError> {
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut hasher = Sha256::new();
    let mut head: Vec<u8> = Vec::with_capacity(PDF_SIGNATURE.len());
    let mut bytes: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| DownloadError::from_reqwest(url, e))?;

        if verify_pdf_signature && head.len() < PDF_SIGNATURE.len() {
            let take = (PDF_SIGNATURE.len() - head.len()).min(chunk.len());
            head.extend_from_slice(&chunk[..take]);
            if head.len() == PDF_SIGNATURE.len() && head != PDF_SIGNATURE {
                return Err(DownloadError::unexpected_content(
                    url,
                    "body does not start with %PDF-",
                ));
            }
        }

        hasher.update(&chunk);
        writer
            .write_all(&chunk)
            .await
            .map_err(|e| DownloadError::io(temp_path, e))?;
        bytes += chunk.len() as u64;
    }

    if bytes == 0 {
        return Err(DownloadError::empty_body(url));
    }
    if verify_pdf_signature && head.len() < PDF_SIGNATURE.len() {
        return Err(DownloadError::unexpected_content(
            url,
            "body too short to be a PDF",
        ));
    }

    writer
        .flush()
        .await
        .map_err(|e| DownloadError::io(temp_path, e))?;
    writer
        .get_ref()
        .sync_all()
        .await
        .map_err(|e| DownloadError::io(temp_path, e))?;

    Ok((bytes, format!("{:x}", hasher.finalize())))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_support::start_mock_server_or_skip;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, ResponseTemplate};

    const PDF_BODY: &[u8] = b"%PDF-1.7\nfake paper body";

    fn client() -> HttpClient {
        HttpClient::with_options("harvester-test", Duration::from_secs(5)).unwrap()
    }

    fn dir_entries(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }

    #[tokio::test]
    async fn test_download_to_path_success_writes_final_file() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        let temp_dir = TempDir::new().unwrap();
        Mock::given(method("GET"))
            .and(path("/paper.pdf"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(PDF_BODY))
            .mount(&server)
            .await;

        let final_path = temp_dir.path().join("Paper.pdf");
        let artifact = client()
            .download_to_path(
                &format!("{}/paper.pdf", server.uri()),
                &final_path,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(artifact.path, final_path);
        assert_eq!(artifact.bytes, PDF_BODY.len() as u64);
        assert_eq!(artifact.sha256, format!("{:x}", Sha256::digest(PDF_BODY)));
        assert_eq!(std::fs::read(&final_path).unwrap(), PDF_BODY);
        assert_eq!(dir_entries(temp_dir.path()), vec!["Paper.pdf".to_string()]);
    }

    #[tokio::test]
    async fn test_download_to_path_http_error_carries_retry_after() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        let temp_dir = TempDir::new().unwrap();
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "3"))
            .mount(&server)
            .await;

        let err = client()
            .download_to_path(
                &format!("{}/busy.pdf", server.uri()),
                &temp_dir.path().join("Busy.pdf"),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::HttpStatus { status: 429, .. }));
        assert_eq!(err.retry_after(), Some("3"));
        assert!(dir_entries(temp_dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_download_to_path_empty_body_leaves_nothing() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        let temp_dir = TempDir::new().unwrap();
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let err = client()
            .download_to_path(
                &format!("{}/empty.pdf", server.uri()),
                &temp_dir.path().join("Empty.pdf"),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::EmptyBody { .. }), "got {err:?}");
        assert!(dir_entries(temp_dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_download_to_path_rejects_html_body() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        let temp_dir = TempDir::new().unwrap();
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>login</html>"))
            .mount(&server)
            .await;

        let err = client()
            .download_to_path(
                &format!("{}/login.pdf", server.uri()),
                &temp_dir.path().join("Login.pdf"),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::UnexpectedContent { .. }));
        assert!(dir_entries(temp_dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_download_to_path_signature_check_can_be_disabled() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        let temp_dir = TempDir::new().unwrap();
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("plain"))
            .mount(&server)
            .await;

        let artifact = client()
            .with_pdf_signature_check(false)
            .download_to_path(
                &format!("{}/plain", server.uri()),
                &temp_dir.path().join("Plain.pdf"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(artifact.bytes, 5);
    }

    #[tokio::test]
    async fn test_download_to_path_cancelled_leaves_nothing() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        let temp_dir = TempDir::new().unwrap();
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(PDF_BODY)
                    .set_delay(Duration::from_secs(10)),
            )
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = client()
            .download_to_path(
                &format!("{}/slow.pdf", server.uri()),
                &temp_dir.path().join("Slow.pdf"),
                &cancel,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::Cancelled { .. }));
        assert!(dir_entries(temp_dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_fetch_page_returns_text_and_rejects_bad_scheme() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/index.html"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<a href='x'>x</a>"))
            .mount(&server)
            .await;

        let body = client()
            .fetch_page(&format!("{}/index.html", server.uri()))
            .await
            .unwrap();
        assert!(body.contains("href"));

        let err = client().fetch_page("ftp://example.com/x").await.unwrap_err();
        assert!(matches!(err, DownloadError::InvalidUrl { .. }));
    }
}
