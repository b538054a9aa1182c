//! Production [`RemoteMetadataClient`] backed by Civitai and HuggingFace.

use super::types::{FileResult, MetadataResult, TransferProgress};
use super::urls::RegistryUrl;
use super::{civitai, huggingface, ProgressFn, RemoteMetadataClient};
use crate::cancel::CancellationToken;
use crate::config::NetworkConfig;
use crate::error::{AtelierError, Result};
use crate::network::{redact_query, HttpClient};
use crate::settings::Credentials;
use async_trait::async_trait;
use futures::StreamExt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Registry client speaking HTTPS to the public registries.
pub struct HttpRegistryClient {
    http: Arc<HttpClient>,
    progress_interval: Duration,
}

impl HttpRegistryClient {
    /// Create a client presenting `credentials` to the matching hosts.
    pub fn new(credentials: Credentials) -> Result<Self> {
        Ok(Self::with_http(Arc::new(HttpClient::new(credentials)?)))
    }

    /// Create a client over an existing HTTP client.
    pub fn with_http(http: Arc<HttpClient>) -> Self {
        Self {
            http,
            progress_interval: NetworkConfig::DOWNLOAD_PROGRESS_INTERVAL,
        }
    }

    /// Set how often download progress is reported.
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }
}

#[async_trait]
impl RemoteMetadataClient for HttpRegistryClient {
    async fn lookup_by_hash(&self, sha256: &str) -> Result<MetadataResult> {
        let sha256 = sha256.trim();
        if sha256.len() != 64 || !sha256.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(AtelierError::Validation {
                field: "sha256".into(),
                message: format!("'{}' is not a SHA256 hex digest", sha256),
            });
        }
        civitai::lookup_by_hash(&self.http, sha256).await
    }

    async fn lookup_by_url(&self, url: &str) -> Result<MetadataResult> {
        match RegistryUrl::parse(url)? {
            RegistryUrl::CivitaiModel {
                model_id,
                version_id,
            } => civitai::lookup_by_model(&self.http, model_id, version_id).await,
            RegistryUrl::CivitaiVersion { version_id } => {
                civitai::lookup_by_version(&self.http, version_id).await
            }
            RegistryUrl::HuggingfaceFile {
                repo,
                revision,
                file_path,
            } => huggingface::lookup_file(&self.http, &repo, &revision, &file_path).await,
        }
    }

    async fn download(
        &self,
        url: &str,
        dest: &Path,
        on_progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<FileResult> {
        cancel.check()?;
        let response = self.http.get_stream(url).await?;
        let total_bytes = response.content_length();

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| AtelierError::io_with_path(e, dest))?;

        let mut bytes_downloaded: u64 = 0;
        let mut last_report = Instant::now();
        let mut stream = response.bytes_stream();
        on_progress(TransferProgress {
            bytes_downloaded,
            total_bytes,
        });

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AtelierError::Cancelled),
                next = stream.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(|e| AtelierError::Network {
                message: format!("Error reading {}: {}", redact_query(url), e),
                status: None,
            })?;

            file.write_all(&chunk)
                .await
                .map_err(|e| AtelierError::io_with_path(e, dest))?;
            bytes_downloaded += chunk.len() as u64;

            if last_report.elapsed() >= self.progress_interval {
                on_progress(TransferProgress {
                    bytes_downloaded,
                    total_bytes,
                });
                last_report = Instant::now();
            }
        }

        file.flush()
            .await
            .map_err(|e| AtelierError::io_with_path(e, dest))?;
        file.sync_all()
            .await
            .map_err(|e| AtelierError::io_with_path(e, dest))?;

        if let Some(expected) = total_bytes {
            if expected != bytes_downloaded {
                return Err(AtelierError::Network {
                    message: format!(
                        "Connection closed after {} of {} bytes from {}",
                        bytes_downloaded,
                        expected,
                        redact_query(url)
                    ),
                    status: None,
                });
            }
        }

        on_progress(TransferProgress {
            bytes_downloaded,
            total_bytes,
        });
        debug!("Streamed {} bytes to {}", bytes_downloaded, dest.display());
        info!("Downloaded {}", redact_query(url));

        Ok(FileResult {
            path: dest.to_path_buf(),
            bytes_written: bytes_downloaded,
        })
    }
}
