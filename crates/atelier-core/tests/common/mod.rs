//! Shared fixtures for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use atelier_core::registry::{FileResult, ProgressFn, RemoteFile, TransferProgress};
use atelier_core::{
    AtelierApi, AtelierError, CancellationToken, OrchestratorConfig, Provider, RemoteMetadata,
    RemoteMetadataClient, Result, RetryConfig, Settings,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;

/// Registry double answering from scripted tables and counting calls.
#[derive(Default)]
pub struct ScriptedClient {
    pub hash_lookups: AtomicUsize,
    pub url_lookups: AtomicUsize,
    pub downloads: AtomicUsize,
    by_hash: Mutex<HashMap<String, RemoteMetadata>>,
    by_url: Mutex<HashMap<String, RemoteMetadata>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    /// Lookups that fail with a 503 before the scripted answer is given
    transient_failures: AtomicUsize,
    lookup_delay: Duration,
    chunk_delay: Duration,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lookup_delay(mut self, delay: Duration) -> Self {
        self.lookup_delay = delay;
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    pub fn with_transient_failures(self, count: usize) -> Self {
        self.transient_failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn answer_hash(&self, sha256: &str, metadata: RemoteMetadata) {
        self.by_hash
            .lock()
            .unwrap()
            .insert(sha256.to_string(), metadata);
    }

    pub fn answer_url(&self, url: &str, metadata: RemoteMetadata) {
        self.by_url.lock().unwrap().insert(url.to_string(), metadata);
    }

    pub fn serve_file(&self, url: &str, bytes: Vec<u8>) {
        self.files.lock().unwrap().insert(url.to_string(), bytes);
    }

    async fn before_lookup(&self) -> Result<()> {
        if !self.lookup_delay.is_zero() {
            tokio::time::sleep(self.lookup_delay).await;
        }
        let failing = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(AtelierError::Network {
                message: "service unavailable".to_string(),
                status: Some(503),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteMetadataClient for ScriptedClient {
    async fn lookup_by_hash(&self, sha256: &str) -> Result<RemoteMetadata> {
        self.hash_lookups.fetch_add(1, Ordering::SeqCst);
        self.before_lookup().await?;
        self.by_hash
            .lock()
            .unwrap()
            .get(sha256)
            .cloned()
            .ok_or_else(|| AtelierError::NotFound {
                what: format!("model with hash {}", sha256),
            })
    }

    async fn lookup_by_url(&self, url: &str) -> Result<RemoteMetadata> {
        self.url_lookups.fetch_add(1, Ordering::SeqCst);
        self.before_lookup().await?;
        self.by_url
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| AtelierError::NotFound {
                what: url.to_string(),
            })
    }

    async fn download(
        &self,
        url: &str,
        dest: &Path,
        on_progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<FileResult> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        let bytes = self
            .files
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| AtelierError::NotFound {
                what: url.to_string(),
            })?;

        let mut file = tokio::fs::File::create(dest).await?;
        let total = bytes.len() as u64;
        let mut written = 0u64;
        for chunk in bytes.chunks(bytes.len().div_ceil(16).max(1)) {
            cancel.check()?;
            if !self.chunk_delay.is_zero() {
                tokio::time::sleep(self.chunk_delay).await;
            }
            file.write_all(chunk).await?;
            written += chunk.len() as u64;
            on_progress(TransferProgress {
                bytes_downloaded: written,
                total_bytes: Some(total),
            });
        }
        file.flush().await?;
        Ok(FileResult {
            path: dest.to_path_buf(),
            bytes_written: written,
        })
    }
}

/// Metadata for a model version with a single primary file.
pub fn model_metadata(name: &str, file: Option<(&str, &[u8], &str)>) -> RemoteMetadata {
    let mut metadata = RemoteMetadata::new(Provider::Other);
    metadata.name = Some(name.to_string());
    metadata.creator = Some("tester".to_string());
    metadata.model_type = Some("LORA".to_string());
    if let Some((file_name, bytes, url)) = file {
        metadata.files.push(RemoteFile {
            name: file_name.to_string(),
            size_bytes: Some(bytes.len() as u64),
            sha256: None,
            download_url: Some(url.to_string()),
            primary: true,
        });
    }
    metadata
}

pub struct Harness {
    pub temp: TempDir,
    pub client: Arc<ScriptedClient>,
    pub api: AtelierApi,
}

impl Harness {
    pub async fn new(client: ScriptedClient) -> Self {
        Self::with_settings(client, Settings::default()).await
    }

    pub async fn with_settings(client: ScriptedClient, settings: Settings) -> Self {
        let temp = TempDir::new().unwrap();
        let client = Arc::new(client);
        let retry = RetryConfig::new()
            .with_base_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(5));
        let api = AtelierApi::builder(settings)
            .app_dir(temp.path())
            .registry(client.clone())
            .persist_identities(false)
            .orchestrator(OrchestratorConfig::new().with_retry(retry))
            .build()
            .await
            .unwrap();
        Self { temp, client, api }
    }

    pub fn write_file(&self, name: &str, bytes: &[u8]) -> std::path::PathBuf {
        let path = self.temp.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, bytes).unwrap();
        path
    }
}
