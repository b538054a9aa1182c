//! What each task kind actually does.

use super::table::TaskTable;
use super::types::{TaskId, TaskOutput, TaskProgress, TaskSpec};
use crate::cache::{CacheEntry, CacheEntryUpdate, CacheStore};
use crate::cancel::CancellationToken;
use crate::error::{AtelierError, Result};
use crate::identity::{ContentIdentity, HashIdentity, HashProgress};
use crate::network::{retry_async, CollisionPolicy, DownloadManager, DownloadRequest, RetryConfig};
use crate::registry::{RemoteMetadata, RemoteMetadataClient, TransferProgress};
use crate::scan::{scan_directory, AssetMode, ModelType};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Share of a match task's progress spent on hashing.
const HASH_SHARE: f32 = 80.0;

/// Handle a running task uses to report progress and observe cancellation.
#[derive(Clone)]
pub(crate) struct TaskContext {
    pub id: TaskId,
    pub cancel: CancellationToken,
    table: Arc<TaskTable>,
}

impl TaskContext {
    pub(crate) fn new(id: TaskId, cancel: CancellationToken, table: Arc<TaskTable>) -> Self {
        Self { id, cancel, table }
    }

    pub fn report(&self, progress: TaskProgress) {
        self.table.set_progress(self.id, progress);
    }

    fn hash_reporter(&self, scale: f32) -> impl FnMut(HashProgress) + Send + 'static {
        let ctx = self.clone();
        move |p: HashProgress| ctx.report(TaskProgress::percent(p.percent() * scale / 100.0))
    }
}

/// Runs task specs against the identity resolver, cache store and registry.
pub struct TaskExecutor {
    identity: HashIdentity,
    cache: Arc<dyn CacheStore>,
    client: Arc<dyn RemoteMetadataClient>,
    downloads: DownloadManager,
    retry: RetryConfig,
}

impl TaskExecutor {
    pub fn new(
        identity: HashIdentity,
        cache: Arc<dyn CacheStore>,
        client: Arc<dyn RemoteMetadataClient>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            identity,
            cache,
            downloads: DownloadManager::new(client.clone()),
            client,
            retry,
        }
    }

    pub fn identity(&self) -> &HashIdentity {
        &self.identity
    }

    pub(crate) async fn execute(&self, spec: &TaskSpec, ctx: &TaskContext) -> Result<TaskOutput> {
        match spec {
            TaskSpec::Scan {
                root,
                mode,
                model_type,
            } => self.scan(root, *mode, model_type.clone(), ctx).await,
            TaskSpec::Hash { path } => self.hash(path, ctx).await,
            TaskSpec::MatchMetadata { path } => self.match_by_hash(path, ctx).await,
            TaskSpec::DownloadModel {
                url,
                dest_dir,
                policy,
            } => self.download_model(url, dest_dir, *policy, ctx).await,
            TaskSpec::DownloadMetadataByUrl { path, url } => {
                self.match_by_url(path, url, ctx).await
            }
        }
    }

    async fn scan(
        &self,
        root: &Path,
        mode: AssetMode,
        model_type: Option<ModelType>,
        ctx: &TaskContext,
    ) -> Result<TaskOutput> {
        let root = root.to_path_buf();
        let scan_ctx = ctx.clone();
        let assets = tokio::task::spawn_blocking(move || {
            scan_directory(&root, mode, model_type.as_ref(), &scan_ctx.cancel, |count| {
                scan_ctx.report(TaskProgress::Count(count as u64))
            })
        })
        .await
        .map_err(|e| AtelierError::Other(format!("Scan task failed: {}", e)))??;

        ctx.report(TaskProgress::Count(assets.len() as u64));
        Ok(TaskOutput::Scanned { assets })
    }

    async fn hash(&self, path: &Path, ctx: &TaskContext) -> Result<TaskOutput> {
        let identity = self
            .identity
            .identify_with(path, &ctx.cancel, ctx.hash_reporter(100.0))
            .await?;
        Ok(TaskOutput::Identified { identity })
    }

    /// Identify `path`, make sure its cache entry exists and is stamped as
    /// verified.
    async fn identify_and_touch(&self, path: &Path, ctx: &TaskContext) -> Result<ContentIdentity> {
        let identity = self
            .identity
            .identify_with(path, &ctx.cancel, ctx.hash_reporter(HASH_SHARE))
            .await?;
        self.cache
            .upsert(&identity.full_hash, CacheEntryUpdate::new().verified_now())
            .await?;
        Ok(identity)
    }

    async fn match_by_hash(&self, path: &Path, ctx: &TaskContext) -> Result<TaskOutput> {
        let identity = self.identify_and_touch(path, ctx).await?;
        ctx.report(TaskProgress::percent(HASH_SHARE));

        let hash = identity.full_hash;
        let metadata = self
            .with_retry(ctx, || self.client.lookup_by_hash(&hash))
            .await?;
        self.attach_metadata(&hash, &metadata, ctx).await?;
        Ok(TaskOutput::Matched { hash, metadata })
    }

    async fn match_by_url(&self, path: &Path, url: &str, ctx: &TaskContext) -> Result<TaskOutput> {
        let identity = self.identify_and_touch(path, ctx).await?;
        ctx.report(TaskProgress::percent(HASH_SHARE));

        let metadata = self
            .with_retry(ctx, || self.client.lookup_by_url(url))
            .await?;
        let hash = identity.full_hash;
        self.attach_metadata(&hash, &metadata, ctx).await?;
        Ok(TaskOutput::Matched { hash, metadata })
    }

    async fn download_model(
        &self,
        url: &str,
        dest_dir: &Path,
        policy: CollisionPolicy,
        ctx: &TaskContext,
    ) -> Result<TaskOutput> {
        let metadata = self
            .with_retry(ctx, || self.client.lookup_by_url(url))
            .await?;

        let file = metadata.primary_file();
        let source = file
            .and_then(|f| f.download_url.clone())
            .or_else(|| metadata.download_url.clone())
            .ok_or_else(|| AtelierError::UnsupportedUrl {
                url: url.to_string(),
                reason: "registry lists no downloadable file".to_string(),
            })?;

        let mut request = DownloadRequest::new(source, dest_dir).with_policy(policy);
        if let Some(file) = file {
            request = request
                .with_file_name(file.name.clone())
                .with_expected_size(file.size_bytes)
                .with_expected_sha256(file.sha256.clone());
        }

        let progress_ctx = ctx.clone();
        let on_progress = move |p: TransferProgress| {
            progress_ctx.report(
                p.percent()
                    .map(TaskProgress::percent)
                    .unwrap_or(TaskProgress::Indeterminate),
            )
        };
        // Not raced: the transfer checks the token itself and removes its
        // partial file on the way out.
        let outcome = self
            .retry(ctx, || {
                self.downloads
                    .download_request(&request, &on_progress, &ctx.cancel)
            })
            .await?;

        let identity = match outcome.hash {
            Some(full) => self.identity.adopt(&outcome.path, full).await?,
            None => {
                self.identity
                    .identify_with(&outcome.path, &ctx.cancel, |_| {})
                    .await?
            }
        };
        self.cache
            .upsert(&identity.full_hash, CacheEntryUpdate::new().verified_now())
            .await?;
        self.attach_metadata(&identity.full_hash, &metadata, ctx).await?;

        info!(
            "Downloaded {} to {}{}",
            url,
            outcome.path.display(),
            if outcome.skipped { " (existing file kept)" } else { "" }
        );
        Ok(TaskOutput::Downloaded {
            path: outcome.path,
            hash: identity.full_hash,
            skipped: outcome.skipped,
        })
    }

    /// Store registry metadata on the entry, seed empty notes with its
    /// summary and fetch a thumbnail if the entry has none.
    async fn attach_metadata(
        &self,
        hash: &str,
        metadata: &RemoteMetadata,
        ctx: &TaskContext,
    ) -> Result<CacheEntry> {
        let existing = self.cache.get(hash).await?;
        let mut update = CacheEntryUpdate::new().remote_metadata(metadata.clone());
        if existing.as_ref().map_or(true, |e| e.notes.text.trim().is_empty()) {
            update = update.notes_text(metadata.summary_markdown());
        }
        let entry = self.cache.upsert(hash, update).await?;

        if entry.thumbnail.is_none() {
            if let Err(e) = self.fetch_thumbnail(hash, metadata, &ctx.cancel).await {
                if matches!(e, AtelierError::Cancelled) {
                    return Err(e);
                }
                warn!("Could not fetch thumbnail for {}: {}", short(hash), e);
            }
        }
        Ok(entry)
    }

    async fn fetch_thumbnail(
        &self,
        hash: &str,
        metadata: &RemoteMetadata,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let Some(url) = metadata.preview_urls.first() else {
            return Ok(());
        };
        let temp = tempfile::NamedTempFile::new()?;
        self.client.download(url, temp.path(), &|_| {}, cancel).await?;
        let bytes = tokio::fs::read(temp.path())
            .await
            .map_err(|e| AtelierError::io_with_path(e, temp.path()))?;
        let ext = image::guess_format(&bytes)
            .ok()
            .and_then(|format| format.extensions_str().first().copied())
            .unwrap_or("jpg");
        self.cache.set_thumbnail_bytes(hash, bytes, ext).await?;
        debug!("Stored thumbnail for {}", short(hash));
        Ok(())
    }

    /// Run a registry call with retry on transient errors, racing each
    /// attempt against cancellation.
    async fn with_retry<T, F, Fut>(&self, ctx: &TaskContext, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let cancel = &ctx.cancel;
        self.retry(ctx, || {
            let attempt = operation();
            async move {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(AtelierError::Cancelled),
                    result = attempt => result,
                }
            }
        })
        .await
    }

    async fn retry<T, F, Fut>(&self, ctx: &TaskContext, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let (result, stats) =
            retry_async(&self.retry, &ctx.cancel, operation, AtelierError::is_retryable).await;
        if stats.retries() > 0 {
            debug!("Task {} made {} retries", ctx.id, stats.retries());
        }
        result
    }
}

fn short(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}

/// Make `path` absolute so equal files dedup regardless of how they were named.
pub(crate) fn normalize_path(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
