//! Download manager.
//!
//! Streams a remote file into `<dest_dir>/<name>.part`, verifies it against
//! the size and SHA256 the registry published, and only then renames it into
//! place. The destination therefore never holds a partially written file.

use crate::cancel::CancellationToken;
use crate::config::NetworkConfig;
use crate::error::{AtelierError, Result};
use crate::identity::{compute_full_hash, FullHash};
use crate::persist::KeyedLocks;
use crate::registry::{ProgressFn, RemoteMetadataClient};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Characters that are not allowed in file names on at least one platform.
const FORBIDDEN_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// What to do when the target file name already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    /// Keep both: the new file becomes `<stem>_<n><.ext>`.
    #[default]
    Rename,
    /// Replace the existing file.
    Overwrite,
    /// Keep the existing file and transfer nothing.
    Skip,
}

/// A single download job.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub dest_dir: PathBuf,
    /// File name to save as; derived from the URL when absent.
    pub file_name: Option<String>,
    pub expected_size: Option<u64>,
    pub expected_sha256: Option<String>,
    pub policy: CollisionPolicy,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>, dest_dir: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            dest_dir: dest_dir.into(),
            file_name: None,
            expected_size: None,
            expected_sha256: None,
            policy: CollisionPolicy::default(),
        }
    }

    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = Some(name.into());
        self
    }

    pub fn with_expected_size(mut self, size: Option<u64>) -> Self {
        self.expected_size = size;
        self
    }

    pub fn with_expected_sha256(mut self, sha256: Option<String>) -> Self {
        self.expected_sha256 = sha256.map(|s| s.to_lowercase());
        self
    }

    pub fn with_policy(mut self, policy: CollisionPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn target_name(&self) -> String {
        let raw = match &self.file_name {
            Some(name) => name.clone(),
            None => file_name_from_url(&self.url),
        };
        let name = sanitize_file_name(&raw);
        if name.is_empty() {
            "download".to_string()
        } else {
            name
        }
    }
}

/// Result of a download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub path: PathBuf,
    pub bytes_written: u64,
    /// Digests of the transferred bytes; `None` when the transfer was skipped.
    pub hash: Option<FullHash>,
    pub skipped: bool,
}

/// Downloads files through a [`RemoteMetadataClient`].
pub struct DownloadManager {
    client: Arc<dyn RemoteMetadataClient>,
    /// Serializes transfers into the same target name.
    targets: KeyedLocks<PathBuf>,
    /// Serializes collision resolution and the final rename per directory.
    directories: KeyedLocks<PathBuf>,
}

impl DownloadManager {
    pub fn new(client: Arc<dyn RemoteMetadataClient>) -> Self {
        Self {
            client,
            targets: KeyedLocks::new(),
            directories: KeyedLocks::new(),
        }
    }

    /// Download `url` into `dest_dir` under the name the URL suggests.
    pub async fn download(
        &self,
        url: &str,
        dest_dir: &Path,
        policy: CollisionPolicy,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome> {
        let request = DownloadRequest::new(url, dest_dir).with_policy(policy);
        self.download_request(&request, &|_| {}, cancel).await
    }

    /// Run a download job.
    pub async fn download_request(
        &self,
        request: &DownloadRequest,
        on_progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome> {
        cancel.check()?;
        tokio::fs::create_dir_all(&request.dest_dir)
            .await
            .map_err(|e| AtelierError::io_with_path(e, &request.dest_dir))?;

        let name = request.target_name();
        let target = request.dest_dir.join(&name);

        if request.policy == CollisionPolicy::Skip && target.exists() {
            info!("Skipping download, {} already exists", target.display());
            return Ok(skipped(target));
        }

        let _target_guard = self.targets.lock(&target).await;
        let temp_path = request
            .dest_dir
            .join(format!("{}{}", name, NetworkConfig::DOWNLOAD_TEMP_SUFFIX));

        if temp_path.exists() {
            warn!(
                "Discarding stale partial download {}",
                temp_path.display()
            );
            remove_quietly(&temp_path).await;
        }

        match self
            .transfer_and_place(request, &target, &temp_path, on_progress, cancel)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                remove_quietly(&temp_path).await;
                Err(e)
            }
        }
    }

    async fn transfer_and_place(
        &self,
        request: &DownloadRequest,
        target: &Path,
        temp_path: &Path,
        on_progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome> {
        let transferred = self
            .client
            .download(&request.url, temp_path, on_progress, cancel)
            .await?;
        cancel.check()?;

        let actual_size = tokio::fs::metadata(temp_path)
            .await
            .map_err(|e| AtelierError::io_with_path(e, temp_path))?
            .len();
        if let Some(expected) = request.expected_size {
            if expected != actual_size {
                return Err(AtelierError::SizeMismatch {
                    expected,
                    actual: actual_size,
                });
            }
        }

        let hash = hash_file(temp_path, cancel).await?;
        if let Some(expected) = &request.expected_sha256 {
            if !hash.sha256.eq_ignore_ascii_case(expected) {
                return Err(AtelierError::HashMismatch {
                    expected: expected.clone(),
                    actual: hash.sha256,
                });
            }
            debug!("Verified SHA256 of {}", temp_path.display());
        }

        let _dir_guard = self.directories.lock(&request.dest_dir).await;
        let final_path = match resolve_collision(target, request.policy) {
            Some(path) => path,
            None => {
                // Another writer created the target while we were transferring.
                remove_quietly(temp_path).await;
                return Ok(skipped(target.to_path_buf()));
            }
        };

        tokio::fs::rename(temp_path, &final_path)
            .await
            .map_err(|e| AtelierError::io_with_path(e, &final_path))?;

        info!(
            "Downloaded {} bytes to {}",
            transferred.bytes_written,
            final_path.display()
        );
        Ok(DownloadOutcome {
            path: final_path,
            bytes_written: actual_size,
            hash: Some(hash),
            skipped: false,
        })
    }
}

fn skipped(path: PathBuf) -> DownloadOutcome {
    DownloadOutcome {
        path,
        bytes_written: 0,
        hash: None,
        skipped: true,
    }
}

async fn hash_file(path: &Path, cancel: &CancellationToken) -> Result<FullHash> {
    let owned = path.to_path_buf();
    let cancel = cancel.clone();
    tokio::task::spawn_blocking(move || compute_full_hash(&owned, &cancel, |_| {}))
        .await
        .map_err(|e| AtelierError::Other(format!("Hash computation task failed: {}", e)))?
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

/// The path the finished file should be moved to, or `None` when `Skip`
/// applies to an existing target.
fn resolve_collision(target: &Path, policy: CollisionPolicy) -> Option<PathBuf> {
    if !target.exists() {
        return Some(target.to_path_buf());
    }
    match policy {
        CollisionPolicy::Overwrite => Some(target.to_path_buf()),
        CollisionPolicy::Skip => None,
        CollisionPolicy::Rename => Some(next_free_name(target)),
    }
}

/// `<stem>_<n><.ext>` with the smallest free `n >= 1`.
fn next_free_name(target: &Path) -> PathBuf {
    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    let stem = target
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = target
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let mut n = 1u32;
    loop {
        let candidate = parent.join(format!("{}_{}{}", stem, n, ext));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

/// Strip characters that are invalid in file names and trim whitespace and
/// trailing dots.
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !FORBIDDEN_CHARS.contains(c) && !c.is_control())
        .collect();
    cleaned.trim().trim_end_matches('.').to_string()
}

/// Last path segment of `url`, percent-decoded.
fn file_name_from_url(url: &str) -> String {
    let segment = url::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|segments| segments.last().map(str::to_string))
        })
        .unwrap_or_default();
    urlencoding::decode(&segment)
        .map(|s| s.into_owned())
        .unwrap_or(segment)
}
