//! Remote model registries.
//!
//! The orchestrator talks to registries only through [`RemoteMetadataClient`].
//! [`HttpRegistryClient`] is the production implementation (Civitai and
//! HuggingFace over HTTPS); tests and embedders can supply their own.

mod civitai;
mod http;
mod huggingface;
mod types;
mod urls;

pub use http::HttpRegistryClient;
pub use types::{
    FileResult, MetadataResult, Provider, RemoteFile, RemoteMetadata, TransferProgress,
};
pub use urls::RegistryUrl;

use crate::cancel::CancellationToken;
use crate::error::Result;
use async_trait::async_trait;
use std::path::Path;

/// Progress callback for byte transfers.
pub type ProgressFn<'a> = &'a (dyn Fn(TransferProgress) + Send + Sync);

/// Contract the core requires from a registry.
///
/// "No match" is reported as [`AtelierError::NotFound`](crate::AtelierError::NotFound)
/// and must only be returned when the registry answered authoritatively;
/// transport trouble is a retryable network error instead.
#[async_trait]
pub trait RemoteMetadataClient: Send + Sync {
    /// Look up a model version by the SHA256 of one of its files.
    async fn lookup_by_hash(&self, sha256: &str) -> Result<MetadataResult>;

    /// Look up a model version from a registry page, API or file URL.
    ///
    /// Malformed URLs and URLs naming several files fail with `UnsupportedUrl`.
    async fn lookup_by_url(&self, url: &str) -> Result<MetadataResult>;

    /// Stream `url` into `dest`, reporting progress and honoring `cancel`
    /// between chunks. `dest` is written directly; callers own temp-file and
    /// atomic-rename discipline.
    async fn download(
        &self,
        url: &str,
        dest: &Path,
        on_progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<FileResult>;
}
