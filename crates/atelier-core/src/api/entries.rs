//! Cache entry access on AtelierApi.
//!
//! Entries are addressed by file path; the file is identified first (from
//! the memo when unchanged) and its full hash used as the key.

use crate::cache::{CacheEntry, CacheStore};
use crate::error::Result;
use crate::identity::ContentIdentity;
use crate::AtelierApi;
use std::path::Path;
use tracing::debug;

impl AtelierApi {
    /// Resolve the content identity of `path`.
    pub async fn identify(&self, path: impl AsRef<Path>) -> Result<ContentIdentity> {
        self.inner
            .orchestrator
            .executor()
            .identity()
            .identify(path.as_ref())
            .await
    }

    /// Cache entry for the file at `path`, if one exists.
    pub async fn cache_entry(&self, path: impl AsRef<Path>) -> Result<Option<CacheEntry>> {
        let identity = self.identify(path).await?;
        self.inner.cache.get(&identity.full_hash).await
    }

    /// Replace the notes of the file at `path`.
    pub async fn set_notes(&self, path: impl AsRef<Path>, text: &str) -> Result<CacheEntry> {
        let identity = self.identify(path).await?;
        debug!("Updating notes for {}", identity.full_hash);
        self.inner.cache.set_notes(&identity.full_hash, text).await
    }

    /// Copy `media` into the examples of the file at `path`.
    pub async fn attach_example(
        &self,
        path: impl AsRef<Path>,
        media: impl AsRef<Path>,
    ) -> Result<CacheEntry> {
        let identity = self.identify(path).await?;
        self.inner
            .cache
            .attach_example(&identity.full_hash, media.as_ref())
            .await
    }

    /// Remove an example, given its reference from the entry.
    pub async fn remove_example(&self, path: impl AsRef<Path>, reference: &str) -> Result<CacheEntry> {
        let identity = self.identify(path).await?;
        self.inner
            .cache
            .remove_example(&identity.full_hash, reference)
            .await
    }

    /// Copy `file` into the note attachments of the file at `path`.
    pub async fn attach_note_file(
        &self,
        path: impl AsRef<Path>,
        file: impl AsRef<Path>,
    ) -> Result<CacheEntry> {
        let identity = self.identify(path).await?;
        self.inner
            .cache
            .attach_note_file(&identity.full_hash, file.as_ref())
            .await
    }

    /// Use `image` as the thumbnail of the file at `path`.
    pub async fn set_thumbnail(
        &self,
        path: impl AsRef<Path>,
        image: impl AsRef<Path>,
    ) -> Result<CacheEntry> {
        let identity = self.identify(path).await?;
        self.inner
            .cache
            .set_thumbnail(&identity.full_hash, image.as_ref())
            .await
    }
}
