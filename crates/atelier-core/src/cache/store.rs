//! File-per-hash cache store.
//!
//! ```text
//! <root>/entries/<aa>/<sha256>/
//!     entry.json
//!     notes.md
//!     thumbnail.<ext>
//!     examples/
//!     attachments/
//! ```
//!
//! Writes are serialized per hash and land atomically; reads take no lock.
//! A corrupt `entry.json` reads as an empty entry and is moved aside to
//! `entry.json.corrupt` by the next write.

use super::entry::{CacheEntry, CacheEntryUpdate};
use crate::config::PathsConfig;
use crate::error::{AtelierError, Result};
use crate::persist::{atomic_copy, atomic_read_json, atomic_write_bytes, atomic_write_json, KeyedLocks};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Persistence of [`CacheEntry`] records.
///
/// Every write merges into the stored record; fields not named by the
/// update keep their stored value.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Load the entry for `hash`. A corrupt record reads as an empty entry.
    async fn get(&self, hash: &str) -> Result<Option<CacheEntry>>;

    /// Merge `update` into the entry for `hash`, creating it if absent.
    async fn upsert(&self, hash: &str, update: CacheEntryUpdate) -> Result<CacheEntry>;

    /// Copy `media` into the entry's examples.
    async fn attach_example(&self, hash: &str, media: &Path) -> Result<CacheEntry>;

    /// Replace the notes text.
    async fn set_notes(&self, hash: &str, text: &str) -> Result<CacheEntry>;

    /// Store `bytes` as the thumbnail, with extension `ext`.
    async fn set_thumbnail_bytes(&self, hash: &str, bytes: Vec<u8>, ext: &str)
        -> Result<CacheEntry>;
}

/// [`CacheStore`] keeping one folder per hash under a root directory.
pub struct FileCacheStore {
    root: PathBuf,
    locks: KeyedLocks<String>,
}

impl FileCacheStore {
    /// Open (or create) a store under `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let entries = root.join(PathsConfig::ENTRIES_DIR_NAME);
        std::fs::create_dir_all(&entries).map_err(|e| AtelierError::io_with_path(e, &entries))?;
        debug!("Opened cache store at {}", root.display());
        Ok(Self {
            root,
            locks: KeyedLocks::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Folder holding everything stored for `hash`.
    pub fn entry_dir(&self, hash: &str) -> Result<PathBuf> {
        let hash = normalize_hash(hash)?;
        Ok(entry_dir(&self.root, &hash))
    }

    /// Copy `source` in as the thumbnail, keeping its extension.
    pub async fn set_thumbnail(&self, hash: &str, source: &Path) -> Result<CacheEntry> {
        let ext = source
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_else(|| "png".to_string());
        let source = source.to_path_buf();
        self.write_file_then_update(hash, move |dir| {
            let name = thumbnail_name(&ext);
            clear_other_thumbnails(dir, &name);
            atomic_copy(&source, &dir.join(&name))?;
            Ok(CacheEntryUpdate::new().thumbnail(name))
        })
        .await
    }

    /// Remove an example reference and its file.
    pub async fn remove_example(&self, hash: &str, reference: &str) -> Result<CacheEntry> {
        let hash = normalize_hash(hash)?;
        let _guard = self.locks.lock(&hash).await;
        let dir = entry_dir(&self.root, &hash);
        let reference = reference.to_string();
        blocking(move || {
            let files = EntryFiles::new(dir, hash);
            let mut entry = files.load_for_write()?;
            entry.examples.retain(|r| r != &reference);
            if is_inside(&reference, PathsConfig::EXAMPLES_DIR_NAME) {
                let path = files.dir.join(&reference);
                if let Err(e) = std::fs::remove_file(&path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        return Err(AtelierError::io_with_path(e, path));
                    }
                }
            }
            files.save(&entry, false)?;
            Ok(entry)
        })
        .await
    }

    /// Copy `file` into the entry's note attachments.
    pub async fn attach_note_file(&self, hash: &str, file: &Path) -> Result<CacheEntry> {
        let file = file.to_path_buf();
        self.write_file_then_update(hash, move |dir| {
            let reference = copy_into(dir, PathsConfig::ATTACHMENTS_DIR_NAME, &file)?;
            Ok(CacheEntryUpdate::new().attachment(reference))
        })
        .await
    }

    /// Hashes of every stored entry, sorted.
    pub async fn list_hashes(&self) -> Result<Vec<String>> {
        let entries = self.root.join(PathsConfig::ENTRIES_DIR_NAME);
        blocking(move || {
            let mut hashes = Vec::new();
            let shards = match std::fs::read_dir(&entries) {
                Ok(shards) => shards,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(hashes),
                Err(e) => return Err(AtelierError::io_with_path(e, entries)),
            };
            for shard in shards.flatten() {
                let Ok(children) = std::fs::read_dir(shard.path()) else {
                    continue;
                };
                for child in children.flatten() {
                    if child.path().join(PathsConfig::ENTRY_FILE_NAME).is_file() {
                        hashes.push(child.file_name().to_string_lossy().into_owned());
                    }
                }
            }
            hashes.sort();
            Ok(hashes)
        })
        .await
    }

    /// Run `write` inside the entry folder under the hash lock, then merge
    /// the update it returns.
    async fn write_file_then_update<F>(&self, hash: &str, write: F) -> Result<CacheEntry>
    where
        F: FnOnce(&Path) -> Result<CacheEntryUpdate> + Send + 'static,
    {
        let hash = normalize_hash(hash)?;
        let _guard = self.locks.lock(&hash).await;
        let dir = entry_dir(&self.root, &hash);
        blocking(move || {
            std::fs::create_dir_all(&dir).map_err(|e| AtelierError::io_with_path(e, &dir))?;
            let update = write(&dir)?;
            EntryFiles::new(dir, hash).merge(update)
        })
        .await
    }
}

#[async_trait]
impl CacheStore for FileCacheStore {
    async fn get(&self, hash: &str) -> Result<Option<CacheEntry>> {
        let hash = normalize_hash(hash)?;
        let dir = entry_dir(&self.root, &hash);
        blocking(move || EntryFiles::new(dir, hash).load_soft()).await
    }

    async fn upsert(&self, hash: &str, update: CacheEntryUpdate) -> Result<CacheEntry> {
        let hash = normalize_hash(hash)?;
        let _guard = self.locks.lock(&hash).await;
        let dir = entry_dir(&self.root, &hash);
        blocking(move || EntryFiles::new(dir, hash).merge(update)).await
    }

    async fn attach_example(&self, hash: &str, media: &Path) -> Result<CacheEntry> {
        let media = media.to_path_buf();
        let entry = self
            .write_file_then_update(hash, move |dir| {
                let reference = copy_into(dir, PathsConfig::EXAMPLES_DIR_NAME, &media)?;
                Ok(CacheEntryUpdate::new().example(reference))
            })
            .await?;
        info!("Attached example to {}", entry.hash);
        Ok(entry)
    }

    async fn set_notes(&self, hash: &str, text: &str) -> Result<CacheEntry> {
        self.upsert(hash, CacheEntryUpdate::new().notes_text(text))
            .await
    }

    async fn set_thumbnail_bytes(
        &self,
        hash: &str,
        bytes: Vec<u8>,
        ext: &str,
    ) -> Result<CacheEntry> {
        let ext = ext.trim_start_matches('.').to_ascii_lowercase();
        self.write_file_then_update(hash, move |dir| {
            let name = thumbnail_name(&ext);
            clear_other_thumbnails(dir, &name);
            atomic_write_bytes(&dir.join(&name), &bytes)?;
            Ok(CacheEntryUpdate::new().thumbnail(name))
        })
        .await
    }
}

/// The files of one entry folder.
struct EntryFiles {
    dir: PathBuf,
    hash: String,
}

impl EntryFiles {
    fn new(dir: PathBuf, hash: String) -> Self {
        Self { dir, hash }
    }

    fn entry_path(&self) -> PathBuf {
        self.dir.join(PathsConfig::ENTRY_FILE_NAME)
    }

    fn notes_path(&self) -> PathBuf {
        self.dir.join(PathsConfig::NOTES_FILE_NAME)
    }

    fn read_entry(&self) -> Result<Option<CacheEntry>> {
        let Some(mut entry) = atomic_read_json::<CacheEntry>(&self.entry_path())? else {
            return Ok(None);
        };
        if entry.hash != self.hash {
            return Err(AtelierError::CorruptCacheEntry {
                hash: self.hash.clone(),
                message: format!("record is keyed '{}'", entry.hash),
            });
        }
        entry.notes.text = self.read_notes()?;
        Ok(Some(entry))
    }

    fn read_notes(&self) -> Result<String> {
        match std::fs::read_to_string(self.notes_path()) {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(AtelierError::io_with_path(e, self.notes_path())),
        }
    }

    /// Read for callers: corruption degrades to an empty entry.
    fn load_soft(&self) -> Result<Option<CacheEntry>> {
        match self.read_entry() {
            Ok(entry) => Ok(entry),
            Err(e @ (AtelierError::Json { .. } | AtelierError::CorruptCacheEntry { .. })) => {
                warn!("Cache entry {} is corrupt, treating as empty: {}", self.hash, e);
                Ok(Some(CacheEntry::empty(&self.hash)))
            }
            Err(e) => Err(e),
        }
    }

    /// Read for a write: corruption is moved aside, then an empty entry
    /// stands in.
    fn load_for_write(&self) -> Result<CacheEntry> {
        match self.read_entry() {
            Ok(Some(entry)) => Ok(entry),
            Ok(None) => Ok(CacheEntry::empty(&self.hash)),
            Err(e @ (AtelierError::Json { .. } | AtelierError::CorruptCacheEntry { .. })) => {
                let aside = self
                    .dir
                    .join(format!("{}.corrupt", PathsConfig::ENTRY_FILE_NAME));
                warn!(
                    "Cache entry {} is corrupt ({}), moving it to {}",
                    self.hash,
                    e,
                    aside.display()
                );
                std::fs::rename(self.entry_path(), &aside)
                    .map_err(|e| AtelierError::io_with_path(e, &aside))?;
                let mut entry = CacheEntry::empty(&self.hash);
                entry.notes.text = self.read_notes()?;
                Ok(entry)
            }
            Err(e) => Err(e),
        }
    }

    fn merge(&self, update: CacheEntryUpdate) -> Result<CacheEntry> {
        let notes_changed = update.notes_text.is_some();
        let mut entry = self.load_for_write()?;
        entry.apply(update);
        self.save(&entry, notes_changed)?;
        Ok(entry)
    }

    fn save(&self, entry: &CacheEntry, notes_changed: bool) -> Result<()> {
        atomic_write_json(&self.entry_path(), entry)?;
        if notes_changed {
            atomic_write_bytes(&self.notes_path(), entry.notes.text.as_bytes())?;
        }
        debug!("Saved cache entry {}", self.hash);
        Ok(())
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AtelierError::Other(format!("Cache task failed: {}", e)))?
}

/// Lowercase `hash` and reject anything that is not hex, so it can never
/// escape the cache root.
fn normalize_hash(hash: &str) -> Result<String> {
    let hash = hash.trim().to_ascii_lowercase();
    if hash.len() < 2 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(AtelierError::Validation {
            field: "hash".into(),
            message: format!("'{}' is not a hex digest", hash),
        });
    }
    Ok(hash)
}

fn entry_dir(root: &Path, hash: &str) -> PathBuf {
    root.join(PathsConfig::ENTRIES_DIR_NAME)
        .join(&hash[..2])
        .join(hash)
}

fn thumbnail_name(ext: &str) -> String {
    let ext = if ext.is_empty() { "png" } else { ext };
    format!("{}.{}", PathsConfig::THUMBNAIL_STEM, ext)
}

/// Remove `thumbnail.*` files other than `keep`.
fn clear_other_thumbnails(dir: &Path, keep: &str) {
    let Ok(children) = std::fs::read_dir(dir) else {
        return;
    };
    for child in children.flatten() {
        let name = child.file_name().to_string_lossy().into_owned();
        let is_thumbnail = Path::new(&name).file_stem().and_then(|s| s.to_str())
            == Some(PathsConfig::THUMBNAIL_STEM);
        if is_thumbnail && name != keep {
            if let Err(e) = std::fs::remove_file(child.path()) {
                warn!("Failed to remove old thumbnail {}: {}", name, e);
            }
        }
    }
}

/// Copy `source` into `<dir>/<sub>/`, choosing a free name. Returns the
/// reference relative to `dir`.
fn copy_into(dir: &Path, sub: &str, source: &Path) -> Result<String> {
    let file_name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| AtelierError::Validation {
            field: "path".into(),
            message: format!("{} has no file name", source.display()),
        })?;
    let target_dir = dir.join(sub);
    std::fs::create_dir_all(&target_dir).map_err(|e| AtelierError::io_with_path(e, &target_dir))?;

    let mut name = file_name.clone();
    let mut n = 1u32;
    while target_dir.join(&name).exists() {
        let path = Path::new(&file_name);
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        name = match path.extension() {
            Some(ext) => format!("{}_{}.{}", stem, n, ext.to_string_lossy()),
            None => format!("{}_{}", stem, n),
        };
        n += 1;
    }

    atomic_copy(source, &target_dir.join(&name))?;
    Ok(format!("{}/{}", sub, name))
}

fn is_inside(reference: &str, sub: &str) -> bool {
    reference
        .strip_prefix(sub)
        .and_then(|rest| rest.strip_prefix('/'))
        .map(|rest| !rest.is_empty() && !rest.contains("..") && !rest.contains('/'))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Provider, RemoteMetadata};
    use tempfile::TempDir;

    const HASH: &str = "ab12cd34ef56";

    fn store() -> (TempDir, FileCacheStore) {
        let temp = TempDir::new().unwrap();
        let store = FileCacheStore::open(temp.path().join("cache")).unwrap();
        (temp, store)
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let (_temp, store) = store();
        assert!(store.get(HASH).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_layout_is_sharded_by_prefix() {
        let (_temp, store) = store();
        store.upsert(HASH, CacheEntryUpdate::new().verified_now()).await.unwrap();
        let dir = store.entry_dir(HASH).unwrap();
        assert!(dir.ends_with(format!("entries/ab/{}", HASH)));
        assert!(dir.join("entry.json").is_file());
    }

    #[tokio::test]
    async fn test_upsert_merges_fields() {
        let (_temp, store) = store();
        store.set_notes(HASH, "keep me").await.unwrap();
        store
            .upsert(
                HASH,
                CacheEntryUpdate::new().remote_metadata(RemoteMetadata::new(Provider::Civitai)),
            )
            .await
            .unwrap();

        let entry = store.get(HASH).await.unwrap().unwrap();
        assert_eq!(entry.notes.text, "keep me");
        assert_eq!(
            entry.remote_metadata.map(|m| m.provider),
            Some(Provider::Civitai)
        );
    }

    #[tokio::test]
    async fn test_hash_is_case_insensitive() {
        let (_temp, store) = store();
        store.set_notes("AB12CD34EF56", "x").await.unwrap();
        assert!(store.get(HASH).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_corrupt_entry_reads_empty_and_is_moved_aside() {
        let (_temp, store) = store();
        store.set_notes(HASH, "notes survive").await.unwrap();
        let dir = store.entry_dir(HASH).unwrap();
        std::fs::write(dir.join("entry.json"), b"{ not json").unwrap();

        let entry = store.get(HASH).await.unwrap().unwrap();
        assert!(entry.remote_metadata.is_none());
        assert!(entry.examples.is_empty());

        let entry = store
            .upsert(HASH, CacheEntryUpdate::new().verified_now())
            .await
            .unwrap();
        assert!(dir.join("entry.json.corrupt").is_file());
        assert_eq!(entry.notes.text, "notes survive");
        assert!(store.get(HASH).await.unwrap().unwrap().last_verified.is_some());
    }

    #[tokio::test]
    async fn test_corruption_is_isolated_per_entry() {
        let (_temp, store) = store();
        let other = "ff00ff00";
        store.set_notes(HASH, "a").await.unwrap();
        store.set_notes(other, "b").await.unwrap();
        std::fs::write(store.entry_dir(HASH).unwrap().join("entry.json"), b"[]").unwrap();

        assert_eq!(store.get(other).await.unwrap().unwrap().notes.text, "b");
    }

    #[tokio::test]
    async fn test_attach_example_copies_and_dedups_names() {
        let (temp, store) = store();
        let media = temp.path().join("sample.png");
        std::fs::write(&media, b"png").unwrap();

        store.attach_example(HASH, &media).await.unwrap();
        let entry = store.attach_example(HASH, &media).await.unwrap();

        assert_eq!(entry.examples, vec!["examples/sample.png", "examples/sample_1.png"]);
        let dir = store.entry_dir(HASH).unwrap();
        assert!(dir.join("examples/sample_1.png").is_file());
        assert!(media.exists());
    }

    #[tokio::test]
    async fn test_remove_example_deletes_file() {
        let (temp, store) = store();
        let media = temp.path().join("sample.png");
        std::fs::write(&media, b"png").unwrap();
        store.attach_example(HASH, &media).await.unwrap();

        let entry = store
            .remove_example(HASH, "examples/sample.png")
            .await
            .unwrap();
        assert!(entry.examples.is_empty());
        assert!(!store
            .entry_dir(HASH)
            .unwrap()
            .join("examples/sample.png")
            .exists());
    }

    #[tokio::test]
    async fn test_thumbnail_replaces_previous() {
        let (temp, store) = store();
        store
            .set_thumbnail_bytes(HASH, b"jpeg".to_vec(), "JPEG")
            .await
            .unwrap();
        let png = temp.path().join("preview.png");
        std::fs::write(&png, b"png").unwrap();
        let entry = store.set_thumbnail(HASH, &png).await.unwrap();

        let dir = store.entry_dir(HASH).unwrap();
        assert_eq!(entry.thumbnail.as_deref(), Some("thumbnail.png"));
        assert!(dir.join("thumbnail.png").is_file());
        assert!(!dir.join("thumbnail.jpeg").exists());
    }

    #[tokio::test]
    async fn test_attach_note_file() {
        let (temp, store) = store();
        let file = temp.path().join("recipe.txt");
        std::fs::write(&file, b"steps").unwrap();
        let entry = store.attach_note_file(HASH, &file).await.unwrap();
        assert_eq!(entry.notes.attachments, vec!["attachments/recipe.txt"]);
    }

    #[tokio::test]
    async fn test_list_hashes() {
        let (_temp, store) = store();
        store.set_notes("ff01", "x").await.unwrap();
        store.set_notes(HASH, "y").await.unwrap();
        assert_eq!(store.list_hashes().await.unwrap(), vec![HASH.to_string(), "ff01".to_string()]);
    }

    #[tokio::test]
    async fn test_rejects_non_hex_keys() {
        let (_temp, store) = store();
        assert!(store.get("../etc").await.is_err());
        assert!(store.entry_dir("a").is_err());
    }

    #[tokio::test]
    async fn test_concurrent_upserts_keep_every_field() {
        let (_temp, store) = store();
        let store = std::sync::Arc::new(store);
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .upsert(
                        HASH,
                        CacheEntryUpdate::new().example(format!("examples/{}.png", i)),
                    )
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.get(HASH).await.unwrap().unwrap().examples.len(), 8);
    }

    #[test]
    fn test_is_inside() {
        assert!(is_inside("examples/a.png", "examples"));
        assert!(!is_inside("examples/../entry.json", "examples"));
        assert!(!is_inside("attachments/a.txt", "examples"));
    }
}
