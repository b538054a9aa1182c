//! Content identity for asset files.
//!
//! Two tiers:
//! - the *fast hash* covers a bounded prefix/suffix window plus the file size
//!   and is cheap enough to compute during a scan;
//! - the *full hash* is the SHA256 of the whole file, the canonical identity
//!   used as the cache key and for registry lookups.
//!
//! Results are memoized per `(path, size, mtime)` in memory and, when an
//! index path is configured, on disk.

mod hashing;
mod index;

pub use hashing::{compute_fast_hash, compute_full_hash, verify_sha256, FullHash, HashProgress};
pub use index::{FileStamp, IdentityIndex};

use crate::cancel::CancellationToken;
use crate::config::HashConfig;
use crate::error::{AtelierError, Result};
use mini_moka::sync::Cache;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Stable, path-independent identity of a file's contents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentIdentity {
    pub fast_hash: String,
    /// SHA256, lowercase hex
    pub full_hash: String,
    /// BLAKE3, lowercase hex (computed in the same pass as `full_hash`)
    pub blake3: String,
    pub file_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MemoKey {
    path: PathBuf,
    stamp: FileStamp,
}

/// Memoizing identity resolver.
#[derive(Clone)]
pub struct HashIdentity {
    identities: Cache<MemoKey, ContentIdentity>,
    fast_hashes: Cache<MemoKey, String>,
    index: Option<Arc<IdentityIndex>>,
}

impl Default for HashIdentity {
    fn default() -> Self {
        Self::new()
    }
}

impl HashIdentity {
    /// Create a resolver with an in-memory memo only.
    pub fn new() -> Self {
        Self {
            identities: Self::memo(),
            fast_hashes: Self::memo(),
            index: None,
        }
    }

    /// Create a resolver backed by a persistent index at `index_path`.
    pub fn with_index(index_path: impl Into<PathBuf>) -> Self {
        Self {
            index: Some(Arc::new(IdentityIndex::open(index_path))),
            ..Self::new()
        }
    }

    fn memo<V: Clone + Send + Sync + 'static>() -> Cache<MemoKey, V> {
        Cache::builder()
            .max_capacity(HashConfig::MEMO_CAPACITY)
            .time_to_idle(HashConfig::MEMO_TTL)
            .build()
    }

    /// Compute (or recall) the fast hash of `path`.
    pub async fn fast_identity(&self, path: &Path) -> Result<String> {
        let key = memo_key(path)?;
        if let Some(identity) = self.lookup(&key) {
            return Ok(identity.fast_hash);
        }
        if let Some(hash) = self.fast_hashes.get(&key) {
            return Ok(hash);
        }

        let owned = path.to_path_buf();
        let hash = tokio::task::spawn_blocking(move || compute_fast_hash(&owned))
            .await
            .map_err(|e| AtelierError::Other(format!("Fast hash task failed: {}", e)))??;
        self.fast_hashes.insert(key, hash.clone());
        Ok(hash)
    }

    /// Resolve the full identity of `path`.
    pub async fn identify(&self, path: &Path) -> Result<ContentIdentity> {
        self.identify_with(path, &CancellationToken::new(), |_| {})
            .await
    }

    /// Resolve the full identity with cancellation and progress reporting.
    ///
    /// Unchanged files (same size and mtime) are answered from the memo
    /// without touching their contents.
    pub async fn identify_with<F>(
        &self,
        path: &Path,
        cancel: &CancellationToken,
        on_progress: F,
    ) -> Result<ContentIdentity>
    where
        F: FnMut(HashProgress) + Send + 'static,
    {
        let key = memo_key(path)?;
        if let Some(identity) = self.lookup(&key) {
            debug!("Identity memo hit for {}", path.display());
            return Ok(identity);
        }

        let owned = path.to_path_buf();
        let file_size = key.stamp.size;
        let cancel = cancel.clone();
        let identity = tokio::task::spawn_blocking(move || -> Result<ContentIdentity> {
            let fast_hash = compute_fast_hash(&owned)?;
            let full = compute_full_hash(&owned, &cancel, on_progress)?;
            Ok(ContentIdentity {
                fast_hash,
                full_hash: full.sha256,
                blake3: full.blake3,
                file_size,
            })
        })
        .await
        .map_err(|e| AtelierError::Other(format!("Hash computation task failed: {}", e)))??;

        self.remember(key, identity.clone()).await;
        Ok(identity)
    }

    /// Record the identity of `path` from a full hash computed elsewhere,
    /// e.g. while a download streamed into its temp file. Only the fast hash
    /// is recomputed.
    pub async fn adopt(&self, path: &Path, full: FullHash) -> Result<ContentIdentity> {
        let key = memo_key(path)?;
        let owned = path.to_path_buf();
        let fast_hash = tokio::task::spawn_blocking(move || compute_fast_hash(&owned))
            .await
            .map_err(|e| AtelierError::Other(format!("Fast hash task failed: {}", e)))??;
        let identity = ContentIdentity {
            fast_hash,
            full_hash: full.sha256,
            blake3: full.blake3,
            file_size: key.stamp.size,
        };
        self.remember(key, identity.clone()).await;
        Ok(identity)
    }

    /// Return a memoized identity without hashing anything.
    pub fn cached(&self, path: &Path) -> Option<ContentIdentity> {
        let key = memo_key(path).ok()?;
        self.lookup(&key)
    }

    /// Verify that `path` hashes to `expected_sha256`.
    pub async fn verify(
        &self,
        path: &Path,
        expected_sha256: &str,
        cancel: &CancellationToken,
    ) -> Result<ContentIdentity> {
        let identity = self.identify_with(path, cancel, |_| {}).await?;
        if identity.full_hash.eq_ignore_ascii_case(expected_sha256) {
            Ok(identity)
        } else {
            Err(AtelierError::HashMismatch {
                expected: expected_sha256.to_lowercase(),
                actual: identity.full_hash,
            })
        }
    }

    fn lookup(&self, key: &MemoKey) -> Option<ContentIdentity> {
        if let Some(identity) = self.identities.get(key) {
            return Some(identity);
        }
        let identity = self.index.as_ref()?.get(&key.path, key.stamp)?;
        self.identities.insert(key.clone(), identity.clone());
        Some(identity)
    }

    async fn remember(&self, key: MemoKey, identity: ContentIdentity) {
        self.identities.insert(key.clone(), identity.clone());
        if let Some(index) = self.index.clone() {
            let result =
                tokio::task::spawn_blocking(move || index.insert(&key.path, key.stamp, identity))
                    .await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Failed to persist identity index: {}", e),
                Err(e) => warn!("Identity index task failed: {}", e),
            }
        }
    }
}

fn memo_key(path: &Path) -> Result<MemoKey> {
    let stamp = FileStamp::of(path).map_err(|e| AtelierError::io_with_path(e, path))?;
    Ok(MemoKey {
        path: path.to_path_buf(),
        stamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_identify_deterministic_across_paths() {
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("a.safetensors");
        let b = temp.path().join("copy").join("b.safetensors");
        std::fs::create_dir_all(b.parent().unwrap()).unwrap();
        std::fs::write(&a, b"weights").unwrap();
        std::fs::write(&b, b"weights").unwrap();

        let resolver = HashIdentity::new();
        let ia = resolver.identify(&a).await.unwrap();
        let ib = resolver.identify(&b).await.unwrap();
        let ia_again = resolver.identify(&a).await.unwrap();

        assert_eq!(ia.full_hash, ib.full_hash);
        assert_eq!(ia, ia_again);
        assert_eq!(ia.file_size, 7);
        assert_eq!(ia.full_hash.len(), 64);
    }

    #[tokio::test]
    async fn test_memo_skips_rehash_of_unchanged_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("m.ckpt");
        std::fs::write(&path, vec![1u8; 4096]).unwrap();

        let resolver = HashIdentity::new();
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        resolver
            .identify_with(&path, &CancellationToken::new(), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        let counter = calls.clone();
        resolver
            .identify_with(&path, &CancellationToken::new(), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();

        // Progress only fires while actually reading the file.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(resolver.cached(&path).is_some());
    }

    #[tokio::test]
    async fn test_changed_file_is_rehashed() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("m.ckpt");
        std::fs::write(&path, b"one").unwrap();

        let resolver = HashIdentity::new();
        let first = resolver.identify(&path).await.unwrap();

        std::fs::write(&path, b"two!").unwrap();
        let second = resolver.identify(&path).await.unwrap();
        assert_ne!(first.full_hash, second.full_hash);
    }

    #[tokio::test]
    async fn test_persistent_index_survives_new_resolver() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("m.gguf");
        std::fs::write(&path, b"gguf").unwrap();
        let index_path = temp.path().join("identities.json");

        let first = HashIdentity::with_index(&index_path)
            .identify(&path)
            .await
            .unwrap();
        let fresh = HashIdentity::with_index(&index_path);
        assert_eq!(fresh.cached(&path), Some(first));
    }

    #[tokio::test]
    async fn test_fast_hash_matches_identity() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("x.bin");
        std::fs::write(&path, b"bytes").unwrap();

        let resolver = HashIdentity::new();
        let fast = resolver.fast_identity(&path).await.unwrap();
        let identity = resolver.identify(&path).await.unwrap();
        assert_eq!(fast, identity.fast_hash);
    }

    #[tokio::test]
    async fn test_verify_mismatch() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("x.bin");
        std::fs::write(&path, b"bytes").unwrap();

        let resolver = HashIdentity::new();
        let result = resolver
            .verify(&path, &"0".repeat(64), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(AtelierError::HashMismatch { .. })));
    }

    #[tokio::test]
    async fn test_adopt_records_known_hash() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("dl.safetensors");
        std::fs::write(&path, b"downloaded").unwrap();

        let full = compute_full_hash(&path, &CancellationToken::new(), |_| {}).unwrap();
        let resolver = HashIdentity::new();
        let adopted = resolver.adopt(&path, full.clone()).await.unwrap();

        assert_eq!(adopted.full_hash, full.sha256);
        assert_eq!(resolver.cached(&path), Some(adopted.clone()));
        assert_eq!(resolver.identify(&path).await.unwrap(), adopted);
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let resolver = HashIdentity::new();
        let result = resolver.identify(Path::new("/no/such/file.bin")).await;
        assert!(matches!(result, Err(AtelierError::Io { .. })));
    }
}
