//! Persistent identity index.
//!
//! Maps absolute paths to the identity computed for them, guarded by the
//! file's size and modification time so a changed file is never matched to a
//! stale hash. Survives restarts so multi-gigabyte files are hashed once.

use super::ContentIdentity;
use crate::error::Result;
use crate::persist::{atomic_read_json, atomic_write_json};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

/// Size and mtime fingerprint of a file on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileStamp {
    pub size: u64,
    /// Modification time in nanoseconds since the Unix epoch.
    pub mtime_ns: u64,
}

impl FileStamp {
    pub fn of(path: &Path) -> std::io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        let mtime_ns = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Ok(Self {
            size: metadata.len(),
            mtime_ns,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexRecord {
    stamp: FileStamp,
    identity: ContentIdentity,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexFile {
    #[serde(default)]
    entries: HashMap<String, IndexRecord>,
}

/// On-disk `(path, size, mtime) -> identity` memo.
pub struct IdentityIndex {
    path: PathBuf,
    state: Mutex<IndexFile>,
}

impl IdentityIndex {
    /// Open the index at `path`. A missing or unreadable file starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = match atomic_read_json::<IndexFile>(&path) {
            Ok(Some(file)) => file,
            Ok(None) => IndexFile::default(),
            Err(e) => {
                warn!(
                    "Identity index {} unreadable, starting empty: {}",
                    path.display(),
                    e
                );
                IndexFile::default()
            }
        };
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    /// Return the stored identity if the stamp still matches.
    pub fn get(&self, path: &Path, stamp: FileStamp) -> Option<ContentIdentity> {
        let state = self.state.lock().ok()?;
        state
            .entries
            .get(path_key(path).as_str())
            .filter(|record| record.stamp == stamp)
            .map(|record| record.identity.clone())
    }

    /// Record an identity and persist the index.
    pub fn insert(&self, path: &Path, stamp: FileStamp, identity: ContentIdentity) -> Result<()> {
        // Written under the lock so a slower writer never clobbers a newer snapshot.
        let mut state = self
            .state
            .lock()
            .map_err(|_| crate::error::AtelierError::Other("identity index poisoned".into()))?;
        state
            .entries
            .insert(path_key(path), IndexRecord { stamp, identity });
        atomic_write_json(&self.path, &*state)
    }

    /// Number of remembered paths.
    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn identity(tag: &str) -> ContentIdentity {
        ContentIdentity {
            fast_hash: format!("fast-{tag}"),
            full_hash: format!("full-{tag}"),
            blake3: format!("b3-{tag}"),
            file_size: 3,
        }
    }

    #[test]
    fn test_insert_persists_across_reopen() {
        let temp = TempDir::new().unwrap();
        let index_path = temp.path().join("identities.json");
        let stamp = FileStamp {
            size: 3,
            mtime_ns: 42,
        };

        let index = IdentityIndex::open(&index_path);
        index
            .insert(Path::new("/lib/a.safetensors"), stamp, identity("a"))
            .unwrap();

        let reopened = IdentityIndex::open(&index_path);
        assert_eq!(reopened.len(), 1);
        assert_eq!(
            reopened.get(Path::new("/lib/a.safetensors"), stamp),
            Some(identity("a"))
        );
    }

    #[test]
    fn test_stale_stamp_misses() {
        let temp = TempDir::new().unwrap();
        let index = IdentityIndex::open(temp.path().join("identities.json"));
        let stamp = FileStamp {
            size: 3,
            mtime_ns: 1,
        };
        index.insert(Path::new("/a"), stamp, identity("a")).unwrap();

        let touched = FileStamp {
            size: 3,
            mtime_ns: 2,
        };
        assert_eq!(index.get(Path::new("/a"), touched), None);
    }

    #[test]
    fn test_corrupt_index_starts_empty() {
        let temp = TempDir::new().unwrap();
        let index_path = temp.path().join("identities.json");
        std::fs::write(&index_path, b"garbage").unwrap();

        let index = IdentityIndex::open(&index_path);
        assert!(index.is_empty());
    }
}
