//! Atomic file replacement.
//!
//! Writes go to a uniquely named sibling temp file, are synced to disk, and
//! are then renamed over the target, so readers see either the old or the new
//! content and never a torn write.

use crate::error::{AtelierError, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

static TEMP_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Read and parse a JSON file.
///
/// Returns `None` if the file doesn't exist, a `Json` error if it exists but
/// does not parse.
pub fn atomic_read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(AtelierError::io_with_path(e, path)),
    };

    let data: T = serde_json::from_str(&contents).map_err(|e| AtelierError::Json {
        message: format!("Failed to parse {}: {}", path.display(), e),
        source: Some(e),
    })?;

    Ok(Some(data))
}

/// Serialize `data` as pretty JSON and atomically replace `path` with it.
pub fn atomic_write_json<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    let serialized = serde_json::to_vec_pretty(data).map_err(|e| AtelierError::Json {
        message: format!("Failed to serialize {}: {}", path.display(), e),
        source: Some(e),
    })?;
    atomic_write_bytes(path, &serialized)
}

/// Atomically replace `path` with `bytes`, creating parent directories.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| AtelierError::io_with_path(e, parent))?;
    }

    let temp_path = temp_sibling(path);
    let write_result = (|| -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .map_err(|e| AtelierError::io_with_path(e, &temp_path))?;
        file.write_all(bytes)
            .map_err(|e| AtelierError::io_with_path(e, &temp_path))?;
        file.sync_all()
            .map_err(|e| AtelierError::io_with_path(e, &temp_path))?;
        Ok(())
    })();

    if let Err(e) = write_result {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }

    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(AtelierError::Io {
            message: format!(
                "Failed to rename {} to {}",
                temp_path.display(),
                path.display()
            ),
            path: Some(path.to_path_buf()),
            source: Some(e),
        });
    }

    debug!("Atomically wrote {}", path.display());
    Ok(())
}

/// Copy `src` to `dest` through a temp file so `dest` is never half-written.
pub fn atomic_copy(src: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| AtelierError::io_with_path(e, parent))?;
    }
    let temp_path = temp_sibling(dest);
    if let Err(e) = fs::copy(src, &temp_path) {
        let _ = fs::remove_file(&temp_path);
        return Err(AtelierError::io_with_path(e, src));
    }
    fs::rename(&temp_path, dest).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        AtelierError::io_with_path(e, dest)
    })
}

fn temp_sibling(path: &Path) -> PathBuf {
    let seq = TEMP_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("atelier");
    path.with_file_name(format!(".{}.{}.{}.tmp", name, process::id(), seq))
}
