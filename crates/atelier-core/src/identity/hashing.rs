//! Streaming hash computation for asset files.
//!
//! Provides:
//! - A fast hash over a bounded prefix/suffix window plus the file size
//! - A single-pass SHA256 + BLAKE3 full hash with progress and cancellation
//! - SHA256 verification

use crate::cancel::CancellationToken;
use crate::config::HashConfig;
use crate::error::{AtelierError, Result};
use blake3::Hasher as Blake3Hasher;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

/// Full-file digests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullHash {
    /// SHA256 as lowercase hex; the canonical identity
    pub sha256: String,
    /// BLAKE3 as lowercase hex
    pub blake3: String,
}

/// Progress update during full hashing.
#[derive(Debug, Clone, Copy)]
pub struct HashProgress {
    pub bytes_processed: u64,
    pub total_bytes: u64,
}

impl HashProgress {
    /// Completion as a percentage (0-100).
    pub fn percent(&self) -> f32 {
        if self.total_bytes == 0 {
            100.0
        } else {
            (self.bytes_processed as f64 / self.total_bytes as f64 * 100.0) as f32
        }
    }
}

/// Compute the fast hash of a file.
///
/// BLAKE3 over the first window, the last window (only when the file is
/// larger than two windows, so the two never overlap), and the file size as
/// little-endian bytes. Reads at most two windows regardless of file size.
pub fn compute_fast_hash(path: &Path) -> Result<String> {
    compute_fast_hash_with_window(path, HashConfig::FAST_HASH_WINDOW)
}

pub(crate) fn compute_fast_hash_with_window(path: &Path, window: usize) -> Result<String> {
    let mut file = File::open(path).map_err(|e| AtelierError::io_with_path(e, path))?;
    let file_size = file
        .metadata()
        .map_err(|e| AtelierError::io_with_path(e, path))?
        .len();

    let mut hasher = Blake3Hasher::new();

    let head_len = std::cmp::min(file_size, window as u64) as usize;
    let mut buffer = vec![0u8; head_len];
    file.read_exact(&mut buffer)
        .map_err(|e| AtelierError::io_with_path(e, path))?;
    hasher.update(&buffer);

    if file_size > window as u64 * 2 {
        file.seek(SeekFrom::Start(file_size - window as u64))
            .map_err(|e| AtelierError::io_with_path(e, path))?;
        buffer.resize(window, 0);
        file.read_exact(&mut buffer)
            .map_err(|e| AtelierError::io_with_path(e, path))?;
        hasher.update(&buffer);
    }

    hasher.update(&file_size.to_le_bytes());
    Ok(hasher.finalize().to_hex().to_string())
}

/// Compute SHA256 and BLAKE3 in one pass over the file.
///
/// Checks `cancel` before every chunk and reports progress after each one.
/// Blocking; async callers should run this on `spawn_blocking`.
pub fn compute_full_hash(
    path: &Path,
    cancel: &CancellationToken,
    mut on_progress: impl FnMut(HashProgress),
) -> Result<FullHash> {
    let mut file = File::open(path).map_err(|e| AtelierError::io_with_path(e, path))?;
    let total_bytes = file
        .metadata()
        .map_err(|e| AtelierError::io_with_path(e, path))?
        .len();

    let mut sha256_hasher = Sha256::new();
    let mut blake3_hasher = Blake3Hasher::new();
    let mut buffer = vec![0u8; HashConfig::CHUNK_SIZE];
    let mut bytes_processed: u64 = 0;

    loop {
        cancel.check()?;

        let bytes_read = file
            .read(&mut buffer)
            .map_err(|e| AtelierError::io_with_path(e, path))?;
        if bytes_read == 0 {
            break;
        }

        sha256_hasher.update(&buffer[..bytes_read]);
        blake3_hasher.update(&buffer[..bytes_read]);
        bytes_processed += bytes_read as u64;

        on_progress(HashProgress {
            bytes_processed,
            total_bytes,
        });
    }

    Ok(FullHash {
        sha256: hex::encode(sha256_hasher.finalize()),
        blake3: blake3_hasher.finalize().to_hex().to_string(),
    })
}

/// Verify a file's SHA256 against an expected hex digest (case-insensitive).
pub fn verify_sha256(path: &Path, expected: &str, cancel: &CancellationToken) -> Result<FullHash> {
    let hash = compute_full_hash(path, cancel, |_| {})?;
    if hash.sha256.eq_ignore_ascii_case(expected) {
        Ok(hash)
    } else {
        Err(AtelierError::HashMismatch {
            expected: expected.to_lowercase(),
            actual: hash.sha256,
        })
    }
}
