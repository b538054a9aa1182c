//! Library root scanning.
//!
//! Walks a configured root and yields every file its mode accepts. Hidden
//! entries and in-flight download temp files are skipped.

mod types;

pub use types::{AssetMode, AssetPath, ModelType};

use crate::cancel::CancellationToken;
use crate::config::NetworkConfig;
use crate::error::{AtelierError, Result};
use std::path::Path;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// How often (in files) the scan reports progress.
const PROGRESS_EVERY: usize = 64;

/// Walk `root` and return the assets its mode accepts, sorted by path.
///
/// `on_progress` receives the running count of accepted files. Blocking;
/// async callers should run this on `spawn_blocking`.
pub fn scan_directory(
    root: &Path,
    mode: AssetMode,
    model_type: Option<&ModelType>,
    cancel: &CancellationToken,
    mut on_progress: impl FnMut(usize),
) -> Result<Vec<AssetPath>> {
    if !root.is_dir() {
        return Err(AtelierError::Validation {
            field: "path".to_string(),
            message: format!("{} is not a directory", root.display()),
        });
    }

    let mut assets = Vec::new();
    let walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(true)
        .into_iter()
        .filter_entry(|e| !is_hidden(e.file_name()));

    for entry in walker {
        cancel.check()?;

        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry under {}: {}", root.display(), e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        if is_temp_download(path) || !mode.accepts(path) {
            continue;
        }

        assets.push(AssetPath::new(
            path.to_path_buf(),
            mode,
            model_type.cloned(),
        ));
        if assets.len() % PROGRESS_EVERY == 0 {
            on_progress(assets.len());
        }
    }

    assets.sort_by(|a, b| a.path().cmp(b.path()));
    on_progress(assets.len());
    debug!(
        "Scanned {} ({}): {} assets",
        root.display(),
        mode,
        assets.len()
    );
    Ok(assets)
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().map(|s| s.starts_with('.')).unwrap_or(false)
}

fn is_temp_download(path: &Path) -> bool {
    path.to_str()
        .map(|s| s.ends_with(NetworkConfig::DOWNLOAD_TEMP_SUFFIX))
        .unwrap_or(false)
}
