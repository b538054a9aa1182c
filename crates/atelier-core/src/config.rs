//! Centralized configuration constants for the Atelier core.
//!
//! Runtime, user-editable settings live in [`crate::settings`]; the values
//! here are compiled-in defaults and on-disk naming conventions.

use std::time::Duration;

/// Application-level configuration.
pub struct AppConfig;

impl AppConfig {
    pub const APP_NAME: &'static str = "Atelier";
    pub const USER_AGENT: &'static str = concat!("Atelier/", env!("CARGO_PKG_VERSION"));
}

/// Network-related configuration.
pub struct NetworkConfig;

impl NetworkConfig {
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const DOWNLOAD_PROGRESS_INTERVAL: Duration = Duration::from_millis(500);
    pub const DOWNLOAD_TEMP_SUFFIX: &'static str = ".part";
    /// Registry requests allowed per second (burst of the same size).
    pub const REGISTRY_REQUESTS_PER_SECOND: u32 = 2;
    pub const CIVITAI_HOST: &'static str = "civitai.com";
    pub const CIVITAI_API_BASE: &'static str = "https://civitai.com/api/v1";
    pub const HUGGINGFACE_HOST: &'static str = "huggingface.co";
    pub const HUGGINGFACE_BASE: &'static str = "https://huggingface.co";
}

/// Hashing configuration.
pub struct HashConfig;

impl HashConfig {
    /// Read size for streaming full-file hashes (8MB).
    pub const CHUNK_SIZE: usize = 8 * 1024 * 1024;
    /// Prefix/suffix window for the fast hash (8MB each).
    pub const FAST_HASH_WINDOW: usize = 8 * 1024 * 1024;
    /// In-memory memo capacity (entries).
    pub const MEMO_CAPACITY: u64 = 10_000;
    pub const MEMO_TTL: Duration = Duration::from_secs(3600);
}

/// Task orchestration defaults.
pub struct TaskConfig;

impl TaskConfig {
    pub const DEFAULT_LOCAL_WORKERS: usize = 2;
    pub const DEFAULT_NETWORK_WORKERS: usize = 2;
    /// Capacity of the broadcast channel carrying task state changes.
    pub const EVENT_CHANNEL_CAPACITY: usize = 1024;
    pub const RETRY_MAX_ATTEMPTS: u32 = 3;
    pub const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
    pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(30);
}

/// Embedded-metadata codec limits.
pub struct CodecConfig;

impl CodecConfig {
    /// Text chunk carrying A1111-style parameters; the one `write` replaces.
    pub const PARAMETERS_KEYWORD: &'static str = "parameters";
    /// Cap on inflated text (zTXt/iTXt and stealth payloads).
    pub const MAX_INFLATED_TEXT: u64 = 16 * 1024 * 1024;
    pub const STEALTH_MAGIC: &'static str = "stealth_pngcomp";
}

/// Directory and file naming conventions.
pub struct PathsConfig;

impl PathsConfig {
    pub const CACHE_DIR_NAME: &'static str = "cache";
    pub const SETTINGS_FILE_NAME: &'static str = "atelier.json";
    pub const ENTRIES_DIR_NAME: &'static str = "entries";
    pub const ENTRY_FILE_NAME: &'static str = "entry.json";
    pub const NOTES_FILE_NAME: &'static str = "notes.md";
    pub const EXAMPLES_DIR_NAME: &'static str = "examples";
    pub const ATTACHMENTS_DIR_NAME: &'static str = "attachments";
    pub const THUMBNAIL_STEM: &'static str = "thumbnail";
    pub const IDENTITY_INDEX_FILE_NAME: &'static str = "identities.json";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fast_window_not_larger_than_chunk() {
        assert!(HashConfig::FAST_HASH_WINDOW <= HashConfig::CHUNK_SIZE);
    }

    #[test]
    fn test_retry_defaults_bounded() {
        assert!(TaskConfig::RETRY_BASE_DELAY < TaskConfig::RETRY_MAX_DELAY);
        assert!(TaskConfig::RETRY_MAX_ATTEMPTS >= 1);
    }
}
