//! Network utilities for registry traffic, retries and downloads.
//!
//! This module provides:
//! - HTTP client with rate limiting and per-host credentials
//! - Retry logic with exponential backoff and jitter
//! - Download manager with temp files, verification and collision policies

mod client;
mod download;
mod retry;

pub use client::{redact_query, HttpClient};
pub use download::{
    sanitize_file_name, CollisionPolicy, DownloadManager, DownloadOutcome, DownloadRequest,
};
pub use retry::{retry_async, RetryConfig, RetryStats};
