//! Error types for the Atelier core.
//!
//! Every fallible operation in the crate returns [`AtelierError`]. The
//! variants map onto the outcomes a caller has to tell apart: transient
//! network trouble (retried), authoritative "no match" answers (never
//! retried), caller input errors, and local I/O failures.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the Atelier core.
#[derive(Debug, Error)]
pub enum AtelierError {
    // Network errors
    #[error("Network error: {message}")]
    Network {
        message: String,
        /// HTTP status when the failure came from a response
        status: Option<u16>,
    },

    #[error("Request timeout after {0:?}")]
    Timeout(std::time::Duration),

    /// The registry answered authoritatively that it has no match.
    #[error("Not found: {what}")]
    NotFound { what: String },

    // Caller input errors
    #[error("Unsupported URL {url}: {reason}")]
    UnsupportedUrl { url: String, reason: String },

    #[error("Unsupported image container: {0}")]
    UnsupportedContainer(PathBuf),

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Corrupt cache entry {hash}: {message}")]
    CorruptCacheEntry { hash: String, message: String },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Malformed {container} data: {message}")]
    Malformed { container: String, message: String },

    // Transfer integrity errors
    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("Operation cancelled")]
    Cancelled,

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for Atelier operations.
pub type Result<T> = std::result::Result<T, AtelierError>;

impl From<std::io::Error> for AtelierError {
    fn from(err: std::io::Error) -> Self {
        AtelierError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for AtelierError {
    fn from(err: serde_json::Error) -> Self {
        AtelierError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for AtelierError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AtelierError::Timeout(std::time::Duration::from_secs(0))
        } else {
            AtelierError::Network {
                message: err.to_string(),
                status: err.status().map(|s| s.as_u16()),
            }
        }
    }
}

impl From<image::ImageError> for AtelierError {
    fn from(err: image::ImageError) -> Self {
        AtelierError::Malformed {
            container: "image".to_string(),
            message: err.to_string(),
        }
    }
}

impl AtelierError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        AtelierError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Create a malformed-container error.
    pub fn malformed(container: &str, message: impl Into<String>) -> Self {
        AtelierError::Malformed {
            container: container.to_string(),
            message: message.into(),
        }
    }

    /// Check if this error should trigger a retry.
    ///
    /// Only transient network conditions qualify: timeouts, connection
    /// failures with no status, request timeouts (408), throttling (429)
    /// and server errors (5xx).
    pub fn is_retryable(&self) -> bool {
        match self {
            AtelierError::Timeout(_) => true,
            AtelierError::Network { status: None, .. } => true,
            AtelierError::Network {
                status: Some(code), ..
            } => *code == 408 || *code == 429 || (500..600).contains(code),
            _ => false,
        }
    }

    /// Whether this error is the registry's authoritative "no match" answer.
    pub fn is_not_found(&self) -> bool {
        matches!(self, AtelierError::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AtelierError::NotFound {
            what: "hash abc".into(),
        };
        assert_eq!(err.to_string(), "Not found: hash abc");

        let err = AtelierError::UnsupportedUrl {
            url: "https://example.com".into(),
            reason: "unknown host".into(),
        };
        assert_eq!(
            err.to_string(),
            "Unsupported URL https://example.com: unknown host"
        );
    }

    #[test]
    fn test_retryable_errors() {
        assert!(AtelierError::Timeout(std::time::Duration::from_secs(5)).is_retryable());
        assert!(AtelierError::Network {
            message: "connection reset".into(),
            status: None
        }
        .is_retryable());
        assert!(AtelierError::Network {
            message: "bad gateway".into(),
            status: Some(502)
        }
        .is_retryable());
        assert!(AtelierError::Network {
            message: "slow down".into(),
            status: Some(429)
        }
        .is_retryable());
    }

    #[test]
    fn test_non_retryable_errors() {
        assert!(!AtelierError::NotFound { what: "x".into() }.is_retryable());
        assert!(!AtelierError::Network {
            message: "forbidden".into(),
            status: Some(403)
        }
        .is_retryable());
        assert!(!AtelierError::Cancelled.is_retryable());
        assert!(!AtelierError::UnsupportedContainer(PathBuf::from("a.gif")).is_retryable());
    }

    #[test]
    fn test_io_with_path() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        match AtelierError::io_with_path(io, "/tmp/x") {
            AtelierError::Io { path, source, .. } => {
                assert_eq!(path, Some(PathBuf::from("/tmp/x")));
                assert!(source.is_some());
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
