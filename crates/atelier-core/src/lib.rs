//! Atelier Core - headless library for indexing, enriching and annotating
//! local generative-model asset libraries.
//!
//! Library roots are scanned for assets, each file is identified by the
//! SHA256 of its contents, and registry metadata, thumbnails, example media
//! and notes are kept in a file-per-hash cache. Long-running work goes
//! through a task orchestrator that reports on a push stream. Generation
//! parameters embedded in PNG and JPEG images can be read and written back.
//!
//! # Example
//!
//! ```rust,ignore
//! use atelier_core::{AtelierApi, Settings};
//!
//! #[tokio::main]
//! async fn main() -> atelier_core::Result<()> {
//!     let settings = Settings::load(&Settings::default_path("/opt/atelier".as_ref()))?;
//!     let api = AtelierApi::builder(settings).app_dir("/opt/atelier").build().await?;
//!
//!     let id = api.auto_match("/models/sd/dreamshaper.safetensors").await?;
//!     let task = api.wait(id).await?;
//!     println!("{}: {}", task.key, task.status);
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod cancel;
pub mod codec;
pub mod config;
pub mod error;
pub mod identity;
pub mod network;
pub mod persist;
pub mod registry;
pub mod scan;
pub mod settings;
pub mod tasks;

mod api;

pub use api::AtelierApiBuilder;
pub use cache::{CacheEntry, CacheEntryUpdate, CacheStore, FileCacheStore, Notes};
pub use cancel::{CancellationToken, CancelledError};
pub use codec::{Container, EmbeddedMetadataRecord, MetadataCodec, MetadataSource, ParsedFields};
pub use error::{AtelierError, Result};
pub use identity::{ContentIdentity, HashIdentity};
pub use network::{CollisionPolicy, RetryConfig};
pub use registry::{HttpRegistryClient, Provider, RemoteMetadata, RemoteMetadataClient};
pub use scan::{AssetMode, AssetPath, ModelType};
pub use settings::{LibraryRoot, Settings};
pub use tasks::{
    OrchestratorConfig, Task, TaskEvent, TaskId, TaskKind, TaskOrchestrator, TaskOutput,
    TaskProgress, TaskSpec, TaskStatus, TaskSubscription,
};

use std::path::PathBuf;
use std::sync::Arc;

/// Main entry point for programmatic access to an asset library.
///
/// Cheap to clone; clones share the same orchestrator and cache.
#[derive(Clone)]
pub struct AtelierApi {
    inner: Arc<ApiInner>,
}

struct ApiInner {
    settings: Settings,
    cache_root: PathBuf,
    cache: Arc<FileCacheStore>,
    orchestrator: TaskOrchestrator,
    codec: MetadataCodec,
}

impl AtelierApi {
    /// Create a builder over `settings`.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let api = AtelierApi::builder(settings)
    ///     .cache_root("/data/atelier-cache")
    ///     .registry(Arc::new(my_client))
    ///     .build()
    ///     .await?;
    /// ```
    pub fn builder(settings: Settings) -> AtelierApiBuilder {
        AtelierApiBuilder::new(settings)
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn cache_root(&self) -> &std::path::Path {
        &self.inner.cache_root
    }
}
