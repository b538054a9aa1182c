//! Builder for configuring AtelierApi initialization.

use std::path::PathBuf;
use std::sync::Arc;

use crate::cache::{CacheStore, FileCacheStore};
use crate::codec::MetadataCodec;
use crate::config::PathsConfig;
use crate::error::{AtelierError, Result};
use crate::identity::HashIdentity;
use crate::registry::{HttpRegistryClient, RemoteMetadataClient};
use crate::settings::Settings;
use crate::tasks::{OrchestratorConfig, TaskExecutor, TaskOrchestrator};
use crate::{ApiInner, AtelierApi};

/// Builder for configuring AtelierApi initialization.
///
/// # Example
///
/// ```rust,ignore
/// use atelier_core::AtelierApi;
///
/// let api = AtelierApi::builder(settings)
///     .app_dir("/opt/atelier")
///     .persist_identities(false)
///     .build()
///     .await?;
/// ```
pub struct AtelierApiBuilder {
    settings: Settings,
    app_dir: Option<PathBuf>,
    cache_root: Option<PathBuf>,
    registry: Option<Arc<dyn RemoteMetadataClient>>,
    orchestrator: Option<OrchestratorConfig>,
    persist_identities: bool,
}

impl AtelierApiBuilder {
    /// Create a new builder over `settings`.
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            app_dir: None,
            cache_root: None,
            registry: None,
            orchestrator: None,
            persist_identities: true,
        }
    }

    /// Directory the default cache root is resolved against.
    ///
    /// Default: the current working directory
    pub fn app_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.app_dir = Some(dir.into());
        self
    }

    /// Cache root, overriding `settings.cache_path`.
    pub fn cache_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cache_root = Some(root.into());
        self
    }

    /// Registry client to use instead of the HTTP client for Civitai and
    /// HuggingFace.
    pub fn registry(mut self, client: Arc<dyn RemoteMetadataClient>) -> Self {
        self.registry = Some(client);
        self
    }

    /// Orchestrator tuning, overriding the pool sizes and retry policy from
    /// the settings.
    pub fn orchestrator(mut self, config: OrchestratorConfig) -> Self {
        self.orchestrator = Some(config);
        self
    }

    /// Keep the identity memo in `identities.json` under the cache root.
    ///
    /// Default: `true`
    pub fn persist_identities(mut self, enable: bool) -> Self {
        self.persist_identities = enable;
        self
    }

    /// Build the AtelierApi instance. Must run inside a Tokio runtime.
    pub async fn build(self) -> Result<AtelierApi> {
        self.settings.validate()?;

        let app_dir = match self.app_dir {
            Some(dir) => dir,
            None => std::env::current_dir().map_err(|e| AtelierError::Config {
                message: format!("Failed to resolve working directory: {}", e),
            })?,
        };
        let cache_root = self
            .cache_root
            .unwrap_or_else(|| self.settings.cache_root(&app_dir));
        tokio::fs::create_dir_all(&cache_root)
            .await
            .map_err(|e| AtelierError::io_with_path(e, &cache_root))?;

        let cache = Arc::new(FileCacheStore::open(&cache_root)?);
        let identity = if self.persist_identities {
            HashIdentity::with_index(cache_root.join(PathsConfig::IDENTITY_INDEX_FILE_NAME))
        } else {
            HashIdentity::new()
        };
        let registry: Arc<dyn RemoteMetadataClient> = match self.registry {
            Some(client) => client,
            None => Arc::new(HttpRegistryClient::new(self.settings.credentials.clone())?),
        };

        let config = self
            .orchestrator
            .unwrap_or_else(|| OrchestratorConfig::from(&self.settings));
        let store: Arc<dyn CacheStore> = cache.clone();
        let executor = TaskExecutor::new(identity, store, registry, config.retry.clone());
        let orchestrator = TaskOrchestrator::new(config, executor);

        tracing::info!(
            "Atelier API ready ({} libraries, cache at {})",
            self.settings.libraries.len(),
            cache_root.display()
        );

        Ok(AtelierApi {
            inner: Arc::new(ApiInner {
                settings: self.settings,
                cache_root,
                cache,
                orchestrator,
                codec: MetadataCodec::new(),
            }),
        })
    }
}
