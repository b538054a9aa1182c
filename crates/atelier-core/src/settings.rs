//! User settings: library roots, cache location, registry credentials and
//! scheduling knobs.
//!
//! Stored as JSON. Files written by older releases keep everything under a
//! `__settings__` object whose `directories` map aliases either to a bare
//! path string or to a `{path, mode, ...}` object; [`Settings::load`]
//! migrates that shape transparently.

use crate::config::{PathsConfig, TaskConfig};
use crate::error::{AtelierError, Result};
use crate::persist::{atomic_read_json, atomic_write_json};
use crate::scan::{AssetMode, ModelType};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// One configured library root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryRoot {
    pub alias: String,
    pub path: PathBuf,
    pub mode: AssetMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_type: Option<ModelType>,
    /// ComfyUI installation this root belongs to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comfy_root: Option<PathBuf>,
}

/// Registry credentials.
///
/// Passed through to the registry client as bearer tokens and never logged;
/// the `Debug` impl redacts them.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub civitai_api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub huggingface_token: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn redact(v: &Option<String>) -> &'static str {
            if v.is_some() {
                "<redacted>"
            } else {
                "<unset>"
            }
        }
        f.debug_struct("Credentials")
            .field("civitai_api_key", &redact(&self.civitai_api_key))
            .field("huggingface_token", &redact(&self.huggingface_token))
            .finish()
    }
}

impl Credentials {
    /// Treat empty strings as unset.
    fn normalized(mut self) -> Self {
        self.civitai_api_key = self.civitai_api_key.filter(|k| !k.trim().is_empty());
        self.huggingface_token = self.huggingface_token.filter(|k| !k.trim().is_empty());
        self
    }
}

/// Worker pool sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencySettings {
    pub local_workers: usize,
    pub network_workers: usize,
}

impl Default for ConcurrencySettings {
    fn default() -> Self {
        Self {
            local_workers: TaskConfig::DEFAULT_LOCAL_WORKERS,
            network_workers: TaskConfig::DEFAULT_NETWORK_WORKERS,
        }
    }
}

/// Retry policy for transient registry failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: TaskConfig::RETRY_MAX_ATTEMPTS,
            base_delay_ms: TaskConfig::RETRY_BASE_DELAY.as_millis() as u64,
            max_delay_ms: TaskConfig::RETRY_MAX_DELAY.as_millis() as u64,
        }
    }
}

impl RetrySettings {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// All user settings the core consumes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Library roots, in display order.
    #[serde(default)]
    pub libraries: Vec<LibraryRoot>,
    /// Cache root override. `None` means `<app_dir>/cache`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_path: Option<PathBuf>,
    #[serde(default)]
    pub credentials: Credentials,
    #[serde(default)]
    pub concurrency: ConcurrencySettings,
    #[serde(default)]
    pub retry: RetrySettings,
}

impl Settings {
    /// Default settings file location inside `app_dir`.
    pub fn default_path(app_dir: &Path) -> PathBuf {
        app_dir.join(PathsConfig::SETTINGS_FILE_NAME)
    }

    /// Load settings from `path`, returning defaults when the file is absent.
    ///
    /// Legacy `__settings__` files are migrated in memory; call
    /// [`save`](Self::save) to persist the new shape.
    pub fn load(path: &Path) -> Result<Self> {
        let Some(raw) = atomic_read_json::<serde_json::Value>(path)? else {
            return Ok(Self::default());
        };

        let settings = if let Some(legacy) = raw.get("__settings__") {
            info!("Migrating legacy settings file {}", path.display());
            Self::from_legacy(legacy)?
        } else {
            serde_json::from_value::<Settings>(raw).map_err(|e| AtelierError::Config {
                message: format!("Invalid settings file {}: {}", path.display(), e),
            })?
        };

        let settings = Settings {
            credentials: settings.credentials.normalized(),
            ..settings
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Persist settings atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        atomic_write_json(path, self)
    }

    /// Check invariants: unique non-empty aliases, non-empty paths, and
    /// non-zero pool sizes and attempt counts.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for root in &self.libraries {
            if root.alias.trim().is_empty() {
                return Err(AtelierError::Validation {
                    field: "libraries.alias".to_string(),
                    message: "alias must not be empty".to_string(),
                });
            }
            if !seen.insert(root.alias.as_str()) {
                return Err(AtelierError::Validation {
                    field: "libraries.alias".to_string(),
                    message: format!("duplicate alias '{}'", root.alias),
                });
            }
            if root.path.as_os_str().is_empty() {
                return Err(AtelierError::Validation {
                    field: "libraries.path".to_string(),
                    message: format!("library '{}' has an empty path", root.alias),
                });
            }
        }
        if self.concurrency.local_workers == 0 || self.concurrency.network_workers == 0 {
            return Err(AtelierError::Validation {
                field: "concurrency".to_string(),
                message: "worker pools need at least one worker".to_string(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(AtelierError::Validation {
                field: "retry.max_attempts".to_string(),
                message: "at least one attempt is required".to_string(),
            });
        }
        Ok(())
    }

    /// Look up a library root by alias.
    pub fn library(&self, alias: &str) -> Option<&LibraryRoot> {
        self.libraries.iter().find(|r| r.alias == alias)
    }

    /// The library root containing `path`, longest match first.
    pub fn library_for_path(&self, path: &Path) -> Option<&LibraryRoot> {
        self.libraries
            .iter()
            .filter(|r| path.starts_with(&r.path))
            .max_by_key(|r| r.path.components().count())
    }

    /// Resolve the cache root, falling back to `<app_dir>/cache`.
    pub fn cache_root(&self, app_dir: &Path) -> PathBuf {
        self.cache_path
            .clone()
            .unwrap_or_else(|| app_dir.join(PathsConfig::CACHE_DIR_NAME))
    }

    fn from_legacy(legacy: &serde_json::Value) -> Result<Self> {
        let mut settings = Settings::default();

        if let Some(dirs) = legacy.get("directories").and_then(|d| d.as_object()) {
            for (alias, value) in dirs {
                let root = match value {
                    serde_json::Value::String(path) => LibraryRoot {
                        alias: alias.clone(),
                        path: PathBuf::from(path),
                        mode: AssetMode::Model,
                        model_type: None,
                        comfy_root: None,
                    },
                    serde_json::Value::Object(obj) => {
                        let path = obj.get("path").and_then(|p| p.as_str()).ok_or_else(|| {
                            AtelierError::Config {
                                message: format!("legacy directory '{}' has no path", alias),
                            }
                        })?;
                        let mode = obj
                            .get("mode")
                            .and_then(|m| m.as_str())
                            .map(|m| m.parse::<AssetMode>())
                            .transpose()
                            .map_err(|message| AtelierError::Config { message })?
                            .unwrap_or(AssetMode::Model);
                        LibraryRoot {
                            alias: alias.clone(),
                            path: PathBuf::from(path),
                            mode,
                            model_type: obj
                                .get("model_type")
                                .and_then(|t| t.as_str())
                                .filter(|t| !t.is_empty())
                                .map(|t| ModelType::from(t.to_string())),
                            comfy_root: obj
                                .get("comfy_root")
                                .and_then(|c| c.as_str())
                                .filter(|c| !c.is_empty())
                                .map(PathBuf::from),
                        }
                    }
                    _ => {
                        return Err(AtelierError::Config {
                            message: format!("legacy directory '{}' has an invalid value", alias),
                        })
                    }
                };
                settings.libraries.push(root);
            }
        }

        let string_field = |key: &str| {
            legacy
                .get(key)
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        settings.cache_path = string_field("cache_path").map(PathBuf::from);
        settings.credentials = Credentials {
            civitai_api_key: string_field("civitai_api_key"),
            huggingface_token: string_field("hf_api_key"),
        };

        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_missing_returns_default() {
        let temp = TempDir::new().unwrap();
        let settings = Settings::load(&temp.path().join("atelier.json")).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.concurrency.local_workers, 2);
    }

    #[test]
    fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let path = Settings::default_path(temp.path());
        let settings = Settings {
            libraries: vec![LibraryRoot {
                alias: "SD".into(),
                path: "/models/sd".into(),
                mode: AssetMode::Model,
                model_type: Some(ModelType::Checkpoint),
                comfy_root: Some("/opt/ComfyUI".into()),
            }],
            credentials: Credentials {
                civitai_api_key: Some("secret".into()),
                huggingface_token: None,
            },
            ..Default::default()
        };

        settings.save(&path).unwrap();
        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_legacy_migration() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "__settings__": {
                    "directories": {
                        "Old": "/models/old",
                        "Wf": {"path": "/wf", "mode": "workflow"},
                        "Lora": {"path": "/l", "mode": "model", "model_type": "lora", "comfy_root": ""}
                    },
                    "civitai_api_key": "abc",
                    "hf_api_key": "",
                    "cache_path": "/cache"
                },
                "/models/old/a.safetensors": {"note": "ignored"}
            }"#,
        )
        .unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.libraries.len(), 3);
        let old = settings.library("Old").unwrap();
        assert_eq!(old.mode, AssetMode::Model);
        assert_eq!(old.path, PathBuf::from("/models/old"));
        assert_eq!(settings.library("Wf").unwrap().mode, AssetMode::Workflow);
        let lora = settings.library("Lora").unwrap();
        assert_eq!(lora.model_type, Some(ModelType::Lora));
        assert_eq!(lora.comfy_root, None);
        assert_eq!(settings.credentials.civitai_api_key.as_deref(), Some("abc"));
        assert_eq!(settings.credentials.huggingface_token, None);
        assert_eq!(settings.cache_path, Some(PathBuf::from("/cache")));
    }

    #[test]
    fn test_validate_rejects_duplicate_alias() {
        let root = LibraryRoot {
            alias: "A".into(),
            path: "/a".into(),
            mode: AssetMode::Gallery,
            model_type: None,
            comfy_root: None,
        };
        let settings = Settings {
            libraries: vec![root.clone(), root],
            ..Default::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(AtelierError::Validation { .. })
        ));
    }

    #[test]
    fn test_credentials_debug_redacted() {
        let creds = Credentials {
            civitai_api_key: Some("very-secret".into()),
            huggingface_token: None,
        };
        let debug = format!("{:?}", creds);
        assert!(!debug.contains("very-secret"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_library_for_path_longest_match() {
        let settings = Settings {
            libraries: vec![
                LibraryRoot {
                    alias: "All".into(),
                    path: "/m".into(),
                    mode: AssetMode::Model,
                    model_type: None,
                    comfy_root: None,
                },
                LibraryRoot {
                    alias: "Loras".into(),
                    path: "/m/loras".into(),
                    mode: AssetMode::Model,
                    model_type: Some(ModelType::Lora),
                    comfy_root: None,
                },
            ],
            ..Default::default()
        };
        let root = settings
            .library_for_path(Path::new("/m/loras/x.safetensors"))
            .unwrap();
        assert_eq!(root.alias, "Loras");
    }
}
