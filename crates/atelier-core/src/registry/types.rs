//! Registry response types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Which registry produced a metadata record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Civitai,
    Huggingface,
    /// Any other source, e.g. a test double or a future registry
    Other,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Civitai => "civitai",
            Provider::Huggingface => "huggingface",
            Provider::Other => "other",
        }
    }
}

/// One downloadable file of a remote model version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    /// SHA256 as lowercase hex, when the registry publishes it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(default)]
    pub primary: bool,
}

/// Provider-tagged metadata for a remote model version.
///
/// The typed fields are the ones the core acts on. `raw` keeps the registry
/// response verbatim so fields added upstream survive without a schema change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteMetadata {
    pub provider: Provider,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_model: Option<String>,
    /// Registry type name, e.g. `LORA` or `Checkpoint`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_type: Option<String>,
    #[serde(default)]
    pub trigger_words: Vec<String>,
    #[serde(default)]
    pub preview_urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(default)]
    pub files: Vec<RemoteFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub fetched_at: DateTime<Utc>,
    #[serde(default)]
    pub raw: serde_json::Value,
}

/// What `lookup_by_hash` / `lookup_by_url` return on success.
pub type MetadataResult = RemoteMetadata;

impl RemoteMetadata {
    /// An empty record for `provider`, stamped now.
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            model_id: None,
            version_id: None,
            name: None,
            version_name: None,
            creator: None,
            base_model: None,
            model_type: None,
            trigger_words: Vec::new(),
            preview_urls: Vec::new(),
            page_url: None,
            download_url: None,
            files: Vec::new(),
            description: None,
            fetched_at: Utc::now(),
            raw: serde_json::Value::Null,
        }
    }

    /// The file a download should fetch: the one flagged primary, else the first.
    pub fn primary_file(&self) -> Option<&RemoteFile> {
        self.files
            .iter()
            .find(|f| f.primary)
            .or_else(|| self.files.first())
    }

    /// Markdown summary used to seed an asset's notes after a match.
    pub fn summary_markdown(&self) -> String {
        let mut sections = Vec::new();
        sections.push(format!(
            "# {}",
            self.name.as_deref().unwrap_or("Unknown model")
        ));
        if let Some(url) = &self.page_url {
            sections.push(format!("**Link:**\n[{url}]({url})"));
        }
        if let Some(version) = &self.version_name {
            sections.push(format!("**Version:**\n{version}"));
        }
        sections.push(format!(
            "**Creator:**\n{}",
            self.creator.as_deref().unwrap_or("Unknown")
        ));
        if let Some(base) = &self.base_model {
            sections.push(format!("**Base Model:**\n{base}"));
        }
        let triggers = if self.trigger_words.is_empty() {
            "None".to_string()
        } else {
            self.trigger_words.join(", ")
        };
        sections.push(format!("**Trigger Words:**\n`{triggers}`"));
        if let Some(description) = self.description.as_deref().filter(|d| !d.trim().is_empty()) {
            sections.push("---".to_string());
            sections.push(format!("## Description\n\n{}", description.trim()));
        }
        sections.join("\n\n")
    }
}

/// Progress of a byte transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub bytes_downloaded: u64,
    pub total_bytes: Option<u64>,
}

impl TransferProgress {
    /// Completion as a percentage (0-100), if the total is known.
    pub fn percent(&self) -> Option<f32> {
        self.total_bytes.map(|total| {
            if total == 0 {
                100.0
            } else {
                (self.bytes_downloaded as f64 / total as f64 * 100.0).min(100.0) as f32
            }
        })
    }
}

/// Result of a completed transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileResult {
    pub path: PathBuf,
    pub bytes_written: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_file_prefers_flag() {
        let mut meta = RemoteMetadata::new(Provider::Civitai);
        meta.files = vec![
            RemoteFile {
                name: "a.yaml".into(),
                size_bytes: None,
                sha256: None,
                download_url: None,
                primary: false,
            },
            RemoteFile {
                name: "b.safetensors".into(),
                size_bytes: Some(10),
                sha256: None,
                download_url: None,
                primary: true,
            },
        ];
        assert_eq!(meta.primary_file().unwrap().name, "b.safetensors");
    }

    #[test]
    fn test_summary_markdown() {
        let mut meta = RemoteMetadata::new(Provider::Civitai);
        meta.name = Some("Cool LoRA".into());
        meta.creator = Some("alice".into());
        meta.trigger_words = vec!["cool style".into(), "glow".into()];
        meta.page_url = Some("https://civitai.com/models/1".into());

        let md = meta.summary_markdown();
        assert!(md.starts_with("# Cool LoRA"));
        assert!(md.contains("**Creator:**\nalice"));
        assert!(md.contains("`cool style, glow`"));
        assert!(md.contains("[https://civitai.com/models/1](https://civitai.com/models/1)"));
    }

    #[test]
    fn test_metadata_roundtrip_keeps_raw() {
        let mut meta = RemoteMetadata::new(Provider::Huggingface);
        meta.raw = serde_json::json!({"futureField": {"nested": [1, 2]}});
        let json = serde_json::to_string(&meta).unwrap();
        let back: RemoteMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back.raw["futureField"]["nested"][1], 2);
        assert_eq!(back.provider, Provider::Huggingface);
    }

    #[test]
    fn test_transfer_percent() {
        let p = TransferProgress {
            bytes_downloaded: 50,
            total_bytes: Some(200),
        };
        assert_eq!(p.percent(), Some(25.0));
        let unknown = TransferProgress {
            bytes_downloaded: 50,
            total_bytes: None,
        };
        assert_eq!(unknown.percent(), None);
    }
}
