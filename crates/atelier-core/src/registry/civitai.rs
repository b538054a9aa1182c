//! Civitai REST API (v1).
//!
//! A by-hash lookup returns a model-version object; the owning model is then
//! fetched for the model name, creator and description. Page URLs name a
//! model (optionally pinned to a version) and resolve the same way.

use super::types::{Provider, RemoteFile, RemoteMetadata};
use crate::config::NetworkConfig;
use crate::error::{AtelierError, Result};
use crate::network::HttpClient;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

pub(crate) async fn lookup_by_hash(http: &HttpClient, sha256: &str) -> Result<RemoteMetadata> {
    let url = format!(
        "{}/model-versions/by-hash/{}",
        NetworkConfig::CIVITAI_API_BASE,
        sha256.to_lowercase()
    );
    let version: Value = http.get_json(&url).await?;
    let model = fetch_owning_model(http, &version).await?;
    Ok(to_metadata(model.as_ref(), &version))
}

pub(crate) async fn lookup_by_model(
    http: &HttpClient,
    model_id: u64,
    version_id: Option<u64>,
) -> Result<RemoteMetadata> {
    let url = format!("{}/models/{}", NetworkConfig::CIVITAI_API_BASE, model_id);
    let model: Value = http.get_json(&url).await?;
    let version = select_version(&model, version_id).ok_or_else(|| AtelierError::NotFound {
        what: match version_id {
            Some(v) => format!("Civitai model {} version {}", model_id, v),
            None => format!("Civitai model {} has no versions", model_id),
        },
    })?;
    Ok(to_metadata(Some(&model), version))
}

pub(crate) async fn lookup_by_version(http: &HttpClient, version_id: u64) -> Result<RemoteMetadata> {
    let url = format!(
        "{}/model-versions/{}",
        NetworkConfig::CIVITAI_API_BASE,
        version_id
    );
    let version: Value = http.get_json(&url).await?;
    let model = fetch_owning_model(http, &version).await?;
    Ok(to_metadata(model.as_ref(), &version))
}

/// Fetch the model a version belongs to. A deleted model is tolerated;
/// transient failures propagate so the caller's retry policy applies.
async fn fetch_owning_model(http: &HttpClient, version: &Value) -> Result<Option<Value>> {
    let Some(model_id) = id_string(version.get("modelId")) else {
        return Ok(None);
    };
    let url = format!("{}/models/{}", NetworkConfig::CIVITAI_API_BASE, model_id);
    match http.get_json::<Value>(&url).await {
        Ok(model) => Ok(Some(model)),
        Err(e) if e.is_not_found() => {
            warn!("Civitai model {} referenced by a version is gone", model_id);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Pick the requested version, or the newest (first listed) one.
fn select_version(model: &Value, version_id: Option<u64>) -> Option<&Value> {
    let versions = model.get("modelVersions")?.as_array()?;
    match version_id {
        Some(wanted) => versions
            .iter()
            .find(|v| v.get("id").and_then(Value::as_u64) == Some(wanted)),
        None => versions.first(),
    }
}

pub(crate) fn to_metadata(model: Option<&Value>, version: &Value) -> RemoteMetadata {
    let mut meta = RemoteMetadata::new(Provider::Civitai);

    meta.version_id = id_string(version.get("id"));
    meta.model_id = id_string(version.get("modelId"))
        .or_else(|| model.and_then(|m| id_string(m.get("id"))));
    meta.version_name = str_field(version, "name");
    meta.base_model = str_field(version, "baseModel");

    meta.name = model
        .and_then(|m| str_field(m, "name"))
        .or_else(|| version.get("model").and_then(|m| str_field(m, "name")));
    meta.model_type = model
        .and_then(|m| str_field(m, "type"))
        .or_else(|| version.get("model").and_then(|m| str_field(m, "type")));
    meta.creator = model
        .and_then(|m| m.get("creator"))
        .and_then(|c| str_field(c, "username"));

    meta.trigger_words = version
        .get("trainedWords")
        .and_then(Value::as_array)
        .map(|words| {
            words
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|w| !w.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    meta.preview_urls = version
        .get("images")
        .and_then(Value::as_array)
        .map(|images| {
            images
                .iter()
                .filter(|img| img.get("type").and_then(Value::as_str) != Some("video"))
                .filter_map(|img| str_field(img, "url"))
                .collect()
        })
        .unwrap_or_default();

    meta.files = version
        .get("files")
        .and_then(Value::as_array)
        .map(|files| files.iter().filter_map(to_remote_file).collect())
        .unwrap_or_default();

    meta.download_url = str_field(version, "downloadUrl").or_else(|| {
        meta.primary_file()
            .and_then(|f| f.download_url.clone())
    });
    meta.page_url = meta.model_id.as_ref().map(|id| {
        let mut url = format!("https://{}/models/{}", NetworkConfig::CIVITAI_HOST, id);
        if let Some(v) = &meta.version_id {
            url.push_str(&format!("?modelVersionId={}", v));
        }
        url
    });

    let model_description = model.and_then(|m| str_field(m, "description"));
    let version_description = str_field(version, "description");
    meta.description = match (version_description, model_description) {
        (Some(v), Some(m)) => Some(format!("{}\n\n{}", v, m)),
        (v, m) => v.or(m),
    };

    let mut model_raw = model.cloned().unwrap_or(Value::Null);
    if let Some(obj) = model_raw.as_object_mut() {
        // Every version is already summarized by `version`; keep the entry small.
        obj.remove("modelVersions");
    }
    meta.raw = serde_json::json!({ "model": model_raw, "version": version });
    meta.fetched_at = Utc::now();

    debug!(
        "Mapped Civitai version {:?} of model {:?}",
        meta.version_id, meta.model_id
    );
    meta
}

fn to_remote_file(file: &Value) -> Option<RemoteFile> {
    let name = str_field(file, "name")?;
    let size_bytes = file
        .get("sizeKB")
        .and_then(Value::as_f64)
        .map(|kb| (kb * 1024.0).round() as u64);
    let sha256 = file
        .get("hashes")
        .and_then(|h| h.get("SHA256"))
        .and_then(Value::as_str)
        .map(str::to_lowercase);
    Some(RemoteFile {
        name,
        size_bytes,
        sha256,
        download_url: str_field(file, "downloadUrl"),
        primary: file.get("primary").and_then(Value::as_bool).unwrap_or(false),
    })
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn id_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_version() -> Value {
        json!({
            "id": 130072,
            "modelId": 4201,
            "name": "v5.1",
            "baseModel": "SD 1.5",
            "trainedWords": ["analog style", " "],
            "description": "<p>version notes</p>",
            "downloadUrl": "https://civitai.com/api/download/models/130072",
            "images": [
                {"url": "https://image.civitai.com/a.jpeg", "type": "image"},
                {"url": "https://image.civitai.com/b.mp4", "type": "video"}
            ],
            "files": [
                {"name": "config.yaml", "sizeKB": 1.5, "primary": false},
                {
                    "name": "realisticVision_v51.safetensors",
                    "sizeKB": 2082642.5,
                    "primary": true,
                    "hashes": {"SHA256": "ABCDEF"},
                    "downloadUrl": "https://civitai.com/api/download/models/130072"
                }
            ],
            "futureField": {"kept": true}
        })
    }

    fn sample_model() -> Value {
        json!({
            "id": 4201,
            "name": "Realistic Vision",
            "type": "Checkpoint",
            "description": "<p>model card</p>",
            "creator": {"username": "SG_161222"},
            "modelVersions": [sample_version(), {"id": 1, "name": "v1"}]
        })
    }

    #[test]
    fn test_to_metadata_with_model() {
        let model = sample_model();
        let meta = to_metadata(Some(&model), &sample_version());

        assert_eq!(meta.provider, Provider::Civitai);
        assert_eq!(meta.model_id.as_deref(), Some("4201"));
        assert_eq!(meta.version_id.as_deref(), Some("130072"));
        assert_eq!(meta.name.as_deref(), Some("Realistic Vision"));
        assert_eq!(meta.creator.as_deref(), Some("SG_161222"));
        assert_eq!(meta.model_type.as_deref(), Some("Checkpoint"));
        assert_eq!(meta.trigger_words, vec!["analog style"]);
        assert_eq!(meta.preview_urls, vec!["https://image.civitai.com/a.jpeg"]);
        assert_eq!(
            meta.page_url.as_deref(),
            Some("https://civitai.com/models/4201?modelVersionId=130072")
        );

        let primary = meta.primary_file().unwrap();
        assert_eq!(primary.name, "realisticVision_v51.safetensors");
        assert_eq!(primary.sha256.as_deref(), Some("abcdef"));
        assert_eq!(primary.size_bytes, Some(2_132_625_920));

        assert!(meta.description.unwrap().contains("model card"));
        assert_eq!(meta.raw["version"]["futureField"]["kept"], true);
        assert!(meta.raw["model"].get("modelVersions").is_none());
    }

    #[test]
    fn test_to_metadata_version_only() {
        let meta = to_metadata(None, &sample_version());
        assert_eq!(meta.model_id.as_deref(), Some("4201"));
        assert_eq!(meta.name, None);
        assert_eq!(meta.creator, None);
        assert_eq!(
            meta.download_url.as_deref(),
            Some("https://civitai.com/api/download/models/130072")
        );
    }

    #[test]
    fn test_select_version() {
        let model = sample_model();
        assert_eq!(
            select_version(&model, Some(1)).unwrap()["name"],
            "v1"
        );
        assert_eq!(
            select_version(&model, None).unwrap()["id"],
            130072
        );
        assert!(select_version(&model, Some(999)).is_none());
    }
}
