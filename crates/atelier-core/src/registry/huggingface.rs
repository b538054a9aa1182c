//! HuggingFace Hub model API.
//!
//! Only single-file URLs resolve: the repository listing is fetched at the
//! requested revision and the sibling matching the URL's path becomes the
//! primary file.

use super::types::{Provider, RemoteFile, RemoteMetadata};
use crate::config::NetworkConfig;
use crate::error::{AtelierError, Result};
use crate::network::HttpClient;
use chrono::Utc;
use serde_json::Value;

const PREVIEW_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "gif"];

pub(crate) async fn lookup_file(
    http: &HttpClient,
    repo: &str,
    revision: &str,
    file_path: &str,
) -> Result<RemoteMetadata> {
    let url = format!(
        "{}/api/models/{}/revision/{}?blobs=true",
        NetworkConfig::HUGGINGFACE_BASE,
        repo,
        urlencoding::encode(revision)
    );
    let info: Value = http.get_json(&url).await?;
    to_metadata(&info, repo, revision, file_path)
}

pub(crate) fn to_metadata(
    info: &Value,
    repo: &str,
    revision: &str,
    file_path: &str,
) -> Result<RemoteMetadata> {
    let siblings = info
        .get("siblings")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let target = siblings
        .iter()
        .find(|s| s.get("rfilename").and_then(Value::as_str) == Some(file_path))
        .ok_or_else(|| AtelierError::NotFound {
            what: format!("{} in {}@{}", file_path, repo, revision),
        })?;

    let resolve_url = |name: &str| {
        format!(
            "{}/{}/resolve/{}/{}",
            NetworkConfig::HUGGINGFACE_BASE,
            repo,
            revision,
            name
        )
    };

    let size_bytes = target
        .get("lfs")
        .and_then(|l| l.get("size"))
        .or_else(|| target.get("size"))
        .and_then(Value::as_u64);
    let sha256 = target
        .get("lfs")
        .and_then(|l| l.get("sha256"))
        .and_then(Value::as_str)
        .map(str::to_lowercase);

    let mut meta = RemoteMetadata::new(Provider::Huggingface);
    meta.model_id = Some(
        info.get("id")
            .and_then(Value::as_str)
            .unwrap_or(repo)
            .to_string(),
    );
    meta.version_id = info
        .get("sha")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| Some(revision.to_string()));
    meta.version_name = Some(revision.to_string());
    meta.name = Some(
        file_path
            .rsplit('/')
            .next()
            .unwrap_or(file_path)
            .to_string(),
    );
    meta.creator = info
        .get("author")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| repo.split('/').next().map(str::to_string));
    meta.base_model = base_model(info);
    meta.model_type = info
        .get("pipeline_tag")
        .and_then(Value::as_str)
        .map(str::to_string);
    meta.page_url = Some(format!("{}/{}", NetworkConfig::HUGGINGFACE_BASE, repo));
    meta.download_url = Some(resolve_url(file_path));
    meta.preview_urls = siblings
        .iter()
        .filter_map(|s| s.get("rfilename").and_then(Value::as_str))
        .filter(|name| is_preview(name))
        .map(|name| resolve_url(name))
        .collect();
    meta.files = vec![RemoteFile {
        name: file_path.to_string(),
        size_bytes,
        sha256,
        download_url: meta.download_url.clone(),
        primary: true,
    }];
    meta.raw = info.clone();
    meta.fetched_at = Utc::now();
    Ok(meta)
}

/// `cardData.base_model` is either a string or a list of strings.
fn base_model(info: &Value) -> Option<String> {
    match info.get("cardData")?.get("base_model")? {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => items.iter().find_map(Value::as_str).map(str::to_string),
        _ => None,
    }
}

fn is_preview(name: &str) -> bool {
    name.rsplit_once('.')
        .map(|(_, ext)| PREVIEW_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}
