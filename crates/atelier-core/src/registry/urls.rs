//! Classification of registry URLs.
//!
//! Accepted forms:
//! - Civitai model pages (`/models/{id}`, optionally `?modelVersionId={id}`)
//! - Civitai API and download URLs naming a model or a version
//! - HuggingFace single-file URLs (`/{owner}/{repo}/resolve|blob/{rev}/{path}`)
//!
//! Everything else, including HuggingFace repository roots (which name many
//! files), is rejected with `UnsupportedUrl`.

use crate::config::NetworkConfig;
use crate::error::{AtelierError, Result};
use regex::Regex;
use std::sync::LazyLock;
use url::Url;

static CIVITAI_MODEL_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/(?:api/v1/)?models/(\d+)(?:/|$)").expect("civitai model regex must compile")
});

static CIVITAI_VERSION_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/api/(?:v1/model-versions|download/models)/(\d+)(?:/|$)")
        .expect("civitai version regex must compile")
});

/// A parsed registry URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryUrl {
    CivitaiModel {
        model_id: u64,
        version_id: Option<u64>,
    },
    CivitaiVersion {
        version_id: u64,
    },
    HuggingfaceFile {
        /// `owner/name`
        repo: String,
        revision: String,
        /// Path of the file inside the repository
        file_path: String,
    },
}

impl RegistryUrl {
    /// Parse and classify `raw`.
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw.trim()).map_err(|e| unsupported(raw, format!("malformed URL: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(unsupported(raw, "only http(s) URLs are accepted"));
        }
        let host = url
            .host_str()
            .ok_or_else(|| unsupported(raw, "URL has no host"))?
            .trim_start_matches("www.")
            .to_ascii_lowercase();

        if host == NetworkConfig::CIVITAI_HOST {
            Self::parse_civitai(raw, &url)
        } else if host == NetworkConfig::HUGGINGFACE_HOST || host == "hf.co" {
            Self::parse_huggingface(raw, &url)
        } else {
            Err(unsupported(raw, format!("unknown registry host '{host}'")))
        }
    }

    fn parse_civitai(raw: &str, url: &Url) -> Result<Self> {
        let path = url.path();
        let query_version = url
            .query_pairs()
            .find(|(k, _)| k == "modelVersionId")
            .and_then(|(_, v)| v.parse::<u64>().ok());

        if let Some(caps) = CIVITAI_VERSION_PATH.captures(path) {
            let version_id = parse_id(raw, &caps[1])?;
            return Ok(RegistryUrl::CivitaiVersion { version_id });
        }
        if let Some(caps) = CIVITAI_MODEL_PATH.captures(path) {
            let model_id = parse_id(raw, &caps[1])?;
            return Ok(RegistryUrl::CivitaiModel {
                model_id,
                version_id: query_version,
            });
        }
        Err(unsupported(raw, "not a Civitai model or version URL"))
    }

    fn parse_huggingface(raw: &str, url: &Url) -> Result<Self> {
        let segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|seg| !seg.is_empty()).collect())
            .unwrap_or_default();

        match segments.as_slice() {
            [owner, repo, kind, revision, rest @ ..]
                if (*kind == "resolve" || *kind == "blob") && !rest.is_empty() =>
            {
                Ok(RegistryUrl::HuggingfaceFile {
                    repo: format!("{owner}/{repo}"),
                    revision: revision.to_string(),
                    file_path: rest.join("/"),
                })
            }
            [_, _] | [_, _, "tree", ..] => Err(unsupported(
                raw,
                "repository URLs name multiple files; link a single file instead",
            )),
            _ => Err(unsupported(raw, "not a HuggingFace file URL")),
        }
    }

    /// The URL a file download should be fetched from, when the URL itself
    /// names a file.
    pub fn direct_download_url(&self) -> Option<String> {
        match self {
            RegistryUrl::HuggingfaceFile {
                repo,
                revision,
                file_path,
            } => Some(format!(
                "{}/{}/resolve/{}/{}",
                NetworkConfig::HUGGINGFACE_BASE,
                repo,
                revision,
                file_path
            )),
            RegistryUrl::CivitaiVersion { version_id } => Some(format!(
                "https://{}/api/download/models/{}",
                NetworkConfig::CIVITAI_HOST,
                version_id
            )),
            RegistryUrl::CivitaiModel { .. } => None,
        }
    }
}

fn parse_id(raw: &str, digits: &str) -> Result<u64> {
    digits
        .parse::<u64>()
        .map_err(|_| unsupported(raw, "identifier out of range"))
}

fn unsupported(url: &str, reason: impl Into<String>) -> AtelierError {
    AtelierError::UnsupportedUrl {
        url: url.to_string(),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_civitai_model_page() {
        assert_eq!(
            RegistryUrl::parse("https://civitai.com/models/4201/realistic-vision").unwrap(),
            RegistryUrl::CivitaiModel {
                model_id: 4201,
                version_id: None
            }
        );
        assert_eq!(
            RegistryUrl::parse("https://civitai.com/models/4201?modelVersionId=130072").unwrap(),
            RegistryUrl::CivitaiModel {
                model_id: 4201,
                version_id: Some(130072)
            }
        );
    }

    #[test]
    fn test_civitai_api_urls() {
        assert_eq!(
            RegistryUrl::parse("https://civitai.com/api/v1/models/12").unwrap(),
            RegistryUrl::CivitaiModel {
                model_id: 12,
                version_id: None
            }
        );
        assert_eq!(
            RegistryUrl::parse("https://civitai.com/api/download/models/130072").unwrap(),
            RegistryUrl::CivitaiVersion { version_id: 130072 }
        );
        assert_eq!(
            RegistryUrl::parse("https://www.civitai.com/api/v1/model-versions/77").unwrap(),
            RegistryUrl::CivitaiVersion { version_id: 77 }
        );
    }

    #[test]
    fn test_huggingface_single_file() {
        let parsed = RegistryUrl::parse(
            "https://huggingface.co/stabilityai/sdxl-vae/resolve/main/sdxl_vae.safetensors",
        )
        .unwrap();
        assert_eq!(
            parsed,
            RegistryUrl::HuggingfaceFile {
                repo: "stabilityai/sdxl-vae".into(),
                revision: "main".into(),
                file_path: "sdxl_vae.safetensors".into()
            }
        );
        assert_eq!(
            parsed.direct_download_url().unwrap(),
            "https://huggingface.co/stabilityai/sdxl-vae/resolve/main/sdxl_vae.safetensors"
        );

        let nested = RegistryUrl::parse("https://huggingface.co/o/r/blob/v1/unet/model.bin").unwrap();
        assert!(matches!(
            nested,
            RegistryUrl::HuggingfaceFile { ref file_path, .. } if file_path == "unet/model.bin"
        ));
    }

    #[test]
    fn test_huggingface_repo_root_unsupported() {
        for url in [
            "https://huggingface.co/stabilityai/sdxl-vae",
            "https://huggingface.co/stabilityai/sdxl-vae/tree/main",
        ] {
            assert!(matches!(
                RegistryUrl::parse(url),
                Err(AtelierError::UnsupportedUrl { .. })
            ));
        }
    }

    #[test]
    fn test_malformed_and_unknown_hosts() {
        for url in [
            "not a url",
            "ftp://civitai.com/models/1",
            "https://example.com/models/1",
            "https://civitai.com/user/alice",
        ] {
            assert!(
                matches!(RegistryUrl::parse(url), Err(AtelierError::UnsupportedUrl { .. })),
                "{url} should be unsupported"
            );
        }
    }
}
