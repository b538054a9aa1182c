//! HTTP client for registry traffic.
//!
//! Wraps reqwest with:
//! - A request-rate limiter shared by every call (governor)
//! - Per-host bearer credentials that never reach the logs
//! - Status mapping onto the crate's error taxonomy

use crate::config::{AppConfig, NetworkConfig};
use crate::error::{AtelierError, Result};
use crate::settings::Credentials;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::debug;

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// HTTP client used by the registry and download paths.
pub struct HttpClient {
    client: Client,
    limiter: DirectRateLimiter,
    credentials: Credentials,
    request_timeout: Duration,
}

impl HttpClient {
    /// Create a client with default limits and the given credentials.
    pub fn new(credentials: Credentials) -> Result<Self> {
        Self::with_rate(credentials, NetworkConfig::REGISTRY_REQUESTS_PER_SECOND)
    }

    /// Create a client allowing `per_second` requests per second.
    pub fn with_rate(credentials: Credentials, per_second: u32) -> Result<Self> {
        // No overall timeout on the client: downloads may legitimately run
        // for a long time. API calls set a per-request timeout instead.
        let client = Client::builder()
            .connect_timeout(NetworkConfig::CONNECT_TIMEOUT)
            .user_agent(AppConfig::USER_AGENT)
            .build()
            .map_err(|e| AtelierError::Network {
                message: format!("Failed to create HTTP client: {}", e),
                status: None,
            })?;

        let per_second = NonZeroU32::new(per_second).unwrap_or(NonZeroU32::MIN);
        Ok(Self {
            client,
            limiter: RateLimiter::direct(Quota::per_second(per_second)),
            credentials,
            request_timeout: NetworkConfig::REQUEST_TIMEOUT,
        })
    }

    /// GET `url` and decode the JSON body.
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let request = self.request(url).timeout(self.request_timeout);
        let response = self.send(request, url, Self::lookup_status_error).await?;
        response.json::<T>().await.map_err(|e| AtelierError::Json {
            message: format!("Invalid JSON from {}: {}", url, e),
            source: None,
        })
    }

    /// GET `url` for streaming; the body is not subject to the API timeout.
    ///
    /// A missing file is a failed transfer, not a registry miss, so every
    /// status keeps its code here.
    pub async fn get_stream(&self, url: &str) -> Result<Response> {
        self.send(self.request(url), url, Self::status_error).await
    }

    /// Map an HTTP status onto the crate's error taxonomy. The status is
    /// kept so [`AtelierError::is_retryable`] can classify it.
    pub fn status_error(status: StatusCode, url: &str) -> AtelierError {
        AtelierError::Network {
            message: format!("GET {} returned {}", url, status),
            status: Some(status.as_u16()),
        }
    }

    /// Status mapping for registry lookups, where 404 is the authoritative
    /// "no match".
    pub fn lookup_status_error(status: StatusCode, url: &str) -> AtelierError {
        if status == StatusCode::NOT_FOUND {
            AtelierError::NotFound {
                what: url.to_string(),
            }
        } else {
            Self::status_error(status, url)
        }
    }

    fn request(&self, url: &str) -> RequestBuilder {
        let mut request = self.client.get(url);
        if let Some(token) = self.token_for(url) {
            request = request.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        request
    }

    async fn send(
        &self,
        request: RequestBuilder,
        url: &str,
        on_status: fn(StatusCode, &str) -> AtelierError,
    ) -> Result<Response> {
        self.limiter.until_ready().await;
        debug!("GET {}", redact_query(url));

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                AtelierError::Timeout(self.request_timeout)
            } else {
                AtelierError::Network {
                    message: format!("GET {} failed: {}", redact_query(url), e),
                    status: None,
                }
            }
        })?;

        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(on_status(status, &redact_query(url)))
        }
    }

    /// The credential to present to `url`'s host, if any.
    fn token_for(&self, url: &str) -> Option<&str> {
        let host = url::Url::parse(url)
            .ok()?
            .host_str()?
            .trim_start_matches("www.")
            .to_ascii_lowercase();
        if host == NetworkConfig::CIVITAI_HOST {
            self.credentials.civitai_api_key.as_deref()
        } else if host == NetworkConfig::HUGGINGFACE_HOST || host == "hf.co" {
            self.credentials.huggingface_token.as_deref()
        } else {
            None
        }
    }
}

/// Strip the query string so signed URLs and tokens never reach the logs.
pub fn redact_query(url: &str) -> String {
    match url.split_once('?') {
        Some((base, _)) => format!("{}?…", base),
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn client() -> HttpClient {
        HttpClient::new(Credentials {
            civitai_api_key: Some("civ".into()),
            huggingface_token: Some("hf".into()),
        })
        .unwrap()
    }

    #[test]
    fn test_token_routing_by_host() {
        let http = client();
        assert_eq!(http.token_for("https://civitai.com/api/v1/models/1"), Some("civ"));
        assert_eq!(http.token_for("https://www.civitai.com/x"), Some("civ"));
        assert_eq!(http.token_for("https://huggingface.co/a/b/resolve/main/f"), Some("hf"));
        assert_eq!(http.token_for("https://cdn.example.com/image.png"), None);
        assert_eq!(http.token_for("garbage"), None);
    }

    /// Answer every request on a loopback port with `status_line` and an
    /// empty body.
    async fn serve_status(status_line: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 2048];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                    status_line
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{}/files/model.safetensors", addr)
    }

    #[test]
    fn test_status_error_mapping() {
        assert!(HttpClient::lookup_status_error(StatusCode::NOT_FOUND, "u").is_not_found());
        assert!(!HttpClient::status_error(StatusCode::NOT_FOUND, "u").is_not_found());
        assert!(!HttpClient::status_error(StatusCode::NOT_FOUND, "u").is_retryable());
        assert!(HttpClient::lookup_status_error(StatusCode::BAD_GATEWAY, "u").is_retryable());
        assert!(HttpClient::status_error(StatusCode::BAD_GATEWAY, "u").is_retryable());
        assert!(HttpClient::status_error(StatusCode::TOO_MANY_REQUESTS, "u").is_retryable());
        let forbidden = HttpClient::status_error(StatusCode::FORBIDDEN, "u");
        assert!(!forbidden.is_retryable());
        assert!(!forbidden.is_not_found());
    }

    #[tokio::test]
    async fn test_missing_download_is_not_a_registry_miss() {
        let url = serve_status("404 Not Found").await;
        let http = client();

        let err = http.get_stream(&url).await.unwrap_err();
        assert!(matches!(err, AtelierError::Network { status: Some(404), .. }));
        assert!(!err.is_retryable());

        let err = http.get_json::<serde_json::Value>(&url).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_redact_query() {
        assert_eq!(
            redact_query("https://x/y?token=secret"),
            "https://x/y?…"
        );
        assert_eq!(redact_query("https://x/y"), "https://x/y");
    }
}
