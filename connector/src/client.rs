use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::ConnectorConfig;
use crate::errors::{Error, Result};
use crate::metrics::HTTP_RETRIES_TOTAL;

const INITIAL_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 2000;
const MAX_ERROR_BODY_CHARS: usize = 200;

/// Gate run before every sync.
#[async_trait]
pub trait ConnectionProbe: Send + Sync {
    async fn test_connection(&self) -> bool;

    /// Where the probe points, for error reporting.
    fn endpoint(&self) -> String;
}

/// Authenticated handle on the smart meter API.
///
/// Built once from the configuration and cloned into every component that
/// talks to the upstream. Headers and base URL never change after
/// construction, so clones can be used from concurrent tasks.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    max_retries: u32,
}

impl ApiClient {
    pub fn new(config: &ConnectorConfig) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        let bearer = header::HeaderValue::from_str(&format!("Bearer {}", config.api_key))
            .map_err(|e| Error::Config(format!("Invalid api_key: {}", e)))?;
        headers.insert(header::AUTHORIZATION, bearer);
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let http = Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            http,
            base_url: config.api_url.clone(),
            max_retries: config.max_retries,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// GETs `path` and decodes the JSON body, retrying transient failures
    /// with exponential backoff.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let mut attempt = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            attempt += 1;

            match self.get_json_once(path, query).await {
                Ok(value) => {
                    if attempt > 1 {
                        info!("GET {} succeeded on attempt {}", path, attempt);
                    }
                    return Ok(value);
                }
                Err(e) => {
                    if attempt > self.max_retries || !is_retryable_error(&e) {
                        return Err(e);
                    }

                    warn!(
                        "GET {} failed (attempt {}/{}): {}. Retrying in {}ms...",
                        path,
                        attempt,
                        self.max_retries + 1,
                        e,
                        backoff_ms
                    );
                    HTTP_RETRIES_TOTAL.inc();

                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = next_backoff(backoff_ms);
                }
            }
        }
    }

    async fn get_json_once<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let response = self.http.get(self.url(path)).query(query).send().await?;
        let status = response.status();
        let body = response.bytes().await?;

        debug!("GET {} -> {} ({} bytes)", path, status, body.len());

        if !status.is_success() {
            return Err(Error::Upstream {
                status: status.as_u16(),
                message: upstream_message(&body),
            });
        }

        Ok(serde_json::from_slice(&body)?)
    }
}

#[async_trait]
impl ConnectionProbe for ApiClient {
    async fn test_connection(&self) -> bool {
        match self.http.get(self.url("/health")).send().await {
            Ok(response) if response.status() == StatusCode::OK => true,
            Ok(response) => {
                error!(
                    "Connection test failed: {} returned {}",
                    self.url("/health"),
                    response.status()
                );
                false
            }
            Err(e) => {
                error!("Connection test failed: {}", e);
                false
            }
        }
    }

    fn endpoint(&self) -> String {
        self.base_url.clone()
    }
}

/// Pulls the `error` field out of an upstream error body, falling back to
/// the raw text.
fn upstream_message(body: &[u8]) -> String {
    #[derive(serde::Deserialize)]
    struct ErrorBody {
        error: String,
    }

    if let Ok(parsed) = serde_json::from_slice::<ErrorBody>(body) {
        return parsed.error;
    }

    String::from_utf8_lossy(body)
        .chars()
        .take(MAX_ERROR_BODY_CHARS)
        .collect()
}

fn next_backoff(backoff_ms: u64) -> u64 {
    (backoff_ms * 2).min(MAX_BACKOFF_MS)
}

/// Determine if an error is worth another attempt
fn is_retryable_error(error: &Error) -> bool {
    match error {
        // Retryable errors
        Error::Http(e) => e.is_timeout() || e.is_connect() || e.is_request() || e.is_body(),
        Error::Upstream { status, .. } => *status >= 500 || *status == 429,

        // Non-retryable errors
        Error::Connectivity { .. } => false,
        Error::Validation(_) => false,
        Error::Json(_) => false, // A malformed body stays malformed
        Error::Config(_) => false,
        Error::Io(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(is_retryable_error(&Error::Upstream {
            status: 503,
            message: "unavailable".to_string()
        }));
        assert!(is_retryable_error(&Error::Upstream {
            status: 429,
            message: "slow down".to_string()
        }));
        assert!(!is_retryable_error(&Error::Upstream {
            status: 400,
            message: "Invalid device_id".to_string()
        }));
        assert!(!is_retryable_error(&Error::Validation("test".to_string())));
    }

    #[test]
    fn test_backoff_is_capped() {
        assert_eq!(next_backoff(100), 200);
        assert_eq!(next_backoff(1500), 2000);
        assert_eq!(next_backoff(2000), 2000);
    }

    #[test]
    fn test_upstream_message_reads_error_field() {
        assert_eq!(upstream_message(br#"{"error": "Invalid device_id"}"#), "Invalid device_id");
        assert_eq!(upstream_message(b"Bad Gateway"), "Bad Gateway");
    }

    #[test]
    fn test_invalid_api_key_rejected() {
        let config = ConnectorConfig {
            api_key: "line\nbreak".to_string(),
            ..ConnectorConfig::default()
        };
        assert!(matches!(ApiClient::new(&config), Err(Error::Config(_))));
    }

    #[test]
    fn test_urls_join_base_and_path() {
        let config = ConnectorConfig::default();
        let client = ApiClient::new(&config).unwrap();
        assert_eq!(client.url("/devices"), "http://localhost:5000/devices");
        assert_eq!(client.endpoint(), "http://localhost:5000");
    }

    #[tokio::test]
    async fn test_unreachable_host_fails_connection_test() {
        let config = ConnectorConfig {
            api_url: "http://127.0.0.1:1".to_string(),
            request_timeout_secs: 2,
            ..ConnectorConfig::default()
        };
        let client = ApiClient::new(&config).unwrap();
        assert!(!client.test_connection().await);
    }
}
