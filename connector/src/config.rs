use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::errors::{Error, Result};

pub const DEFAULT_API_KEY: &str = "demo-key";
pub const DEFAULT_API_URL: &str = "http://localhost:5000";
/// Upper bound on the first-sync lookback, one century.
pub const MAX_BOOTSTRAP_DAYS: i64 = 36_500;

/// Connector configuration, as handed over by the orchestration host.
///
/// Every key is optional; missing keys fall back to the defaults below.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    pub api_key: String,
    pub api_url: String,
    pub max_concurrency: usize,
    pub request_timeout_secs: u64,
    pub sync_timeout_secs: Option<u64>,
    pub max_retries: u32,
    pub bootstrap_days: i64,
    pub hold_watermark_on_catalog_failure: bool,
    /// Consecutive syncs a device may be missing from the roster before its
    /// remembered installation date is dropped from the watermark.
    pub forget_absent_devices_after: u32,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            api_key: DEFAULT_API_KEY.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            max_concurrency: 4,
            request_timeout_secs: 30,
            sync_timeout_secs: None,
            max_retries: 3,
            bootstrap_days: 7,
            hold_watermark_on_catalog_failure: true,
            forget_absent_devices_after: 30,
        }
    }
}

impl ConnectorConfig {
    pub fn from_value(configuration: serde_json::Value) -> Result<Self> {
        let config: ConnectorConfig = serde_json::from_value(configuration)?;
        config.normalized()
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: ConnectorConfig = serde_json::from_str(&raw)?;
        config.normalized()
    }

    /// Strips trailing slashes from the base URL and rejects unusable values.
    pub fn normalized(mut self) -> Result<Self> {
        self.api_url = self.api_url.trim().trim_end_matches('/').to_string();

        if self.api_url.is_empty() {
            return Err(Error::Config("api_url cannot be empty".to_string()));
        }
        if self.max_concurrency == 0 {
            return Err(Error::Config("max_concurrency must be at least 1".to_string()));
        }
        if self.request_timeout_secs == 0 {
            return Err(Error::Config(
                "request_timeout_secs must be at least 1".to_string(),
            ));
        }
        if !(0..=MAX_BOOTSTRAP_DAYS).contains(&self.bootstrap_days) {
            return Err(Error::Config(format!(
                "bootstrap_days must be between 0 and {} (got {})",
                MAX_BOOTSTRAP_DAYS, self.bootstrap_days
            )));
        }

        Ok(self)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn sync_timeout(&self) -> Option<Duration> {
        self.sync_timeout_secs.map(Duration::from_secs)
    }

    pub fn bootstrap_lookback(&self) -> chrono::Duration {
        chrono::Duration::try_days(self.bootstrap_days).unwrap_or(chrono::Duration::MAX)
    }
}
