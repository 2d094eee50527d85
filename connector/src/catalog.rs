use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use tracing::{info, warn};

use crate::client::ApiClient;
use crate::errors::Result;
use crate::model::DeviceListing;

/// Source of the current device roster. Always a full refresh.
#[async_trait]
pub trait DeviceCatalog: Send + Sync {
    async fn list_devices(&self) -> Result<Vec<DeviceListing>>;
}

#[derive(Debug, Deserialize)]
struct DevicesResponse {
    #[serde(default)]
    devices: Vec<DeviceListing>,
}

/// Roster read from `GET /devices`
#[derive(Debug, Clone)]
pub struct HttpDeviceCatalog {
    client: ApiClient,
}

impl HttpDeviceCatalog {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DeviceCatalog for HttpDeviceCatalog {
    async fn list_devices(&self) -> Result<Vec<DeviceListing>> {
        let response: DevicesResponse = self.client.get_json("/devices", &[]).await?;

        info!("Fetched {} devices", response.devices.len());
        Ok(response.devices)
    }
}

/// Keeps the first listing for each `device_id`.
///
/// Applied by the orchestrator to whatever catalog it is given.
pub fn dedup_roster(listings: Vec<DeviceListing>) -> Vec<DeviceListing> {
    let mut seen = HashSet::with_capacity(listings.len());
    let mut devices = Vec::with_capacity(listings.len());

    for listing in listings {
        if seen.insert(listing.device_id.clone()) {
            devices.push(listing);
        } else {
            warn!("Duplicate device {} in roster, keeping first entry", listing.device_id);
        }
    }

    devices
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(device_id: &str, name: &str) -> DeviceListing {
        DeviceListing {
            device_id: device_id.to_string(),
            name: name.to_string(),
            location: "Home".to_string(),
            installation_date: None,
        }
    }

    #[test]
    fn test_dedup_keeps_first() {
        let roster = dedup_roster(vec![
            listing("device_001", "first"),
            listing("device_002", "other"),
            listing("device_001", "second"),
        ]);

        assert_eq!(roster.len(), 2);
        assert_eq!(roster[0].name, "first");
        assert_eq!(roster[1].device_id, "device_002");
    }

    #[test]
    fn test_devices_response_parses_without_installation_date() {
        let response: DevicesResponse = serde_json::from_str(
            r#"{"devices": [{"device_id": "device_001", "name": "Smart Meter 001", "location": "Home"}]}"#,
        )
        .unwrap();

        assert_eq!(response.devices.len(), 1);
        assert!(response.devices[0].installation_date.is_none());
    }

    #[test]
    fn test_devices_response_missing_key_is_empty() {
        let response: DevicesResponse = serde_json::from_str("{}").unwrap();
        assert!(response.devices.is_empty());
    }
}
