use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::client::ApiClient;
use crate::errors::Result;
use crate::metrics::MALFORMED_READINGS_TOTAL;
use crate::model::{format_timestamp, to_record, FetchWindow, Reading, Record};

/// One device's readings for one window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceReadings {
    pub records: Vec<Record>,
    /// Items dropped before validation because they were not JSON objects.
    pub malformed: usize,
}

impl From<Vec<Record>> for DeviceReadings {
    fn from(records: Vec<Record>) -> Self {
        Self {
            records,
            malformed: 0,
        }
    }
}

/// Retrieves the telemetry of one device within one window.
#[async_trait]
pub trait ReadingFetcher: Send + Sync {
    async fn fetch_readings(&self, device_id: &str, window: &FetchWindow) -> Result<DeviceReadings>;
}

#[derive(Debug, Deserialize)]
struct ReadingsResponse {
    #[serde(default)]
    data: Vec<Value>,
}

/// Readings read from `GET /readings`
#[derive(Debug, Clone)]
pub struct HttpReadingFetcher {
    client: ApiClient,
}

impl HttpReadingFetcher {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ReadingFetcher for HttpReadingFetcher {
    async fn fetch_readings(&self, device_id: &str, window: &FetchWindow) -> Result<DeviceReadings> {
        let query = [
            ("device_id", device_id.to_string()),
            ("start", format_timestamp(window.start)),
            ("end", format_timestamp(window.end)),
        ];
        let response: ReadingsResponse = self.client.get_json("/readings", &query).await?;

        let readings = collect_readings(response.data);

        if readings.malformed > 0 {
            warn!(
                "Dropped {} malformed readings for device {}",
                readings.malformed, device_id
            );
            MALFORMED_READINGS_TOTAL.inc_by(readings.malformed as f64);
        }

        info!("Fetched {} readings for device {}", readings.records.len(), device_id);
        Ok(readings)
    }
}

/// Normalizes every item of a `data` array, counting the ones dropped.
pub fn collect_readings(items: Vec<Value>) -> DeviceReadings {
    let total = items.len();
    let records: Vec<Record> = items.into_iter().filter_map(normalize_reading).collect();

    DeviceReadings {
        malformed: total - records.len(),
        records,
    }
}

/// Brings one upstream item into canonical record form.
///
/// Items matching the typed [`Reading`] shape are re-serialized from it.
/// Other JSON objects pass through untouched and are left to schema
/// validation. Anything that is not an object yields `None`.
pub fn normalize_reading(item: Value) -> Option<Record> {
    let Value::Object(raw) = item else {
        return None;
    };

    match serde_json::from_value::<Reading>(Value::Object(raw.clone())) {
        Ok(reading) => to_record(&reading).ok().or(Some(raw)),
        Err(_) => Some(raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_typed_reading_is_canonicalized() {
        let record = normalize_reading(json!({
            "device_id": "device_001",
            "timestamp": "2024-05-01T12:00:00+02:00",
            "power_w": 1500,
            "energy_wh": 125.0,
            "voltage": 120.1,
            "temp_c": 22.4,
            "occupancy": true,
            "source": "mock_api"
        }))
        .unwrap();

        assert_eq!(record["timestamp"], "2024-05-01T10:00:00Z");
        assert_eq!(record["power_w"], json!(1500.0));
    }

    #[test]
    fn test_partial_object_passes_through() {
        let item = json!({
            "device_id": "device_001",
            "timestamp": "2024-05-01T12:00:00Z",
            "power_w": 1500.0
        });

        let record = normalize_reading(item.clone()).unwrap();
        assert_eq!(Value::Object(record), item);
    }

    #[test]
    fn test_non_object_dropped() {
        assert!(normalize_reading(json!("device_001")).is_none());
        assert!(normalize_reading(json!(null)).is_none());
        assert!(normalize_reading(json!([1, 2, 3])).is_none());
    }

    #[test]
    fn test_collect_counts_malformed_items() {
        let readings = collect_readings(vec![
            json!({ "device_id": "device_001", "timestamp": "2024-05-01T12:00:00Z" }),
            json!("not a reading"),
            json!(42),
        ]);

        assert_eq!(readings.records.len(), 1);
        assert_eq!(readings.malformed, 2);
    }

    #[test]
    fn test_response_without_data_is_empty() {
        let response: ReadingsResponse =
            serde_json::from_str(r#"{"device_id": "device_001", "count": 0}"#).unwrap();
        assert!(response.data.is_empty());
    }
}
