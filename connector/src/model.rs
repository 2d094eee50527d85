use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::{Error, Result};

/// A single emitted row, keyed by column name.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Smart meter as emitted to the `devices` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub device_id: String,
    pub name: String,
    pub location: String,
    pub installation_date: DateTime<Utc>,
}

/// Roster entry as returned by `GET /devices`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeviceListing {
    pub device_id: String,
    pub name: String,
    pub location: String,
    #[serde(default)]
    pub installation_date: Option<DateTime<Utc>>,
}

impl DeviceListing {
    /// Resolves the installation date: the upstream value wins, then the date
    /// remembered from an earlier sync, then the time of this first sighting.
    pub fn into_device(self, remembered: Option<DateTime<Utc>>, observed_at: DateTime<Utc>) -> Device {
        let installation_date = self
            .installation_date
            .or(remembered)
            .unwrap_or(observed_at);

        Device {
            device_id: self.device_id,
            name: self.name,
            location: self.location,
            installation_date,
        }
    }
}

/// Telemetry point for one device at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub power_w: f64,
    pub energy_wh: f64,
    pub voltage: f64,
    pub temp_c: f64,
    pub occupancy: bool,
    pub source: String,
}

/// Persisted sync cursor, handed in and out of every sync by the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncWatermark {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_devices: usize,
    #[serde(default)]
    pub total_readings: usize,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub installation_dates: BTreeMap<String, DateTime<Utc>>,
    /// Consecutive syncs each remembered device has been missing from the roster.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub absent_syncs: BTreeMap<String, u32>,
}

/// Time range requested from the upstream. Both endpoints are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FetchWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl FetchWindow {
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts <= self.end
    }

    pub fn duration(&self) -> chrono::Duration {
        self.end - self.start
    }
}

/// ISO-8601 UTC with a `Z` suffix, as the upstream query parameters expect.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Serializes a typed row into a [`Record`].
pub fn to_record<T: Serialize>(value: &T) -> Result<Record> {
    match serde_json::to_value(value)? {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(Error::Validation(format!(
            "expected a JSON object, got {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn listing(installation_date: Option<DateTime<Utc>>) -> DeviceListing {
        DeviceListing {
            device_id: "device_001".to_string(),
            name: "Smart Meter 001".to_string(),
            location: "Home".to_string(),
            installation_date,
        }
    }

    #[test]
    fn test_installation_date_prefers_upstream() {
        let upstream = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        let remembered = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let device = listing(Some(upstream)).into_device(Some(remembered), Utc::now());
        assert_eq!(device.installation_date, upstream);
    }

    #[test]
    fn test_installation_date_falls_back_to_remembered() {
        let remembered = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let device = listing(None).into_device(Some(remembered), Utc::now());
        assert_eq!(device.installation_date, remembered);
    }

    #[test]
    fn test_installation_date_first_sighting() {
        let now = Utc::now();
        let device = listing(None).into_device(None, now);
        assert_eq!(device.installation_date, now);
    }

    #[test]
    fn test_empty_state_deserializes_to_default() {
        let state: SyncWatermark = serde_json::from_str("{}").unwrap();
        assert_eq!(state, SyncWatermark::default());
        assert!(state.last_sync_timestamp.is_none());
    }

    #[test]
    fn test_state_without_dates_serializes_compactly() {
        let state = SyncWatermark {
            last_sync_timestamp: Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()),
            total_devices: 3,
            total_readings: 15,
            installation_dates: BTreeMap::new(),
            absent_syncs: BTreeMap::new(),
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["last_sync_timestamp"], "2024-05-01T12:00:00Z");
        assert_eq!(json["total_readings"], 15);
        assert!(json.get("installation_dates").is_none());
        assert!(json.get("absent_syncs").is_none());
    }

    #[test]
    fn test_window_contains_both_endpoints() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let window = FetchWindow {
            start,
            end: start + Duration::hours(1),
        };
        assert!(window.contains(start));
        assert!(window.contains(window.end));
        assert!(!window.contains(window.end + Duration::seconds(1)));
        assert_eq!(window.duration(), Duration::hours(1));
    }

    #[test]
    fn test_format_timestamp_uses_z_suffix() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap();
        assert_eq!(format_timestamp(ts), "2024-05-01T08:30:00.000000Z");
    }
}
