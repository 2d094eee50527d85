use crate::errors::{Error, Result};
use crate::model::Record;
use crate::schema::columns;

/// Checks that `record` carries every declared column of `table`.
///
/// Presence only: values are not type- or range-checked.
pub fn check(table: &str, record: &Record) -> Result<()> {
    let declared = columns(table)
        .ok_or_else(|| Error::Validation(format!("Unknown table '{}'", table)))?;

    let missing: Vec<&str> = declared
        .iter()
        .map(|(name, _)| *name)
        .filter(|name| !record.contains_key(*name))
        .collect();

    if !missing.is_empty() {
        return Err(Error::Validation(format!(
            "Record for '{}' is missing columns: {}",
            table,
            missing.join(", ")
        )));
    }

    Ok(())
}

pub fn validate(table: &str, record: &Record) -> bool {
    check(table, record).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reading() -> Record {
        json!({
            "device_id": "device_001",
            "timestamp": "2024-05-01T12:00:00Z",
            "power_w": 1500.25,
            "energy_wh": 125.02,
            "voltage": 120.1,
            "temp_c": 22.4,
            "occupancy": true,
            "source": "mock_api"
        })
        .as_object()
        .unwrap()
        .clone()
    }

    #[test]
    fn test_valid_reading() {
        assert!(validate("readings", &reading()));
    }

    #[test]
    fn test_missing_voltage() {
        let mut record = reading();
        record.remove("voltage");

        assert!(!validate("readings", &record));
        let err = check("readings", &record).unwrap_err();
        assert!(err.to_string().contains("voltage"));
    }

    #[test]
    fn test_null_value_counts_as_present() {
        let mut record = reading();
        record.insert("temp_c".to_string(), serde_json::Value::Null);

        assert!(validate("readings", &record));
    }

    #[test]
    fn test_extra_columns_allowed() {
        let mut record = reading();
        record.insert("firmware".to_string(), json!("1.2.0"));

        assert!(validate("readings", &record));
    }

    #[test]
    fn test_unknown_table() {
        assert!(!validate("alerts", &reading()));
    }

    #[test]
    fn test_valid_device() {
        let record = json!({
            "device_id": "device_001",
            "name": "Smart Meter 001",
            "location": "Home",
            "installation_date": "2024-05-01T12:00:00Z"
        })
        .as_object()
        .unwrap()
        .clone();

        assert!(validate("devices", &record));
        assert!(!validate("readings", &record));
    }
}
