//! Column contract for the tables this connector emits.

use serde::Serialize;
use std::collections::BTreeMap;

pub const DEVICES_TABLE: &str = "devices";
pub const READINGS_TABLE: &str = "readings";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ColumnType {
    String,
    Timestamp,
    Float,
    Boolean,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnSpec {
    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableSchema {
    pub primary_key: Vec<&'static str>,
    pub columns: BTreeMap<&'static str, ColumnSpec>,
}

const DEVICE_PRIMARY_KEY: &[&str] = &["device_id"];
const DEVICE_COLUMNS: &[(&str, ColumnType)] = &[
    ("device_id", ColumnType::String),
    ("name", ColumnType::String),
    ("location", ColumnType::String),
    ("installation_date", ColumnType::Timestamp),
];

const READING_PRIMARY_KEY: &[&str] = &["device_id", "timestamp"];
const READING_COLUMNS: &[(&str, ColumnType)] = &[
    ("device_id", ColumnType::String),
    ("timestamp", ColumnType::Timestamp),
    ("power_w", ColumnType::Float),
    ("energy_wh", ColumnType::Float),
    ("voltage", ColumnType::Float),
    ("temp_c", ColumnType::Float),
    ("occupancy", ColumnType::Boolean),
    ("source", ColumnType::String),
];

/// Declared columns for `table`, or `None` for an unknown table.
pub fn columns(table: &str) -> Option<&'static [(&'static str, ColumnType)]> {
    match table {
        DEVICES_TABLE => Some(DEVICE_COLUMNS),
        READINGS_TABLE => Some(READING_COLUMNS),
        _ => None,
    }
}

fn table_schema(primary_key: &[&'static str], columns: &[(&'static str, ColumnType)]) -> TableSchema {
    TableSchema {
        primary_key: primary_key.to_vec(),
        columns: columns
            .iter()
            .map(|(name, column_type)| {
                (
                    *name,
                    ColumnSpec {
                        column_type: *column_type,
                    },
                )
            })
            .collect(),
    }
}

/// Full schema keyed by table name.
pub fn get_schema() -> BTreeMap<&'static str, TableSchema> {
    BTreeMap::from([
        (DEVICES_TABLE, table_schema(DEVICE_PRIMARY_KEY, DEVICE_COLUMNS)),
        (READINGS_TABLE, table_schema(READING_PRIMARY_KEY, READING_COLUMNS)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_shape() {
        let schema = serde_json::to_value(get_schema()).unwrap();

        assert_eq!(schema["devices"]["primary_key"], serde_json::json!(["device_id"]));
        assert_eq!(
            schema["readings"]["primary_key"],
            serde_json::json!(["device_id", "timestamp"])
        );
        assert_eq!(schema["devices"]["columns"]["installation_date"]["type"], "TIMESTAMP");
        assert_eq!(schema["readings"]["columns"]["occupancy"]["type"], "BOOLEAN");
        assert_eq!(schema["readings"]["columns"]["voltage"]["type"], "FLOAT");
        assert_eq!(schema["readings"]["columns"]["source"]["type"], "STRING");
        assert_eq!(schema["readings"]["columns"].as_object().unwrap().len(), 8);
    }

    #[test]
    fn test_primary_keys_are_declared_columns() {
        for (table, schema) in get_schema() {
            for key in &schema.primary_key {
                assert!(schema.columns.contains_key(key), "{table}.{key} not declared");
            }
        }
    }

    #[test]
    fn test_unknown_table_has_no_columns() {
        assert!(columns("alerts").is_none());
    }
}
