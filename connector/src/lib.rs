//! Incremental smart meter connector.
//!
//! Polls the meter API for the device roster and each device's readings
//! since the last watermark, and hands back table-keyed records together
//! with the next watermark.

pub mod catalog;
pub mod client;
pub mod config;
pub mod errors;
pub mod fetcher;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod schema;
pub mod state;
pub mod validate;

use std::collections::BTreeMap;

pub use config::ConnectorConfig;
pub use errors::{Error, Result};
pub use fetcher::DeviceReadings;
pub use model::{Device, FetchWindow, Reading, Record, SyncWatermark};
pub use orchestrator::{SyncDiagnostics, SyncOptions, SyncOrchestrator, SyncOutcome};
pub use schema::TableSchema;

/// Runs one sync round against the configured API.
///
/// A failed connectivity check returns [`Error::Connectivity`]; the caller
/// keeps `state` as-is in that case.
pub async fn update(configuration: &ConnectorConfig, state: &SyncWatermark) -> Result<SyncOutcome> {
    let orchestrator = SyncOrchestrator::from_config(configuration)?;
    orchestrator.sync(state).await
}

/// Table declarations for the downstream loader.
pub fn schema(_configuration: &ConnectorConfig) -> BTreeMap<&'static str, TableSchema> {
    schema::get_schema()
}
