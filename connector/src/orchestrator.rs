use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::catalog::{dedup_roster, DeviceCatalog, HttpDeviceCatalog};
use crate::client::{ApiClient, ConnectionProbe};
use crate::config::ConnectorConfig;
use crate::errors::{Error, Result};
use crate::fetcher::{DeviceReadings, HttpReadingFetcher, ReadingFetcher};
use crate::metrics::{
    CATALOG_FAILURES_TOTAL, CONNECTIVITY_FAILURES_TOTAL, DEVICES_EMITTED_TOTAL,
    DEVICE_FETCH_FAILURES_TOTAL, FETCH_LATENCY_SECONDS, INVALID_RECORDS_TOTAL,
    READINGS_EMITTED_TOTAL, SYNCS_TOTAL, SYNC_DURATION_SECONDS, WATERMARK_SECONDS,
};
use crate::model::{to_record, Device, FetchWindow, Record, SyncWatermark};
use crate::schema::{DEVICES_TABLE, READINGS_TABLE};
use crate::state::{BatchCounts, DeviceMemory, SyncStateStore};
use crate::validate::check;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub max_concurrency: usize,
    /// Deadline for the whole reading fan-out. Devices still outstanding
    /// when it passes are reported as timed out.
    pub sync_timeout: Option<Duration>,
    pub bootstrap_lookback: chrono::Duration,
    /// Keep the prior watermark when the roster could not be fetched at all.
    pub hold_watermark_on_catalog_failure: bool,
    pub forget_absent_devices_after: u32,
}

impl Default for SyncOptions {
    fn default() -> Self {
        SyncOptions::from(&ConnectorConfig::default())
    }
}

impl From<&ConnectorConfig> for SyncOptions {
    fn from(config: &ConnectorConfig) -> Self {
        Self {
            max_concurrency: config.max_concurrency.max(1),
            sync_timeout: config.sync_timeout(),
            bootstrap_lookback: config.bootstrap_lookback(),
            hold_watermark_on_catalog_failure: config.hold_watermark_on_catalog_failure,
            forget_absent_devices_after: config.forget_absent_devices_after,
        }
    }
}

/// Degraded outcomes of a sync that still completed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncDiagnostics {
    pub catalog_failures: usize,
    pub failed_devices: Vec<String>,
    pub timed_out_devices: Vec<String>,
    pub devices_rejected: usize,
    pub readings_rejected: usize,
    /// Upstream `data` items that were not JSON objects at all.
    pub malformed_readings: usize,
}

impl SyncDiagnostics {
    pub fn fetch_failures(&self) -> usize {
        self.failed_devices.len() + self.timed_out_devices.len()
    }

    pub fn validation_failures(&self) -> usize {
        self.devices_rejected + self.readings_rejected + self.malformed_readings
    }

    pub fn is_clean(&self) -> bool {
        self.catalog_failures == 0 && self.fetch_failures() == 0 && self.validation_failures() == 0
    }
}

#[derive(Debug, Clone)]
pub struct SyncOutcome {
    /// Emitted rows keyed by table name.
    pub records: BTreeMap<String, Vec<Record>>,
    pub state: SyncWatermark,
    pub diagnostics: SyncDiagnostics,
}

impl SyncOutcome {
    pub fn table(&self, name: &str) -> &[Record] {
        self.records.get(name).map(Vec::as_slice).unwrap_or(&[])
    }
}

struct DeviceFetch {
    device_id: String,
    result: Result<DeviceReadings>,
    elapsed: Duration,
}

pub struct SyncOrchestrator {
    probe: Arc<dyn ConnectionProbe>,
    catalog: Arc<dyn DeviceCatalog>,
    fetcher: Arc<dyn ReadingFetcher>,
    state_store: SyncStateStore,
    options: SyncOptions,
}

impl SyncOrchestrator {
    pub fn new(
        probe: Arc<dyn ConnectionProbe>,
        catalog: Arc<dyn DeviceCatalog>,
        fetcher: Arc<dyn ReadingFetcher>,
        options: SyncOptions,
    ) -> Self {
        Self {
            probe,
            catalog,
            fetcher,
            state_store: SyncStateStore::new(options.bootstrap_lookback),
            options,
        }
    }

    /// Wires the HTTP catalog and fetcher around one shared [`ApiClient`].
    ///
    /// The configuration is normalized first, whichever way it was built.
    pub fn from_config(config: &ConnectorConfig) -> Result<Self> {
        let config = config.clone().normalized()?;
        let client = ApiClient::new(&config)?;

        Ok(Self::new(
            Arc::new(client.clone()),
            Arc::new(HttpDeviceCatalog::new(client.clone())),
            Arc::new(HttpReadingFetcher::new(client)),
            SyncOptions::from(&config),
        ))
    }

    pub async fn sync(&self, prior: &SyncWatermark) -> Result<SyncOutcome> {
        self.sync_at(prior, Utc::now()).await
    }

    /// Runs one sync round as if the clock read `now`.
    ///
    /// Only a failed connectivity pre-check is returned as an error, in
    /// which case nothing has been fetched and `prior` stays the valid state.
    pub async fn sync_at(&self, prior: &SyncWatermark, now: DateTime<Utc>) -> Result<SyncOutcome> {
        let sync_id = Uuid::new_v4();
        self.run(prior, now)
            .instrument(info_span!("sync", %sync_id))
            .await
    }

    async fn run(&self, prior: &SyncWatermark, now: DateTime<Utc>) -> Result<SyncOutcome> {
        SYNCS_TOTAL.inc();
        let started = Instant::now();

        if !self.probe.test_connection().await {
            CONNECTIVITY_FAILURES_TOTAL.inc();
            error!("Connectivity pre-check failed, aborting sync");
            return Err(Error::Connectivity {
                url: self.probe.endpoint(),
            });
        }

        let pending = self.state_store.resolve(prior, now);
        let window = pending.window();
        info!("Syncing readings in [{}, {}]", window.start, window.end);

        let mut diagnostics = SyncDiagnostics::default();

        let roster = self.list_devices(prior, now, &mut diagnostics).await;
        let catalog_failed = roster.is_none();
        let devices = roster.unwrap_or_default();

        let readings = self.fetch_all(&devices, window, &mut diagnostics).await;

        let memory = if catalog_failed {
            DeviceMemory::carry(prior)
        } else {
            DeviceMemory::refresh(prior, &devices, self.options.forget_absent_devices_after)
        };

        let device_records = devices.iter().filter_map(|device| match to_record(device) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("Failed to serialize device {}: {}", device.device_id, e);
                None
            }
        });
        let (device_records, _) = gate(DEVICES_TABLE, device_records);
        let (reading_records, readings_rejected) = gate(READINGS_TABLE, readings);
        // Serialization failures count as rejected alongside validation failures
        diagnostics.devices_rejected = devices.len() - device_records.len();
        diagnostics.readings_rejected = readings_rejected;

        let counts = BatchCounts {
            devices: device_records.len(),
            readings: reading_records.len(),
        };

        let state = if catalog_failed && self.options.hold_watermark_on_catalog_failure {
            warn!("Device roster unavailable, holding watermark for the next sync");
            pending.hold(counts, memory)
        } else {
            pending.commit(counts, memory)
        };

        DEVICES_EMITTED_TOTAL.inc_by(counts.devices as f64);
        READINGS_EMITTED_TOTAL.inc_by(counts.readings as f64);
        if let Some(watermark) = state.last_sync_timestamp {
            WATERMARK_SECONDS.set(watermark.timestamp() as f64);
        }
        SYNC_DURATION_SECONDS.observe(started.elapsed().as_secs_f64());

        info!(
            "Sync completed: {} devices, {} readings",
            counts.devices, counts.readings
        );
        if !diagnostics.is_clean() {
            warn!(
                catalog_failures = diagnostics.catalog_failures,
                fetch_failures = diagnostics.fetch_failures(),
                validation_failures = diagnostics.validation_failures(),
                "Sync completed with partial failures"
            );
        }

        let records = BTreeMap::from([
            (DEVICES_TABLE.to_string(), device_records),
            (READINGS_TABLE.to_string(), reading_records),
        ]);

        Ok(SyncOutcome {
            records,
            state,
            diagnostics,
        })
    }

    /// Full-refresh roster, or `None` when the catalog call failed.
    async fn list_devices(
        &self,
        prior: &SyncWatermark,
        now: DateTime<Utc>,
        diagnostics: &mut SyncDiagnostics,
    ) -> Option<Vec<Device>> {
        match self.catalog.list_devices().await {
            Ok(listings) => Some(
                dedup_roster(listings)
                    .into_iter()
                    .map(|listing| {
                        let remembered = prior.installation_dates.get(&listing.device_id).copied();
                        listing.into_device(remembered, now)
                    })
                    .collect(),
            ),
            Err(e) => {
                warn!("Error fetching devices: {}", e);
                CATALOG_FAILURES_TOTAL.inc();
                diagnostics.catalog_failures += 1;
                None
            }
        }
    }

    /// Fetches every device's readings with bounded concurrency.
    ///
    /// Each device runs in its own task and reports back over one channel;
    /// this loop is the single place results are appended.
    async fn fetch_all(
        &self,
        devices: &[Device],
        window: FetchWindow,
        diagnostics: &mut SyncDiagnostics,
    ) -> Vec<Record> {
        if devices.is_empty() {
            return Vec::new();
        }

        let (tx, mut rx) = mpsc::channel::<DeviceFetch>(devices.len());
        let permits = Arc::new(Semaphore::new(self.options.max_concurrency));
        let mut tasks = JoinSet::new();

        for device in devices {
            let tx = tx.clone();
            let fetcher = Arc::clone(&self.fetcher);
            let permits = Arc::clone(&permits);
            let device_id = device.device_id.clone();

            tasks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                let started = Instant::now();
                let result = fetcher.fetch_readings(&device_id, &window).await;
                let _ = tx
                    .send(DeviceFetch {
                        device_id,
                        result,
                        elapsed: started.elapsed(),
                    })
                    .await;
            });
        }
        drop(tx);

        let mut outstanding: HashSet<String> =
            devices.iter().map(|device| device.device_id.clone()).collect();
        let mut readings = Vec::new();
        let deadline = self.options.sync_timeout.map(|timeout| Instant::now() + timeout);
        let mut timed_out = false;

        loop {
            let fetched = match deadline {
                Some(deadline) => tokio::select! {
                    fetched = rx.recv() => fetched,
                    _ = tokio::time::sleep_until(deadline) => {
                        timed_out = true;
                        None
                    }
                },
                None => rx.recv().await,
            };

            match fetched {
                Some(fetched) => absorb(fetched, &mut outstanding, &mut readings, diagnostics),
                // All senders dropped: every task has finished
                None => break,
            }
        }

        if timed_out {
            tasks.abort_all();
            while let Ok(fetched) = rx.try_recv() {
                absorb(fetched, &mut outstanding, &mut readings, diagnostics);
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    error!("Reading fetch task panicked: {}", e);
                }
            }
        }

        let mut leftover: Vec<String> = outstanding.into_iter().collect();
        leftover.sort();
        if !leftover.is_empty() {
            DEVICE_FETCH_FAILURES_TOTAL.inc_by(leftover.len() as f64);
            if timed_out {
                warn!(
                    "Sync timeout elapsed with {} devices outstanding: {}",
                    leftover.len(),
                    leftover.join(", ")
                );
                diagnostics.timed_out_devices = leftover;
            } else {
                diagnostics.failed_devices.extend(leftover);
            }
        }
        diagnostics.failed_devices.sort();

        readings
    }
}

fn absorb(
    fetched: DeviceFetch,
    outstanding: &mut HashSet<String>,
    readings: &mut Vec<Record>,
    diagnostics: &mut SyncDiagnostics,
) {
    outstanding.remove(&fetched.device_id);
    FETCH_LATENCY_SECONDS.observe(fetched.elapsed.as_secs_f64());

    match fetched.result {
        Ok(fetched_readings) => {
            debug!(
                "Device {} contributed {} readings in {:.3}s",
                fetched.device_id,
                fetched_readings.records.len(),
                fetched.elapsed.as_secs_f64()
            );
            diagnostics.malformed_readings += fetched_readings.malformed;
            readings.extend(fetched_readings.records);
        }
        Err(e) => {
            warn!("Error fetching readings for device {}: {}", fetched.device_id, e);
            DEVICE_FETCH_FAILURES_TOTAL.inc();
            diagnostics.failed_devices.push(fetched.device_id);
        }
    }
}

/// Splits `records` into those passing schema validation and a reject count.
fn gate(table: &str, records: impl IntoIterator<Item = Record>) -> (Vec<Record>, usize) {
    let mut accepted = Vec::new();
    let mut rejected = 0;

    for record in records {
        match check(table, &record) {
            Ok(()) => accepted.push(record),
            Err(e) => {
                debug!("Dropping record: {}", e);
                rejected += 1;
            }
        }
    }

    if rejected > 0 {
        warn!("Dropped {} {} records failing schema validation", rejected, table);
        INVALID_RECORDS_TOTAL.inc_by(rejected as f64);
    }

    (accepted, rejected)
}
