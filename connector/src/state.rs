use chrono::{DateTime, Duration, SubsecRound, Utc};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::model::{Device, FetchWindow, SyncWatermark};

pub const BOOTSTRAP_LOOKBACK_DAYS: i64 = 7;

/// Rows emitted by one sync round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchCounts {
    pub devices: usize,
    pub readings: usize,
}

/// Per-device facts carried from one sync to the next.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceMemory {
    pub installation_dates: BTreeMap<String, DateTime<Utc>>,
    pub absent_syncs: BTreeMap<String, u32>,
}

impl DeviceMemory {
    /// The prior watermark's memory, untouched.
    pub fn carry(prior: &SyncWatermark) -> Self {
        Self {
            installation_dates: prior.installation_dates.clone(),
            absent_syncs: prior.absent_syncs.clone(),
        }
    }

    /// Merges a freshly listed roster into the prior memory.
    ///
    /// Listed devices are remembered with their resolved installation date.
    /// A remembered device missing from the roster is kept until it has been
    /// absent for more than `forget_after` consecutive syncs.
    pub fn refresh(prior: &SyncWatermark, roster: &[Device], forget_after: u32) -> Self {
        let mut memory = Self::default();

        for device in roster {
            memory
                .installation_dates
                .insert(device.device_id.clone(), device.installation_date);
        }

        for (device_id, installation_date) in &prior.installation_dates {
            if memory.installation_dates.contains_key(device_id) {
                continue;
            }
            let absent = prior.absent_syncs.get(device_id).copied().unwrap_or(0) + 1;
            if absent > forget_after {
                info!("Forgetting device {} after {} syncs off the roster", device_id, absent - 1);
                continue;
            }
            memory
                .installation_dates
                .insert(device_id.clone(), *installation_date);
            memory.absent_syncs.insert(device_id.clone(), absent);
        }

        memory
    }
}

/// Turns a prior watermark into the next fetch window.
#[derive(Debug, Clone, Copy)]
pub struct SyncStateStore {
    bootstrap_lookback: Duration,
}

impl Default for SyncStateStore {
    fn default() -> Self {
        Self::new(Duration::days(BOOTSTRAP_LOOKBACK_DAYS))
    }
}

impl SyncStateStore {
    pub fn new(bootstrap_lookback: Duration) -> Self {
        Self { bootstrap_lookback }
    }

    /// Resolves the window for a sync starting at `now`.
    ///
    /// With a stored watermark `T` the window is `[T, now]`; the instant `T`
    /// is fetched again on purpose and collapses on upsert downstream. Without
    /// one, the window reaches back by the bootstrap lookback.
    ///
    /// `now` is truncated to whole microseconds, the precision the upstream
    /// is queried with, so the committed watermark never lies past the end
    /// that was actually requested.
    pub fn resolve(&self, prior: &SyncWatermark, now: DateTime<Utc>) -> PendingWindow {
        let now = now.trunc_subsecs(6);
        let window = match prior.last_sync_timestamp {
            Some(last) => {
                if now < last {
                    warn!(
                        "Clock reads {} which is before watermark {}, holding window at the watermark",
                        now, last
                    );
                }
                FetchWindow {
                    start: last,
                    end: now.max(last),
                }
            }
            None => FetchWindow {
                start: now
                    .checked_sub_signed(self.bootstrap_lookback)
                    .unwrap_or(DateTime::<Utc>::MIN_UTC),
                end: now,
            },
        };

        debug!("Resolved fetch window [{}, {}]", window.start, window.end);

        PendingWindow {
            window,
            prior_watermark: prior.last_sync_timestamp,
        }
    }
}

/// A resolved window whose fetch round has not been committed yet.
///
/// The only way to obtain a new watermark is [`PendingWindow::commit`],
/// which consumes the window once its readings have been collected.
#[derive(Debug, Clone)]
#[must_use = "a resolved window must be committed to advance the watermark"]
pub struct PendingWindow {
    window: FetchWindow,
    prior_watermark: Option<DateTime<Utc>>,
}

impl PendingWindow {
    pub fn window(&self) -> FetchWindow {
        self.window
    }

    /// Advances the watermark to the end of the window.
    pub fn commit(self, counts: BatchCounts, memory: DeviceMemory) -> SyncWatermark {
        let last_sync_timestamp = match self.prior_watermark {
            Some(prior) => prior.max(self.window.end),
            None => self.window.end,
        };

        SyncWatermark {
            last_sync_timestamp: Some(last_sync_timestamp),
            total_devices: counts.devices,
            total_readings: counts.readings,
            installation_dates: memory.installation_dates,
            absent_syncs: memory.absent_syncs,
        }
    }

    /// Records the counts but keeps the prior watermark, so the same window
    /// is fetched again on the next sync.
    pub fn hold(self, counts: BatchCounts, memory: DeviceMemory) -> SyncWatermark {
        SyncWatermark {
            last_sync_timestamp: self.prior_watermark,
            total_devices: counts.devices,
            total_readings: counts.readings,
            installation_dates: memory.installation_dates,
            absent_syncs: memory.absent_syncs,
        }
    }
}
