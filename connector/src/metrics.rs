use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};
use std::sync::Once;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref SYNCS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "connector_syncs_total",
        "Total sync rounds started"
    ))
    .unwrap();
    pub static ref CONNECTIVITY_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "connector_connectivity_failures_total",
        "Total syncs aborted by the connectivity pre-check"
    ))
    .unwrap();
    pub static ref CATALOG_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "connector_catalog_failures_total",
        "Total failed device roster fetches"
    ))
    .unwrap();
    pub static ref DEVICE_FETCH_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "connector_device_fetch_failures_total",
        "Total per-device reading fetches that failed or timed out"
    ))
    .unwrap();
    pub static ref HTTP_RETRIES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "connector_http_retries_total",
        "Total upstream requests retried after a transient failure"
    ))
    .unwrap();
    pub static ref MALFORMED_READINGS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "connector_malformed_readings_total",
        "Total non-object items dropped from reading responses"
    ))
    .unwrap();
    pub static ref INVALID_RECORDS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "connector_invalid_records_total",
        "Total records rejected by schema validation"
    ))
    .unwrap();
    pub static ref DEVICES_EMITTED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "connector_devices_emitted_total",
        "Total device records emitted"
    ))
    .unwrap();
    pub static ref READINGS_EMITTED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "connector_readings_emitted_total",
        "Total reading records emitted"
    ))
    .unwrap();
    pub static ref WATERMARK_SECONDS: Gauge = Gauge::with_opts(Opts::new(
        "connector_watermark_seconds",
        "Unix time of the last committed watermark"
    ))
    .unwrap();
    pub static ref FETCH_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "connector_fetch_latency_seconds",
            "Time taken to fetch readings for one device"
        )
        .buckets(vec![
            0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0
        ])
    )
    .unwrap();
    pub static ref SYNC_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "connector_sync_duration_seconds",
            "Time taken by a complete sync round"
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0])
    )
    .unwrap();
}

static INIT: Once = Once::new();

pub fn init_metrics() {
    INIT.call_once(|| {
        REGISTRY.register(Box::new(SYNCS_TOTAL.clone())).unwrap();
        REGISTRY
            .register(Box::new(CONNECTIVITY_FAILURES_TOTAL.clone()))
            .unwrap();
        REGISTRY
            .register(Box::new(CATALOG_FAILURES_TOTAL.clone()))
            .unwrap();
        REGISTRY
            .register(Box::new(DEVICE_FETCH_FAILURES_TOTAL.clone()))
            .unwrap();
        REGISTRY
            .register(Box::new(HTTP_RETRIES_TOTAL.clone()))
            .unwrap();
        REGISTRY
            .register(Box::new(MALFORMED_READINGS_TOTAL.clone()))
            .unwrap();
        REGISTRY
            .register(Box::new(INVALID_RECORDS_TOTAL.clone()))
            .unwrap();
        REGISTRY
            .register(Box::new(DEVICES_EMITTED_TOTAL.clone()))
            .unwrap();
        REGISTRY
            .register(Box::new(READINGS_EMITTED_TOTAL.clone()))
            .unwrap();
        REGISTRY.register(Box::new(WATERMARK_SECONDS.clone())).unwrap();
        REGISTRY
            .register(Box::new(FETCH_LATENCY_SECONDS.clone()))
            .unwrap();
        REGISTRY
            .register(Box::new(SYNC_DURATION_SECONDS.clone()))
            .unwrap();
    });
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_metrics();
        init_metrics();

        SYNCS_TOTAL.inc();
        let text = gather_metrics();
        assert!(text.contains("connector_syncs_total"));
    }
}
