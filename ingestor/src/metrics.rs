use lazy_static::lazy_static;
use prometheus::{
    core::Collector, Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry,
    TextEncoder,
};
use std::sync::Once;
use tracing::error;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref READINGS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_readings_total",
        "Total telemetry readings received by the pipeline"
    ))
    .unwrap();
    pub static ref READINGS_WRITTEN_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_readings_written_total",
        "Total readings persisted with a resolved owner"
    ))
    .unwrap();
    pub static ref READINGS_DROPPED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_readings_dropped_total",
        "Total readings dropped because the device is not registered"
    ))
    .unwrap();
    pub static ref INGEST_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_failures_total",
        "Total pipeline invocations answered with a failure"
    ))
    .unwrap();
    pub static ref STATUS_EVENTS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_status_events_total",
        "Total connectivity events received"
    ))
    .unwrap();
    pub static ref INVALID_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_invalid_messages_total",
        "Total MQTT messages that could not be decoded"
    ))
    .unwrap();
    pub static ref DB_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_db_failures_total",
        "Total transient database failures"
    ))
    .unwrap();
    pub static ref STATUS_MUTATIONS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_status_mutations_total",
        "Total device status mutations issued by the liveness monitor"
    ))
    .unwrap();
    pub static ref STATUS_MUTATION_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_status_mutation_failures_total",
        "Total liveness monitor status mutations that failed"
    ))
    .unwrap();
    pub static ref OFFLINE_TRANSITIONS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_offline_transitions_total",
        "Total devices transitioned to offline"
    ))
    .unwrap();
    pub static ref ACTIVE_NOTIFICATIONS: Gauge = Gauge::with_opts(Opts::new(
        "monitor_active_notifications",
        "Notifications not yet dismissed"
    ))
    .unwrap();
    pub static ref INGEST_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "ingestor_ingest_latency_seconds",
            "Time taken to resolve the owner and write one reading"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
    pub static ref MONITOR_TICK_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "monitor_tick_seconds",
            "Time taken by one liveness evaluation tick"
        )
        .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0])
    )
    .unwrap();
}

fn collectors() -> Vec<Box<dyn Collector>> {
    vec![
        Box::new(READINGS_TOTAL.clone()),
        Box::new(READINGS_WRITTEN_TOTAL.clone()),
        Box::new(READINGS_DROPPED_TOTAL.clone()),
        Box::new(INGEST_FAILURES_TOTAL.clone()),
        Box::new(STATUS_EVENTS_TOTAL.clone()),
        Box::new(INVALID_MESSAGES_TOTAL.clone()),
        Box::new(DB_FAILURES_TOTAL.clone()),
        Box::new(STATUS_MUTATIONS_TOTAL.clone()),
        Box::new(STATUS_MUTATION_FAILURES_TOTAL.clone()),
        Box::new(OFFLINE_TRANSITIONS_TOTAL.clone()),
        Box::new(ACTIVE_NOTIFICATIONS.clone()),
        Box::new(INGEST_LATENCY_SECONDS.clone()),
        Box::new(MONITOR_TICK_SECONDS.clone()),
    ]
}

/// Registers every collector once; later calls are no-ops.
pub fn init_metrics() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        for collector in collectors() {
            if let Err(e) = REGISTRY.register(collector) {
                error!("Failed to register metric: {}", e);
            }
        }
    });
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}
