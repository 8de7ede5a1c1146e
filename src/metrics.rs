use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};
use std::sync::Once;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Poll loop metrics
    pub static ref POLL_CYCLES: IntCounter = IntCounter::new(
        "poll_cycles_total",
        "Total number of work selection cycles"
    ).unwrap();

    pub static ref PANORAMAS_PROCESSED: IntCounter = IntCounter::new(
        "panoramas_processed_total",
        "Total number of panoramas whose detections were replaced"
    ).unwrap();

    pub static ref DETECTIONS_WRITTEN: IntCounter = IntCounter::new(
        "detections_written_total",
        "Total number of detection rows committed"
    ).unwrap();

    pub static ref FACES_SKIPPED: IntCounterVec = IntCounterVec::new(
        Opts::new("faces_skipped_total", "Faces excluded from a panorama run by reason"),
        &["reason"]
    ).unwrap();

    pub static ref WRITE_FAILURES: IntCounter = IntCounter::new(
        "detection_write_failures_total",
        "Total number of failed detection replace transactions"
    ).unwrap();

    // Latency metrics (in seconds)
    pub static ref INFERENCE_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "inference_duration_seconds",
            "Detector latency per face in seconds"
        )
        .buckets(vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0])
    ).unwrap();
}

/// Face skip reasons, used as the `reason` label
pub const SKIP_ABSENT: &str = "absent";
pub const SKIP_DECODE: &str = "decode";
pub const SKIP_INFERENCE: &str = "inference";

static INIT: Once = Once::new();

/// Initialize metrics registry. Safe to call more than once.
pub fn init_metrics() {
    INIT.call_once(|| {
        REGISTRY.register(Box::new(POLL_CYCLES.clone())).unwrap();
        REGISTRY.register(Box::new(PANORAMAS_PROCESSED.clone())).unwrap();
        REGISTRY.register(Box::new(DETECTIONS_WRITTEN.clone())).unwrap();
        REGISTRY.register(Box::new(FACES_SKIPPED.clone())).unwrap();
        REGISTRY.register(Box::new(WRITE_FAILURES.clone())).unwrap();
        REGISTRY.register(Box::new(INFERENCE_LATENCY.clone())).unwrap();

        tracing::info!("Metrics registry initialized with {} collectors", REGISTRY.gather().len());
    });
}

/// Export metrics in Prometheus format
pub fn export_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
