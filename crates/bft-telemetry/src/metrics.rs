//! Prometheus metrics for replica hosts.
//!
//! Host metrics live in [`REGISTRY`]; protocol counters registered by the
//! engine (behind its `metrics` feature) live in the default registry.
//! [`encode_metrics`] renders both.

use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, Counter, CounterVec, Encoder, Histogram, HistogramOpts, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

use crate::TelemetryError;

lazy_static! {
    /// Registry for replica-host metrics
    pub static ref REGISTRY: Registry = Registry::new();

    /// Messages taken off the inbound channel, by wire tag
    pub static ref MESSAGES_RECEIVED: CounterVec = CounterVec::new(
        Opts::new("bft_host_messages_received_total", "Inbound messages by wire tag"),
        &["tag"]
    ).expect("metric creation failed");

    /// Inbound byte strings that failed to decode
    pub static ref DECODE_FAILURES: Counter = Counter::new(
        "bft_host_decode_failures_total",
        "Inbound messages that did not decode into an envelope"
    ).expect("metric creation failed");

    /// Time spent handling one inbound message to completion
    pub static ref MESSAGE_HANDLING_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "bft_host_message_handling_seconds",
            "Time spent handling one inbound message"
        ).buckets(exponential_buckets(0.00001, 2.0, 16).expect("valid buckets"))
    ).expect("metric creation failed");
}

/// Handle keeping the host registry alive.
pub struct MetricsHandle {
    _registry: Arc<Registry>,
}

/// Register the host metrics with [`REGISTRY`]. Idempotent.
pub fn register_metrics() -> Result<MetricsHandle, TelemetryError> {
    let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(MESSAGES_RECEIVED.clone()),
        Box::new(DECODE_FAILURES.clone()),
        Box::new(MESSAGE_HANDLING_DURATION.clone()),
    ];

    for metric in metrics {
        match REGISTRY.register(metric) {
            // Registering twice in one process is harmless.
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(TelemetryError::MetricsInit(e.to_string())),
        }
    }

    Ok(MetricsHandle {
        _registry: Arc::new(REGISTRY.clone()),
    })
}

/// Encode host and engine metrics in the Prometheus text format.
pub fn encode_metrics() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let mut families = REGISTRY.gather();
    families.extend(prometheus::gather());
    let mut buffer = Vec::new();
    encoder
        .encode(&families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}

/// Timer guard for automatic histogram observation.
pub struct HistogramTimer {
    histogram: Histogram,
    start: std::time::Instant,
}

impl HistogramTimer {
    /// Start a new timer for the given histogram.
    pub fn new(histogram: &Histogram) -> Self {
        Self {
            histogram: histogram.clone(),
            start: std::time::Instant::now(),
        }
    }
}

impl Drop for HistogramTimer {
    fn drop(&mut self) {
        self.histogram.observe(self.start.elapsed().as_secs_f64());
    }
}

/// Start timing for a histogram. Observation happens on drop.
#[macro_export]
macro_rules! time_histogram {
    ($histogram:expr) => {
        $crate::metrics::HistogramTimer::new(&$histogram)
    };
}
