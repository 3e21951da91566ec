//! # BFT Telemetry
//!
//! Observability for agreement replicas.
//!
//! ## Components
//!
//! - **Logs**: `tracing` events rendered by a `tracing-subscriber` fmt layer,
//!   pretty for development or JSON for log shippers.
//! - **Metrics**: a replica-host Prometheus registry (message intake, handling
//!   latency, decode failures) encoded together with whatever the engine
//!   registered in the default registry.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use bft_telemetry::{init_telemetry, TelemetryConfig};
//!
//! let config = TelemetryConfig::for_replica(2);
//! let _guard = init_telemetry(&config).expect("Failed to init telemetry");
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `BFT_LOG_LEVEL` | `info` | Log level filter (`RUST_LOG` wins if set) |
//! | `BFT_JSON_LOGS` | `false` | JSON output |
//! | `BFT_CONSOLE_OUTPUT` | `true` | Emit logs to stdout at all |

#![warn(missing_docs)]

mod config;
mod logging;
pub mod metrics;

pub use config::TelemetryConfig;
pub use logging::{init_logging, LoggingGuard};
pub use metrics::{
    encode_metrics, register_metrics, HistogramTimer, MetricsHandle, DECODE_FAILURES,
    MESSAGES_RECEIVED, MESSAGE_HANDLING_DURATION,
};

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    /// The global subscriber could not be installed.
    #[error("Failed to initialize logger: {0}")]
    LoggerInit(String),

    /// A collector could not be registered or encoded.
    #[error("Failed to initialize Prometheus metrics: {0}")]
    MetricsInit(String),

    /// A configuration value is unusable.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Initialize logging and register the host metrics.
///
/// Returns a guard that must be held for the lifetime of the replica process.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let metrics = register_metrics()?;
    let logging = init_logging(config)?;

    tracing::info!(
        replica = ?config.replica_id,
        json_logs = config.json_logs,
        "[bft] telemetry initialized"
    );

    Ok(TelemetryGuard {
        _logging: logging,
        _metrics: metrics,
    })
}

/// Guard that keeps telemetry active.
pub struct TelemetryGuard {
    _logging: LoggingGuard,
    _metrics: MetricsHandle,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        tracing::info!("[bft] shutting down telemetry");
    }
}
