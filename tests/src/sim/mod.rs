//! Simulation harness shared by the integration tests and benchmarks.

mod client;
mod network;

pub use client::*;
pub use network::*;

/// Install the replica log subscriber once per test binary. Quiet unless
/// `RUST_LOG` or `BFT_LOG_LEVEL` asks for more.
pub fn init_test_logging() {
    let config = bft_telemetry::TelemetryConfig {
        log_level: std::env::var("BFT_LOG_LEVEL").unwrap_or_else(|_| "warn".to_string()),
        ..bft_telemetry::TelemetryConfig::default()
    };
    // Later calls find the subscriber installed.
    let _ = bft_telemetry::init_logging(&config);
}
