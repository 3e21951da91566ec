//! Log subscriber settings.

use std::env;

/// What [`init_logging`](crate::init_logging) installs.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Replica index stamped on the startup record
    pub replica_id: Option<usize>,

    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub log_level: String,

    /// Install a fmt layer at all
    pub console_output: bool,

    /// JSON records instead of the pretty format
    pub json_logs: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            replica_id: None,
            log_level: "info".to_string(),
            console_output: true,
            json_logs: false,
        }
    }
}

impl TelemetryConfig {
    /// Read `BFT_LOG_LEVEL`, `BFT_CONSOLE_OUTPUT` and `BFT_JSON_LOGS`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// [`from_env`](Self::from_env) for the replica at `replica_id`.
    pub fn for_replica(replica_id: usize) -> Self {
        Self {
            replica_id: Some(replica_id),
            ..Self::from_env()
        }
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let flag = |key: &str, default: bool| match lookup(key) {
            Some(v) => matches!(v.to_lowercase().as_str(), "true" | "1"),
            None => default,
        };

        Self {
            replica_id: None,
            log_level: lookup("BFT_LOG_LEVEL").unwrap_or(defaults.log_level),
            console_output: flag("BFT_CONSOLE_OUTPUT", defaults.console_output),
            json_logs: flag("BFT_JSON_LOGS", defaults.json_logs),
        }
    }
}
