//! Structured logging.
//!
//! Every engine event carries the same core fields so that log shippers can
//! index them:
//! - `replica`: index of the emitting replica
//! - `view`: view the replica was in
//! - `seqno`: sequence number, for per-slot events
//! - additional context fields

use crate::{TelemetryConfig, TelemetryError};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Marker that logging was installed by this process.
pub struct LoggingGuard {
    _json: bool,
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Fails if a global
/// subscriber is already installed.
pub fn init_logging(config: &TelemetryConfig) -> Result<LoggingGuard, TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| TelemetryError::Config(e.to_string()))?;

    if !config.console_output {
        tracing_subscriber::registry()
            .with(env_filter)
            .try_init()
            .map_err(|e| TelemetryError::LoggerInit(e.to_string()))?;
    } else if config.json_logs {
        let json_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(json_layer)
            .try_init()
            .map_err(|e| TelemetryError::LoggerInit(e.to_string()))?;
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_ansi(true);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|e| TelemetryError::LoggerInit(e.to_string()))?;
    }

    Ok(LoggingGuard {
        _json: config.json_logs,
    })
}

/// Log a replica-level event with the standard fields.
#[macro_export]
macro_rules! log_replica_event {
    ($level:ident, $replica:expr, $view:expr, $msg:expr $(, $($field:tt)*)?) => {
        tracing::$level!(
            replica = $replica,
            view = $view,
            $($($field)*,)?
            $msg
        )
    };
}

/// Log a per-sequence-number event with the standard fields.
#[macro_export]
macro_rules! log_seqno_event {
    ($level:ident, $replica:expr, $view:expr, $seqno:expr, $msg:expr $(, $($field:tt)*)?) => {
        tracing::$level!(
            replica = $replica,
            view = $view,
            seqno = $seqno,
            $($($field)*,)?
            $msg
        )
    };
}
