//! Replica configuration.
//!
//! Defaults match a classic four-replica deployment with a 256-seqno window
//! and checkpoints every 128 sequence numbers.

use crate::domain::QuorumParams;
use crate::error::{AgreementError, AgreementResult};
use std::env;
use std::time::Duration;

/// Whether prepared requests may run before their commit certificate completes.
///
/// Tentative execution lowers reply latency, but a view change can force a
/// rollback to the last checkpoint. Only enable it for applications whose
/// `exec` has no effects outside state that rollback restores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionPolicy {
    /// Execute once prepared, reply tentatively, roll back on view change.
    Tentative,
    /// Execute only once committed.
    #[default]
    CommittedOnly,
}

/// Agreement engine configuration.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// Number of replicas N. Tolerates f = (N-1)/3 faults.
    pub replica_count: usize,
    /// Sequence numbers the primary may run ahead of the last stable checkpoint.
    pub max_out: u64,
    /// Executed sequence numbers between checkpoints.
    pub checkpoint_interval: u64,
    /// Pre-prepares the primary may have outstanding beyond `last_executed`.
    pub congestion_window: u64,
    /// Upper bound on an encoded pre-prepare batch.
    pub max_message_size: usize,
    /// Requests with a command above this size travel out of band.
    pub big_request_threshold: usize,
    /// Base view-change timeout.
    pub view_change_timeout: Duration,
    /// Period of the status (negative-ack) timer.
    pub status_period: Duration,
    /// Minimum gap between two status broadcasts.
    pub status_min_interval: Duration,
    /// Session key rotation period, `None` to disable rotation.
    pub key_rotation_period: Option<Duration>,
    /// Tentative or committed-only execution.
    pub execution: ExecutionPolicy,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            replica_count: 4,
            max_out: 256,
            checkpoint_interval: 128,
            congestion_window: 1,
            max_message_size: 9000,
            big_request_threshold: 255,
            view_change_timeout: Duration::from_secs(5),
            status_period: Duration::from_millis(150),
            status_min_interval: Duration::from_millis(100),
            key_rotation_period: Some(Duration::from_secs(20)),
            execution: ExecutionPolicy::CommittedOnly,
        }
    }
}

impl ReplicaConfig {
    /// Longest view-change timeout reached by doubling.
    pub const MAX_TIMEOUT_MULTIPLIER: u32 = 64;

    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `BFT_REPLICA_COUNT` (default: 4)
    /// - `BFT_MAX_OUT` (default: 256)
    /// - `BFT_CHECKPOINT_INTERVAL` (default: 128)
    /// - `BFT_CONGESTION_WINDOW` (default: 1)
    /// - `BFT_MAX_MESSAGE_SIZE` (default: 9000)
    /// - `BFT_BIG_REQUEST_THRESHOLD` (default: 255)
    /// - `BFT_VIEW_CHANGE_TIMEOUT_MS` (default: 5000)
    /// - `BFT_STATUS_PERIOD_MS` (default: 150)
    /// - `BFT_KEY_ROTATION_SECS` (default: 20, `0` disables)
    /// - `BFT_TENTATIVE_EXECUTION` (default: false)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            replica_count: parse_env("BFT_REPLICA_COUNT").unwrap_or(defaults.replica_count),
            max_out: parse_env("BFT_MAX_OUT").unwrap_or(defaults.max_out),
            checkpoint_interval: parse_env("BFT_CHECKPOINT_INTERVAL")
                .unwrap_or(defaults.checkpoint_interval),
            congestion_window: parse_env("BFT_CONGESTION_WINDOW")
                .unwrap_or(defaults.congestion_window),
            max_message_size: parse_env("BFT_MAX_MESSAGE_SIZE")
                .unwrap_or(defaults.max_message_size),
            big_request_threshold: parse_env("BFT_BIG_REQUEST_THRESHOLD")
                .unwrap_or(defaults.big_request_threshold),
            view_change_timeout: parse_env("BFT_VIEW_CHANGE_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.view_change_timeout),
            status_period: parse_env("BFT_STATUS_PERIOD_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.status_period),
            status_min_interval: defaults.status_min_interval,
            key_rotation_period: match parse_env::<u64>("BFT_KEY_ROTATION_SECS") {
                Some(0) => None,
                Some(secs) => Some(Duration::from_secs(secs)),
                None => defaults.key_rotation_period,
            },
            execution: match env::var("BFT_TENTATIVE_EXECUTION") {
                Ok(v) if v.to_lowercase() == "true" || v == "1" => ExecutionPolicy::Tentative,
                _ => defaults.execution,
            },
        }
    }

    /// Quorum parameters derived from the replica count.
    pub fn quorum(&self) -> QuorumParams {
        QuorumParams::new(self.replica_count)
    }

    /// True when prepared requests execute before commit.
    pub fn tentative_execution(&self) -> bool {
        self.execution == ExecutionPolicy::Tentative
    }

    /// Check the configuration for values the protocol cannot run with.
    pub fn validate(&self) -> AgreementResult<()> {
        let invalid = |reason: &str| {
            Err(AgreementError::InvalidConfig {
                reason: reason.to_string(),
            })
        };
        if self.replica_count == 0 {
            return invalid("replica_count must be at least 1");
        }
        if self.replica_count > 64 {
            return invalid("replica_count above 64 is not supported");
        }
        if self.checkpoint_interval == 0 || self.max_out == 0 {
            return invalid("checkpoint_interval and max_out must be positive");
        }
        if self.max_out % self.checkpoint_interval != 0 {
            return invalid("checkpoint_interval must divide max_out");
        }
        if self.congestion_window == 0 {
            return invalid("congestion_window must be positive");
        }
        if self.big_request_threshold >= self.max_message_size {
            return invalid("big_request_threshold must be below max_message_size");
        }
        if self.view_change_timeout.is_zero() || self.status_period.is_zero() {
            return invalid("timer periods must be positive");
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}
