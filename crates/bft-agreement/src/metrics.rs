//! # Agreement Metrics
//!
//! Prometheus counters and gauges for the agreement engine.
//!
//! ## Usage
//!
//! Enable with the `metrics` feature:
//! ```toml
//! bft-agreement = { path = "...", features = ["metrics"] }
//! ```
//!
//! ## Metrics Exported
//!
//! - `bft_requests_ordered_total` - Requests placed in pre-prepares by this primary
//! - `bft_seqnos_executed_total` - Sequence numbers executed and committed
//! - `bft_stable_checkpoints_total` - Checkpoints that became stable
//! - `bft_view_changes_total` - View-changes this replica started
//! - `bft_new_views_total` - New views installed
//! - `bft_messages_dropped_total` - Dropped inbound messages (by reason)
//! - `bft_status_sent_total` - Status messages broadcast
//! - `bft_view`, `bft_last_executed`, `bft_last_stable` - Marker gauges

#[cfg(feature = "metrics")]
use lazy_static::lazy_static;

#[cfg(feature = "metrics")]
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter,
    IntCounterVec, IntGauge,
};

#[cfg(feature = "metrics")]
lazy_static! {
    /// Requests placed in pre-prepares
    pub static ref REQUESTS_ORDERED: IntCounter = register_int_counter!(
        "bft_requests_ordered_total",
        "Total number of client requests ordered by this replica as primary"
    )
    .expect("Failed to create REQUESTS_ORDERED metric");

    /// Sequence numbers executed after commit
    pub static ref SEQNOS_EXECUTED: IntCounter = register_int_counter!(
        "bft_seqnos_executed_total",
        "Total number of sequence numbers executed and committed"
    )
    .expect("Failed to create SEQNOS_EXECUTED metric");

    /// Checkpoints that became stable
    pub static ref STABLE_CHECKPOINTS: IntCounter = register_int_counter!(
        "bft_stable_checkpoints_total",
        "Total number of stable checkpoints"
    )
    .expect("Failed to create STABLE_CHECKPOINTS metric");

    /// View-changes started
    pub static ref VIEW_CHANGES: IntCounter = register_int_counter!(
        "bft_view_changes_total",
        "Total number of view-changes started"
    )
    .expect("Failed to create VIEW_CHANGES metric");

    /// New views installed
    pub static ref NEW_VIEWS: IntCounter = register_int_counter!(
        "bft_new_views_total",
        "Total number of new views installed"
    )
    .expect("Failed to create NEW_VIEWS metric");

    /// Dropped inbound messages, labeled by reason
    pub static ref MESSAGES_DROPPED: IntCounterVec = register_int_counter_vec!(
        "bft_messages_dropped_total",
        "Total number of inbound messages dropped",
        &["reason"]
    )
    .expect("Failed to create MESSAGES_DROPPED metric");

    /// Status messages broadcast
    pub static ref STATUS_SENT: IntCounter = register_int_counter!(
        "bft_status_sent_total",
        "Total number of status messages sent"
    )
    .expect("Failed to create STATUS_SENT metric");

    /// Current view
    pub static ref VIEW: IntGauge = register_int_gauge!(
        "bft_view",
        "Current view of this replica"
    )
    .expect("Failed to create VIEW metric");

    /// Last executed sequence number
    pub static ref LAST_EXECUTED: IntGauge = register_int_gauge!(
        "bft_last_executed",
        "Last sequence number executed"
    )
    .expect("Failed to create LAST_EXECUTED metric");

    /// Last stable checkpoint
    pub static ref LAST_STABLE: IntGauge = register_int_gauge!(
        "bft_last_stable",
        "Sequence number of the last stable checkpoint"
    )
    .expect("Failed to create LAST_STABLE metric");
}

/// Record requests placed in a pre-prepare
#[cfg(feature = "metrics")]
pub fn record_requests_ordered(count: usize) {
    REQUESTS_ORDERED.inc_by(count as u64);
}

/// Record an executed sequence number
#[cfg(feature = "metrics")]
pub fn record_seqno_executed(seqno: u64) {
    SEQNOS_EXECUTED.inc();
    LAST_EXECUTED.set(seqno as i64);
}

/// Record a stable checkpoint
#[cfg(feature = "metrics")]
pub fn record_stable_checkpoint(seqno: u64) {
    STABLE_CHECKPOINTS.inc();
    LAST_STABLE.set(seqno as i64);
}

/// Record a view-change this replica started
#[cfg(feature = "metrics")]
pub fn record_view_change(view: u64) {
    VIEW_CHANGES.inc();
    VIEW.set(view as i64);
}

/// Record an installed new view
#[cfg(feature = "metrics")]
pub fn record_new_view(view: u64) {
    NEW_VIEWS.inc();
    VIEW.set(view as i64);
}

/// Record a dropped message with reason
#[cfg(feature = "metrics")]
pub fn record_message_dropped(reason: &str) {
    MESSAGES_DROPPED.with_label_values(&[reason]).inc();
}

/// Record a status broadcast
#[cfg(feature = "metrics")]
pub fn record_status_sent() {
    STATUS_SENT.inc();
}

// No-op implementations when metrics feature is disabled
#[cfg(not(feature = "metrics"))]
pub fn record_requests_ordered(_count: usize) {}

#[cfg(not(feature = "metrics"))]
pub fn record_seqno_executed(_seqno: u64) {}

#[cfg(not(feature = "metrics"))]
pub fn record_stable_checkpoint(_seqno: u64) {}

#[cfg(not(feature = "metrics"))]
pub fn record_view_change(_view: u64) {}

#[cfg(not(feature = "metrics"))]
pub fn record_new_view(_view: u64) {}

#[cfg(not(feature = "metrics"))]
pub fn record_message_dropped(_reason: &str) {}

#[cfg(not(feature = "metrics"))]
pub fn record_status_sent() {}
