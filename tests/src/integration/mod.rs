//! # Integration Tests
//!
//! Whole-deployment scenarios. Everything except `runtime` runs on the
//! deterministic [`SimNetwork`](crate::sim::SimNetwork).

pub mod byzantine;
pub mod checkpoints;
pub mod normal_case;
pub mod persistence;
pub mod runtime;
pub mod view_change;
