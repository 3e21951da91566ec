//! Events layer
//!
//! Protocol milestones the engine records for embedders and tests.

mod outgoing;

pub use outgoing::*;
