//! Adapters layer (Hexagonal Architecture)
//!
//! In-process implementations of the driven ports, used by the simulated
//! deployments in tests and by single-host embedders.

mod application;
mod clock;
mod crypto;
mod state_sync;
mod transport;

pub use application::*;
pub use clock::*;
pub use crypto::*;
pub use state_sync::*;
pub use transport::*;
