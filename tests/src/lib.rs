//! # BFT Agreement Test Suite
//!
//! Cross-crate tests and benchmarks for the agreement engine.
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! ├── sim/              # Deterministic network, simulated clients
//! │   ├── network.rs
//! │   └── client.rs
//! │
//! └── integration/      # Whole-deployment scenarios
//!     ├── normal_case.rs
//!     ├── checkpoints.rs
//!     ├── view_change.rs
//!     ├── byzantine.rs
//!     ├── persistence.rs
//!     └── runtime.rs    # Tokio runners over channels
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! # All tests
//! cargo test -p bft-tests
//!
//! # By category
//! cargo test -p bft-tests integration::view_change::
//! cargo test -p bft-tests integration::byzantine::
//!
//! # With engine logs
//! RUST_LOG=bft_agreement=debug cargo test -p bft-tests -- --nocapture
//!
//! # Benchmarks
//! cargo bench -p bft-tests
//! ```

pub mod integration;
pub mod sim;
