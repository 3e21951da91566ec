//! # Shared Types Crate
//!
//! Identities, digests and the message authenticator used across the
//! agreement workspace.
//!
//! ## Design Principles
//!
//! - **Single Source of Truth**: protocol-wide identifiers are defined here and
//!   nowhere else.
//! - **Envelope Authority**: the envelope's sender principal is the identity a
//!   receiver checks authenticators against; payload sender fields must agree
//!   with it.

pub mod entities;
pub mod envelope;
pub mod errors;

pub use entities::*;
pub use envelope::{Authenticator, Mac, MAC_LEN, SIGNATURE_LEN};
pub use errors::*;
