//! # Message Authenticators
//!
//! The tag carried after every wire message header.
//!
//! ## Variants
//!
//! | Variant | Produced by | Verified by |
//! |---------|-------------|-------------|
//! | `Macs` | any principal, one MAC per replica | the replica whose slot it is |
//! | `Signature` | replicas, for transferable proofs | anyone holding the public key |
//! | `None` | locally synthesized messages only | never accepted off the wire |

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, Bytes};

/// Length of a truncated session MAC.
pub const MAC_LEN: usize = 16;

/// Length of an Ed25519 signature.
pub const SIGNATURE_LEN: usize = 64;

/// A truncated keyed hash over the authenticated bytes.
pub type Mac = [u8; MAC_LEN];

/// Authenticator attached to a message.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Authenticator {
    /// No authenticator.
    #[default]
    None,
    /// MAC vector indexed by receiving replica.
    Macs(Vec<Mac>),
    /// Signature by the sending principal.
    Signature(#[serde_as(as = "Bytes")] [u8; SIGNATURE_LEN]),
}

impl Authenticator {
    /// MAC addressed to `replica`, if this is a MAC vector with that slot.
    pub fn mac_for(&self, replica: usize) -> Option<&Mac> {
        match self {
            Authenticator::Macs(macs) => macs.get(replica),
            _ => None,
        }
    }

    /// True if this is a signature.
    pub fn is_signature(&self) -> bool {
        matches!(self, Authenticator::Signature(_))
    }
}
