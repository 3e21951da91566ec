//! # Session Keys
//!
//! Every ordered pair of principals shares a symmetric key derived from a
//! deployment secret. Replicas rotate the keys they accept inbound by bumping
//! an epoch and announcing it; senders then MAC with the receiver's latest
//! announced epoch. Client channels stay at epoch zero.
//!
//! ```text
//! key(from → to, epoch) = derive("pbft-session-key", master ‖ from ‖ to ‖ epoch)
//! ```

use crate::errors::CryptoError;
use crate::hashing::blake3_derive_key;
use crate::mac::{compute_mac, verify_mac};
use shared_types::{Mac, Principal, ReplicaId};
use zeroize::Zeroizing;

const SESSION_KEY_CONTEXT: &str = "pbft-session-key v1";

/// Session key state held by one principal.
pub struct SessionKeys {
    me: Principal,
    master: Zeroizing<[u8; 32]>,
    /// Epoch of the keys this principal accepts (replicas only).
    inbound_epoch: u64,
    /// Latest epoch announced by each replica.
    peer_epochs: Vec<u64>,
}

impl SessionKeys {
    /// Create key state for `me` in a group of `replica_count` replicas.
    pub fn new(me: Principal, replica_count: usize, master: [u8; 32]) -> Self {
        Self {
            me,
            master: Zeroizing::new(master),
            inbound_epoch: 0,
            peer_epochs: vec![0; replica_count],
        }
    }

    /// Owner of this key state.
    pub fn owner(&self) -> Principal {
        self.me
    }

    /// Number of replicas keyed.
    pub fn replica_count(&self) -> usize {
        self.peer_epochs.len()
    }

    /// Epoch of the keys currently accepted inbound.
    pub fn inbound_epoch(&self) -> u64 {
        self.inbound_epoch
    }

    /// Start a new inbound epoch. Messages MAC'd under older keys stop verifying.
    pub fn rotate(&mut self) -> u64 {
        self.inbound_epoch += 1;
        if let Principal::Replica(id) = self.me {
            if let Some(epoch) = self.peer_epochs.get_mut(id) {
                *epoch = self.inbound_epoch;
            }
        }
        self.inbound_epoch
    }

    /// Record that `replica` now accepts keys of `epoch`.
    ///
    /// Returns `Ok(false)` when the announcement is not newer than what is known.
    pub fn accept_epoch(&mut self, replica: ReplicaId, epoch: u64) -> Result<bool, CryptoError> {
        let replica_count = self.peer_epochs.len();
        let known = self
            .peer_epochs
            .get_mut(replica)
            .ok_or(CryptoError::UnknownReplica {
                replica,
                replica_count,
            })?;
        if epoch <= *known {
            return Ok(false);
        }
        *known = epoch;
        Ok(true)
    }

    /// MAC vector over `data`, one slot per replica.
    pub fn authenticator(&self, data: &[u8]) -> Vec<Mac> {
        (0..self.peer_epochs.len())
            .map(|replica| self.mac_to(replica, data))
            .collect()
    }

    /// MAC over `data` for a single receiving replica.
    pub fn mac_to(&self, replica: ReplicaId, data: &[u8]) -> Mac {
        let epoch = self.peer_epochs.get(replica).copied().unwrap_or(0);
        let key = self.pair_key(self.me, Principal::Replica(replica), epoch);
        compute_mac(&key, data)
    }

    /// MAC over `data` for any receiving principal.
    pub fn mac_for(&self, to: Principal, data: &[u8]) -> Mac {
        match to {
            Principal::Replica(replica) => self.mac_to(replica, data),
            Principal::Client(_) => compute_mac(&self.pair_key(self.me, to, 0), data),
        }
    }

    /// Check a MAC that `sender` addressed to this principal.
    pub fn verify_from(&self, sender: Principal, data: &[u8], mac: &Mac) -> bool {
        let epoch = match sender {
            Principal::Replica(_) => self.inbound_epoch,
            Principal::Client(_) => 0,
        };
        let key = self.pair_key(sender, self.me, epoch);
        verify_mac(&key, data, mac)
    }

    fn pair_key(&self, from: Principal, to: Principal, epoch: u64) -> Zeroizing<[u8; 32]> {
        let epoch = match (from, to) {
            (Principal::Client(_), _) | (_, Principal::Client(_)) => 0,
            _ => epoch,
        };
        let mut material = Zeroizing::new(Vec::with_capacity(32 + 2 * 9 + 8));
        material.extend_from_slice(&self.master[..]);
        encode_principal(&mut material, from);
        encode_principal(&mut material, to);
        material.extend_from_slice(&epoch.to_le_bytes());
        Zeroizing::new(blake3_derive_key(SESSION_KEY_CONTEXT, &material))
    }
}

fn encode_principal(out: &mut Vec<u8>, principal: Principal) {
    match principal {
        Principal::Replica(id) => {
            out.push(0);
            out.extend_from_slice(&(id as u64).to_le_bytes());
        }
        Principal::Client(id) => {
            out.push(1);
            out.extend_from_slice(&id.to_le_bytes());
        }
    }
}
