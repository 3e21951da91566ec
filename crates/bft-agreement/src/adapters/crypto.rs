//! Crypto adapter backed by derived session keys
//!
//! Every principal derives its pairwise MAC keys and the replicas' signing
//! keys from one deployment secret. Suitable for simulations and single-host
//! deployments; real deployments distribute public keys out of band.

use crate::domain::Request;
use crate::ports::CryptoService;
use parking_lot::RwLock;
use shared_crypto::{
    blake3_digest, derive_public_keys, Ed25519KeyPair, Ed25519PublicKey, Ed25519Signature,
    SessionKeys,
};
use shared_types::{Authenticator, Digest, Mac, Principal, ReplicaId};

fn signing_label(replica: ReplicaId) -> Vec<u8> {
    format!("replica-{replica}").into_bytes()
}

/// [`CryptoService`] for one principal.
pub struct KeyRingCrypto {
    me: Principal,
    keys: RwLock<SessionKeys>,
    /// Present for replicas only.
    signing: Option<Ed25519KeyPair>,
    public_keys: Vec<Ed25519PublicKey>,
}

impl KeyRingCrypto {
    pub fn new(me: Principal, replica_count: usize, master: [u8; 32]) -> Self {
        let public_keys = derive_public_keys(&master, replica_count, signing_label);
        let signing = me
            .replica()
            .map(|r| Ed25519KeyPair::derive(&master, &signing_label(r)));
        Self {
            me,
            keys: RwLock::new(SessionKeys::new(me, replica_count, master)),
            signing,
            public_keys,
        }
    }

    pub fn principal(&self) -> Principal {
        self.me
    }

    /// Fill `request.auth` with this client's MAC vector.
    pub fn authenticate_request(&self, request: &mut Request) {
        request.auth = self.keys.read().authenticator(&request.content_bytes());
    }

    /// Slot of `macs` addressed to this principal.
    fn my_mac<'a>(&self, macs: &'a [Mac]) -> Option<&'a Mac> {
        if macs.len() == 1 {
            return macs.first();
        }
        self.me.replica().and_then(|r| macs.get(r))
    }
}

impl CryptoService for KeyRingCrypto {
    fn digest(&self, bytes: &[u8]) -> Digest {
        blake3_digest(bytes)
    }

    fn authenticate(&self, bytes: &[u8]) -> Authenticator {
        Authenticator::Macs(self.keys.read().authenticator(bytes))
    }

    fn authenticate_to(&self, to: Principal, bytes: &[u8]) -> Authenticator {
        Authenticator::Macs(vec![self.keys.read().mac_for(to, bytes)])
    }

    fn verify(&self, sender: Principal, bytes: &[u8], auth: &Authenticator) -> bool {
        match auth {
            Authenticator::Macs(macs) => match self.my_mac(macs) {
                Some(mac) => self.keys.read().verify_from(sender, bytes, mac),
                None => false,
            },
            Authenticator::Signature(_) => match sender {
                Principal::Replica(r) => self.verify_signature(r, bytes, auth),
                Principal::Client(_) => false,
            },
            Authenticator::None => false,
        }
    }

    fn sign(&self, bytes: &[u8]) -> Authenticator {
        match &self.signing {
            Some(keypair) => Authenticator::Signature(*keypair.sign(bytes).as_bytes()),
            None => Authenticator::None,
        }
    }

    fn verify_signature(&self, signer: ReplicaId, bytes: &[u8], auth: &Authenticator) -> bool {
        let (Authenticator::Signature(sig), Some(key)) = (auth, self.public_keys.get(signer)) else {
            return false;
        };
        key.verify(bytes, &Ed25519Signature::from_bytes(*sig)).is_ok()
    }

    fn verify_request(&self, request: &Request) -> bool {
        let Some(r) = self.me.replica() else {
            return false;
        };
        match request.auth.get(r) {
            Some(mac) => self.keys.read().verify_from(
                Principal::Client(request.client_id),
                &request.content_bytes(),
                mac,
            ),
            None => false,
        }
    }

    fn rotate_keys(&self) -> u64 {
        self.keys.write().rotate()
    }

    fn accept_key_epoch(&self, sender: ReplicaId, epoch: u64) -> bool {
        match self.keys.write().accept_epoch(sender, epoch) {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(sender, error = %e, "[bft] key announcement from unknown replica");
                false
            }
        }
    }
}
