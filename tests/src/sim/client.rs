//! Simulated client with one outstanding request.

use super::network::{SimNetwork, MASTER};
use bft_agreement::adapters::{decode_kv_result, KeyRingCrypto, KvCommand};
use bft_agreement::domain::{Reply, Request};
use bft_agreement::{
    ClientSession, CryptoService, Destination, Envelope, QuorumParams, WireMessage,
};
use shared_types::{Authenticator, ClientId, Principal};

pub struct SimClient {
    session: ClientSession,
    crypto: KeyRingCrypto,
}

impl SimClient {
    pub fn new(id: ClientId, net: &SimNetwork) -> Self {
        Self::for_quorum(id, net.quorum())
    }

    /// Client of a deployment that is not simulated.
    pub fn for_quorum(id: ClientId, quorum: QuorumParams) -> Self {
        Self {
            session: ClientSession::new(id, quorum, MASTER),
            crypto: KeyRingCrypto::new(Principal::Client(id), quorum.n, MASTER),
        }
    }

    pub fn id(&self) -> ClientId {
        self.session.id()
    }

    /// Build the next request without sending it.
    pub fn request(&mut self, command: &KvCommand, read_only: bool) -> Request {
        self.session.request(command.encode(), read_only)
    }

    /// Envelope carrying `request`, authenticated for every replica.
    pub fn envelope(&self, request: Request) -> Envelope {
        let mut envelope = Envelope::new(Principal::Client(self.id()), WireMessage::Request(request));
        let bytes = match envelope.signing_bytes() {
            Ok(bytes) => bytes,
            Err(e) => panic!("request cannot be encoded: {e}"),
        };
        envelope.auth = self.crypto.authenticate(&bytes);
        envelope
    }

    /// Multicast a new request to every replica.
    pub fn send(&mut self, net: &mut SimNetwork, command: &KvCommand) -> Request {
        let request = self.request(command, false);
        net.inject(Destination::AllReplicas, self.envelope(request.clone()));
        request
    }

    /// Multicast the outstanding request again.
    pub fn retransmit(&self, net: &mut SimNetwork) {
        if let Some(request) = self.session.outstanding() {
            net.inject(Destination::AllReplicas, self.envelope(request.clone()));
        }
    }

    /// Count authentic replies received so far. Returns the agreed reply
    /// once a reply certificate completes.
    pub fn poll(&mut self, net: &mut SimNetwork) -> Option<Reply> {
        let mut done = None;
        for envelope in net.take_client_messages(self.id()) {
            if let Some(agreed) = self.accept(&envelope) {
                done = Some(agreed);
            }
        }
        done
    }

    /// Count one envelope if it is an authentic reply.
    pub fn accept(&mut self, envelope: &Envelope) -> Option<Reply> {
        let WireMessage::Reply(reply) = &envelope.message else {
            return None;
        };
        if !self.authentic(envelope) {
            return None;
        }
        self.session.on_reply(reply.clone())
    }

    /// Send `command`, run the network and return the agreed result.
    pub fn execute(&mut self, net: &mut SimNetwork, command: &KvCommand) -> Option<Option<Vec<u8>>> {
        self.send(net, command);
        net.run_until_quiet();
        self.poll(net).and_then(|reply| decode_kv_result(&reply.result))
    }

    fn authentic(&self, envelope: &Envelope) -> bool {
        let (Authenticator::Macs(macs), Ok(bytes)) = (&envelope.auth, envelope.signing_bytes())
        else {
            return false;
        };
        match macs.as_slice() {
            [mac] => self.session.verify_reply(envelope.sender, &bytes, mac),
            _ => false,
        }
    }
}

/// `Put { key, value }` for string literals.
pub fn put(key: &str, value: &str) -> KvCommand {
    KvCommand::Put {
        key: key.as_bytes().to_vec(),
        value: value.as_bytes().to_vec(),
    }
}

pub fn get(key: &str) -> KvCommand {
    KvCommand::Get {
        key: key.as_bytes().to_vec(),
    }
}
