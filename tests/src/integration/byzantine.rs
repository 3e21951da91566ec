//! # Faulty Replicas
//!
//! Up to f replicas may be silent or lie. A silent backup costs nothing; a
//! primary that proposes different batches to different backups cannot get
//! either committed and is voted out.

#[cfg(test)]
mod tests {
    use crate::sim::{put, SimClient, SimNetwork};
    use bft_agreement::domain::{Batch, PrePrepare};
    use bft_agreement::{Destination, WireMessage};
    use std::time::Duration;

    #[test]
    fn test_silent_backup_does_not_block_progress() {
        let mut net = SimNetwork::four();
        let mut client = SimClient::new(7, &net);
        net.crash(3);

        for i in 0..10 {
            assert!(client.execute(&mut net, &put("k", &i.to_string())).is_some());
        }
        for id in 0..3 {
            assert_eq!(net.replica(id).last_executed(), 10);
            assert_eq!(net.replica(id).view(), 0);
        }
        assert_eq!(net.replica(3).last_executed(), 0);
    }

    #[test]
    fn test_equivocating_primary_is_replaced() {
        let mut net = SimNetwork::four();
        let mut honest = SimClient::new(7, &net);
        let mut other = SimClient::new(8, &net);
        // Replica 0 is faulty: it stops following the protocol and only
        // sends what the test forges for it.
        net.crash(0);

        let a = honest.send(&mut net, &put("owner", "honest"));
        let b = other.request(&put("owner", "other"), false);
        net.run_until_quiet();

        let choices = 1u64.to_le_bytes().to_vec();
        let pp_a = PrePrepare::new(0, 1, Batch::new(vec![a], vec![], choices.clone()));
        let pp_b = PrePrepare::new(0, 1, Batch::new(vec![b], vec![], choices));
        assert_ne!(pp_a.digest(), pp_b.digest());
        for to in [1, 2] {
            let envelope = net.forge(0, WireMessage::PrePrepare(pp_a.clone()));
            net.inject(Destination::Replica(to), envelope);
        }
        let envelope = net.forge(0, WireMessage::PrePrepare(pp_b));
        net.inject(Destination::Replica(3), envelope);
        net.run_until_quiet();

        // Two backups prepared A, but three commits are needed.
        for id in 1..4 {
            assert_eq!(net.replica(id).last_executed(), 0);
        }
        assert_eq!(net.replica(1).snapshot().last_prepared, 1);
        assert_eq!(net.replica(3).snapshot().last_prepared, 0);

        net.advance(Duration::from_millis(1100));
        net.settle(5, Duration::from_millis(200));

        for id in 1..4 {
            let node = net.node(id);
            assert_eq!(node.replica.view(), 1);
            assert_eq!(node.executed(), vec![(1, vec![(7, 1)])]);
            assert_eq!(node.store.get(b"owner"), Some(b"honest".to_vec()));
        }
        assert!(honest.poll(&mut net).is_some());
    }

    #[test]
    fn test_tampered_request_is_not_ordered() {
        let mut net = SimNetwork::four();
        let mut client = SimClient::new(7, &net);
        let mut request = client.request(&put("k", "v"), false);
        // The envelope is re-authenticated but the request MACs no longer
        // match its content.
        request.command = put("k", "tampered").encode();
        net.inject(Destination::AllReplicas, client.envelope(request));
        net.run_until_quiet();

        for id in 0..4 {
            assert_eq!(net.replica(id).last_executed(), 0);
            assert_eq!(net.replica(id).snapshot().queued_requests, 0);
        }
        assert!(net.take_client_messages(7).is_empty());
    }

    #[test]
    fn test_pre_prepare_from_backup_is_ignored() {
        let mut net = SimNetwork::four();
        let mut client = SimClient::new(7, &net);
        let request = client.request(&put("k", "v"), false);
        let pp = PrePrepare::new(0, 1, Batch::new(vec![request], vec![], 1u64.to_le_bytes().to_vec()));

        let envelope = net.forge(2, WireMessage::PrePrepare(pp));
        net.inject(Destination::AllReplicas, envelope);
        net.run_until_quiet();

        for id in 0..4 {
            assert_eq!(net.replica(id).snapshot().last_prepared, 0);
            assert_eq!(net.replica(id).last_executed(), 0);
        }
    }
}
