//! # Checkpoints and Log Truncation
//!
//! Every `checkpoint_interval` executions the replicas exchange checkpoint
//! digests. A quorum makes the checkpoint stable, the window slides and the
//! log below it is discarded. A replica that fell behind the stable
//! checkpoints fetches state instead of replaying the log.

#[cfg(test)]
mod tests {
    use crate::sim::{put, SimClient, SimNetwork};
    use bft_agreement::{Destination, ReplicaEvent, StateSync, WireMessage};
    use std::time::Duration;

    /// Run `count` sequential puts through `client`.
    fn run_requests(net: &mut SimNetwork, client: &mut SimClient, count: usize) {
        for i in 0..count {
            let key = format!("key-{}", i % 16);
            let value = format!("value-{i}");
            assert!(
                client.execute(net, &put(&key, &value)).is_some(),
                "request {i} did not complete"
            );
        }
    }

    #[test]
    fn test_checkpoint_becomes_stable_and_truncates_log() {
        let mut net = SimNetwork::four();
        let mut client = SimClient::new(7, &net);
        run_requests(&mut net, &mut client, 130);

        for id in 0..4 {
            let node = net.node(id);
            assert_eq!(node.replica.last_executed(), 130);
            assert_eq!(node.replica.last_stable(), 128);
            assert!(!node.replica.in_window(1));
            assert!(!node.replica.in_window(128));
            assert!(node.replica.in_window(129));
            assert!(node.replica.in_window(384));
            assert!(!node.replica.in_window(385));
            assert!(node
                .events
                .contains(&ReplicaEvent::CheckpointStable { seqno: 128 }));
            assert_eq!(node.state.retained(), vec![128]);
        }
    }

    #[test]
    fn test_stale_checkpoints_do_not_move_window_back() {
        let mut net = SimNetwork::four();
        let mut client = SimClient::new(7, &net);
        run_requests(&mut net, &mut client, 129);
        assert_eq!(net.replica(3).last_stable(), 128);

        // Replay the checkpoint votes for 128 and an old one for 0.
        let digest = net.node(0).state.digest(128).expect("checkpoint at 128");
        for (seqno, digest) in [(128, digest), (0, digest)] {
            for sender in 0..3 {
                let vote = bft_agreement::domain::Checkpoint {
                    seqno,
                    digest,
                    stable: false,
                    sender,
                };
                let envelope = net.forge(sender, WireMessage::Checkpoint(vote));
                net.inject(Destination::Replica(3), envelope);
            }
        }
        net.run_until_quiet();

        assert_eq!(net.replica(3).last_stable(), 128);
        assert_eq!(net.replica(3).last_executed(), 129);
        let stable_events = net
            .node(3)
            .events
            .iter()
            .filter(|e| matches!(e, ReplicaEvent::CheckpointStable { .. }))
            .count();
        assert_eq!(stable_events, 1);
    }

    #[test]
    fn test_lagging_replica_fetches_stable_state() {
        let mut net = SimNetwork::four();
        let mut client = SimClient::new(7, &net);
        net.partition(3);
        run_requests(&mut net, &mut client, 130);
        assert_eq!(net.replica(3).last_executed(), 0);
        assert_eq!(net.replica(0).last_stable(), 128);

        net.clear_filters();
        net.settle(10, Duration::from_millis(200));

        let lagging = net.node(3);
        assert_eq!(lagging.replica.last_stable(), 128);
        assert_eq!(lagging.replica.last_executed(), 130);
        assert!(lagging
            .events
            .contains(&ReplicaEvent::StateFetched { seqno: 128 }));
        assert_eq!(lagging.store.snapshot(), net.node(0).store.snapshot());
    }
}
