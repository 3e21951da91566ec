//! # Shutdown and Restart
//!
//! A replica persists its protocol state on shutdown and rebuilds from it
//! on restart. It then catches up on what it missed through status
//! retransmission, without a full state transfer.

#[cfg(test)]
mod tests {
    use crate::sim::{put, SimClient, SimNetwork};
    use bft_agreement::PersistedReplica;
    use std::time::Duration;

    #[test]
    fn test_persisted_state_reflects_progress() {
        let mut net = SimNetwork::four();
        let mut client = SimClient::new(7, &net);
        for i in 0..3 {
            assert!(client.execute(&mut net, &put("k", &i.to_string())).is_some());
        }

        let bytes = net.shutdown(2);
        let persisted = PersistedReplica::decode(&bytes).expect("decodable snapshot");
        assert_eq!(persisted.view, 0);
        assert_eq!(persisted.last_executed, 3);
        assert_eq!(persisted.last_prepared, 3);
        assert_eq!(persisted.last_stable, 0);
        assert!(!persisted.limbo);
        assert!(net.node(2).is_crashed());
    }

    #[test]
    fn test_restarted_replica_catches_up() {
        let mut net = SimNetwork::four();
        let mut client = SimClient::new(7, &net);
        assert!(client.execute(&mut net, &put("a", "1")).is_some());

        let bytes = net.shutdown(2);
        assert!(client.execute(&mut net, &put("b", "2")).is_some());
        assert!(client.execute(&mut net, &put("c", "3")).is_some());
        assert_eq!(net.replica(0).last_executed(), 3);

        net.restart(2, &bytes);
        assert_eq!(net.replica(2).last_executed(), 1);
        net.settle(3, Duration::from_millis(200));

        let node = net.node(2);
        assert_eq!(node.replica.last_executed(), 3);
        assert_eq!(node.replica.view(), 0);
        assert_eq!(node.store.snapshot(), net.node(0).store.snapshot());
    }

    #[test]
    fn test_restarted_replica_takes_part_in_ordering() {
        let mut net = SimNetwork::four();
        let mut client = SimClient::new(7, &net);
        assert!(client.execute(&mut net, &put("a", "1")).is_some());
        let bytes = net.shutdown(1);
        net.restart(1, &bytes);

        // With replica 3 down, progress needs the restarted replica.
        net.crash(3);
        for i in 0..3 {
            assert!(client.execute(&mut net, &put("b", &i.to_string())).is_some());
        }
        assert_eq!(net.replica(1).last_executed(), 4);
        assert_eq!(net.replica(0).last_executed(), 4);
    }

    #[test]
    fn test_truncated_snapshot_is_rejected() {
        let mut net = SimNetwork::four();
        let bytes = net.shutdown(2);
        assert!(PersistedReplica::decode(&bytes).is_ok());
        assert!(PersistedReplica::decode(&bytes[..bytes.len() / 2]).is_err());
    }
}
