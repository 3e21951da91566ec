//! # Normal-Case Ordering
//!
//! Four correct replicas order and execute client requests in the same
//! sequence, and clients accept results backed by f+1 matching replies.

#[cfg(test)]
mod tests {
    use crate::sim::{get, init_test_logging, put, SimClient, SimNetwork};
    use bft_agreement::adapters::KvCommand;
    use bft_agreement::ReplicaEvent;

    #[test]
    fn test_single_request_executes_everywhere() {
        init_test_logging();
        let mut net = SimNetwork::four();
        let mut client = SimClient::new(7, &net);

        let result = client.execute(&mut net, &put("k", "v"));
        assert_eq!(result, Some(None), "first put sees no previous value");

        for id in 0..4 {
            let node = net.node(id);
            assert_eq!(node.replica.last_executed(), 1);
            assert_eq!(node.store.get(b"k"), Some(b"v".to_vec()));
            assert_eq!(node.executed(), vec![(1, vec![(7, 1)])]);
        }
    }

    #[test]
    fn test_replicas_agree_on_sequence() {
        let mut net = SimNetwork::four();
        let mut alice = SimClient::new(1, &net);
        let mut bob = SimClient::new(2, &net);

        for round in 0..5 {
            let value = format!("{round}");
            assert!(alice.execute(&mut net, &put("shared", &value)).is_some());
            assert!(bob.execute(&mut net, &put("bob", &value)).is_some());
        }

        let reference = net.node(0).executed();
        assert_eq!(reference.len(), 10);
        for id in 1..4 {
            assert_eq!(net.node(id).executed(), reference);
            assert_eq!(net.node(id).store.snapshot(), net.node(0).store.snapshot());
        }
        let seqnos: Vec<_> = reference.iter().map(|(n, _)| *n).collect();
        assert_eq!(seqnos, (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn test_put_returns_previous_value() {
        let mut net = SimNetwork::four();
        let mut client = SimClient::new(3, &net);
        client.execute(&mut net, &put("k", "old"));
        let result = client.execute(&mut net, &put("k", "new"));
        assert_eq!(result, Some(Some(b"old".to_vec())));
    }

    #[test]
    fn test_read_only_request_needs_quorum_of_replies() {
        let mut net = SimNetwork::four();
        let mut client = SimClient::new(4, &net);
        client.execute(&mut net, &put("k", "v"));
        let executed_before = net.node(0).replica.last_executed();

        let request = client.request(&get("k"), true);
        net.inject(bft_agreement::Destination::AllReplicas, client.envelope(request));
        net.run_until_quiet();
        let reply = client.poll(&mut net).expect("read-only reply certificate");
        assert!(reply.tentative);
        assert_eq!(
            bft_agreement::adapters::decode_kv_result(&reply.result),
            Some(Some(b"v".to_vec()))
        );
        // Read-only requests bypass ordering.
        assert_eq!(net.node(0).replica.last_executed(), executed_before);
    }

    #[test]
    fn test_duplicate_request_is_not_reexecuted() {
        let mut net = SimNetwork::four();
        let mut client = SimClient::new(5, &net);
        let request = client.send(&mut net, &KvCommand::Delete { key: b"k".to_vec() });
        net.run_until_quiet();
        assert!(client.poll(&mut net).is_some());

        // A late retransmission of an executed request gets the cached reply.
        net.inject(bft_agreement::Destination::AllReplicas, client.envelope(request));
        net.run_until_quiet();
        assert_eq!(net.take_client_messages(5).len(), 4);
        for id in 0..4 {
            assert_eq!(net.node(id).replica.last_executed(), 1);
        }
    }

    #[test]
    fn test_executed_events_carry_batch_digest() {
        let mut net = SimNetwork::four();
        let mut client = SimClient::new(6, &net);
        client.execute(&mut net, &put("a", "1"));

        let digests: Vec<_> = (0..4)
            .map(|id| {
                net.node(id)
                    .events
                    .iter()
                    .find_map(|event| match event {
                        ReplicaEvent::Executed { digest, .. } => Some(*digest),
                        _ => None,
                    })
                    .expect("executed event")
            })
            .collect();
        assert!(digests.windows(2).all(|w| w[0] == w[1]));
    }
}
