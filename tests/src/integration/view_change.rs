//! # View Changes
//!
//! When the primary stops making progress the backups time out, agree on
//! the next view and its primary re-proposes every request that may have
//! committed. Requests committed or prepared in the old view keep their
//! sequence numbers; gaps are filled with null requests.

#[cfg(test)]
mod tests {
    use crate::sim::{init_test_logging, put, SimClient, SimNetwork};
    use bft_agreement::domain::Batch;
    use bft_agreement::{ExecutionPolicy, ReplicaEvent, WireMessage};
    use shared_types::Principal;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_millis(1100);

    fn assert_live_replicas_agree(net: &SimNetwork) {
        let live = net.live();
        let reference = net.node(live[0]).executed();
        for id in &live[1..] {
            assert_eq!(net.node(*id).executed(), reference, "replica {id} diverged");
        }
        assert_live_replicas_agree_on_state(net);
    }

    fn assert_live_replicas_agree_on_state(net: &SimNetwork) {
        let live = net.live();
        for id in &live[1..] {
            assert_eq!(
                net.node(*id).store.snapshot(),
                net.node(live[0]).store.snapshot()
            );
        }
    }

    #[test]
    fn test_crashed_primary_is_replaced() {
        init_test_logging();
        let mut net = SimNetwork::four();
        let mut client = SimClient::new(7, &net);
        for i in 0..3 {
            assert!(client.execute(&mut net, &put("k", &i.to_string())).is_some());
        }

        net.crash(0);
        client.send(&mut net, &put("after", "crash"));
        net.run_until_quiet();
        assert!(client.poll(&mut net).is_none());

        net.advance(TIMEOUT);
        let reply = client.poll(&mut net).expect("reply in the new view");
        assert_eq!(reply.view, 1);

        for id in net.live() {
            let node = net.node(id);
            assert_eq!(node.replica.view(), 1);
            assert_eq!(node.replica.primary(), 1);
            assert!(node.replica.has_new_view());
            assert_eq!(node.replica.last_executed(), 4);
            assert_eq!(node.store.get(b"after"), Some(b"crash".to_vec()));
            assert!(node
                .events
                .contains(&ReplicaEvent::ViewChangeStarted { view: 1 }));
            assert!(node.events.iter().any(|e| matches!(
                e,
                ReplicaEvent::NewViewInstalled { view: 1, .. }
            )));
        }
        assert_live_replicas_agree(&net);
    }

    #[test]
    fn test_partially_proposed_request_executes_once() {
        let mut net = SimNetwork::four();
        let mut client = SimClient::new(7, &net);
        for i in 0..4 {
            assert!(client.execute(&mut net, &put("k", &i.to_string())).is_some());
        }

        // The pre-prepare for 5 reaches only replica 1, then the primary dies.
        net.add_filter(Box::new(|from, to, message| {
            matches!(message, WireMessage::PrePrepare(pp) if pp.seqno == 5)
                && from == Principal::Replica(0)
                && matches!(to, Principal::Replica(2) | Principal::Replica(3))
        }));
        client.send(&mut net, &put("fifth", "5"));
        net.run_until_quiet();
        net.crash(0);
        net.clear_filters();
        for id in 1..4 {
            assert_eq!(net.replica(id).last_executed(), 4);
        }

        net.advance(TIMEOUT);
        assert!(client.poll(&mut net).is_some());

        for id in net.live() {
            let executed = net.node(id).executed();
            let seqnos: Vec<_> = executed.iter().map(|(n, _)| *n).collect();
            assert_eq!(seqnos, (1..=seqnos.len() as u64).collect::<Vec<_>>(), "no gaps");

            // Whatever the new view did with seqno 5, the request ran once
            // after the old ones and anything else there is a null request.
            let tail = &executed[4..];
            let runs: Vec<_> = tail.iter().filter(|(_, batch)| batch == &vec![(7, 5)]).collect();
            assert_eq!(runs.len(), 1);
            assert!(tail
                .iter()
                .all(|(_, batch)| batch.is_empty() || batch == &vec![(7, 5)]));
            assert_eq!(net.node(id).store.get(b"fifth"), Some(b"5".to_vec()));
        }
        assert_live_replicas_agree(&net);
    }

    #[test]
    fn test_unprepared_proposal_is_replaced_by_null_request() {
        init_test_logging();
        let mut net = SimNetwork::four();
        let mut client = SimClient::new(7, &net);
        for i in 0..4 {
            assert!(client.execute(&mut net, &put("k", &i.to_string())).is_some());
        }

        // Only the new primary ever sees the pre-prepare for 5, so it cannot
        // have prepared and the next view must fill 5 with a null request.
        net.add_filter(Box::new(|from, to, message| {
            matches!(message, WireMessage::PrePrepare(pp) if pp.seqno == 5)
                && from == Principal::Replica(0)
                && to != Principal::Replica(1)
        }));
        client.send(&mut net, &put("fifth", "5"));
        net.run_until_quiet();
        net.crash(0);
        net.clear_filters();

        net.advance(TIMEOUT);
        let reply = client.poll(&mut net).expect("reply in the new view");
        assert_eq!(reply.view, 1);

        let null_digest = Batch::empty().digest();
        for id in net.live() {
            let node = net.node(id);
            assert_eq!(node.replica.view(), 1);
            assert!(node.events.contains(&ReplicaEvent::NewViewInstalled {
                view: 1,
                min: 0,
                max: 6
            }));

            let executed = node.executed();
            assert_eq!(executed.len(), 6);
            assert_eq!(executed[4], (5, vec![]));
            assert_eq!(executed[5], (6, vec![(7, 5)]));
            assert!(node.events.iter().any(|e| matches!(
                e,
                ReplicaEvent::Executed { seqno: 5, digest, .. } if *digest == null_digest
            )));
        }
        assert_live_replicas_agree(&net);
    }

    #[test]
    fn test_prepared_request_survives_view_change() {
        let mut net = SimNetwork::four();
        let mut client = SimClient::new(7, &net);
        for i in 0..2 {
            assert!(client.execute(&mut net, &put("k", &i.to_string())).is_some());
        }

        // Seqno 3 prepares everywhere but no commit gets through in view 0.
        net.add_filter(Box::new(|_, _, message| {
            matches!(message, WireMessage::Commit(c) if c.seqno == 3 && c.view == 0)
        }));
        client.send(&mut net, &put("third", "3"));
        net.run_until_quiet();
        for id in 0..4 {
            assert_eq!(net.replica(id).last_executed(), 2);
            assert_eq!(net.replica(id).snapshot().last_prepared, 3);
        }

        net.crash(0);
        net.clear_filters();
        net.advance(TIMEOUT);

        for id in net.live() {
            let node = net.node(id);
            assert_eq!(node.replica.view(), 1);
            assert_eq!(node.executed()[2], (3, vec![(7, 3)]));
            assert_eq!(node.store.get(b"third"), Some(b"3".to_vec()));
        }
        assert!(client.poll(&mut net).is_some());
        assert_live_replicas_agree(&net);
    }

    #[test]
    fn test_tentative_execution_rolls_back_and_reruns() {
        let config = bft_agreement::ReplicaConfig {
            execution: ExecutionPolicy::Tentative,
            ..crate::sim::test_config()
        };
        let mut net = SimNetwork::new(config);
        let mut client = SimClient::new(7, &net);
        for i in 0..2 {
            assert!(client.execute(&mut net, &put("k", &i.to_string())).is_some());
        }

        // Seqno 3 prepares and runs tentatively, but never commits in view 0.
        net.add_filter(Box::new(|_, _, message| {
            matches!(message, WireMessage::Commit(c) if c.seqno == 3 && c.view == 0)
        }));
        client.send(&mut net, &put("third", "3"));
        net.run_until_quiet();
        let reply = client.poll(&mut net).expect("tentative reply certificate");
        assert!(reply.tentative);
        for id in 0..4 {
            let status = net.replica(id).snapshot();
            assert_eq!(status.last_executed, 2);
            assert_eq!(status.last_tentative_execute, 3);
            assert_eq!(net.node(id).store.get(b"third"), Some(b"3".to_vec()));
        }

        // The view change undoes everything since checkpoint 0 and the new
        // view runs the same three requests again.
        net.crash(0);
        net.clear_filters();
        net.advance(TIMEOUT);

        for id in net.live() {
            let node = net.node(id);
            assert_eq!(node.replica.view(), 1);
            let status = node.replica.snapshot();
            assert_eq!(status.last_executed, 3);
            assert_eq!(status.last_tentative_execute, 3);

            let started = node
                .events
                .iter()
                .position(|e| *e == ReplicaEvent::ViewChangeStarted { view: 1 })
                .expect("view change started");
            let rerun: Vec<_> = node.events[started..]
                .iter()
                .filter_map(|e| match e {
                    ReplicaEvent::Executed { seqno, requests, .. } => Some((*seqno, requests.clone())),
                    _ => None,
                })
                .collect();
            assert_eq!(
                rerun,
                vec![(1, vec![(7, 1)]), (2, vec![(7, 2)]), (3, vec![(7, 3)])]
            );
            assert_eq!(node.store.get(b"k"), Some(b"1".to_vec()));
            assert_eq!(node.store.get(b"third"), Some(b"3".to_vec()));
        }
        assert_live_replicas_agree_on_state(&net);
    }

    #[test]
    fn test_progress_continues_after_view_change() {
        let mut net = SimNetwork::four();
        let mut client = SimClient::new(7, &net);
        net.crash(0);
        client.send(&mut net, &put("a", "1"));
        net.run_until_quiet();
        net.advance(TIMEOUT);
        assert!(client.poll(&mut net).is_some());

        for i in 0..5 {
            assert!(client.execute(&mut net, &put("b", &i.to_string())).is_some());
        }
        for id in net.live() {
            assert_eq!(net.replica(id).last_executed(), 6);
            assert_eq!(net.replica(id).view(), 1);
        }
        assert_live_replicas_agree(&net);
    }

    #[test]
    fn test_backoff_moves_past_two_faulty_primaries() {
        // Seven replicas tolerate two faults.
        let config = bft_agreement::ReplicaConfig {
            replica_count: 7,
            ..crate::sim::test_config()
        };
        let mut net = SimNetwork::new(config);
        let mut client = SimClient::new(7, &net);
        net.crash(0);
        net.crash(1);
        client.send(&mut net, &put("k", "v"));
        net.run_until_quiet();

        // View 1 has a crashed primary too, so the replicas move on to view 2.
        net.advance(TIMEOUT);
        net.advance(Duration::from_millis(2200));
        assert!(client.poll(&mut net).is_some());

        for id in net.live() {
            assert_eq!(net.replica(id).view(), 2);
            assert_eq!(net.replica(id).last_executed(), 1);
        }
        assert_live_replicas_agree(&net);
    }
}
