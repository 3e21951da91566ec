//! # Tokio Runtime
//!
//! Four replicas, each behind a [`ReplicaRunner`] task, exchange encoded
//! envelopes over bounded channels in real time. A client submits requests
//! to every inbox and waits for a reply certificate.

#[cfg(test)]
mod tests {
    use crate::sim::{init_test_logging, put, test_config, SimClient, MASTER};
    use bft_agreement::adapters::{
        decode_kv_result, InMemoryStateSync, KeyRingCrypto, KvApplication, KvStore,
        SharedCheckpointStore,
    };
    use bft_agreement::{
        ChannelTransport, Envelope, Replica, ReplicaApi, ReplicaDependencies, ReplicaHandle,
        ReplicaRunner, ReplicaService,
    };
    use shared_types::Principal;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    const CLIENT: u64 = 7;
    const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

    type Service = ReplicaService<ChannelTransport, KeyRingCrypto, InMemoryStateSync, KvApplication>;

    struct Deployment {
        transport: Arc<ChannelTransport>,
        handles: Vec<ReplicaHandle>,
        services: Vec<Arc<Service>>,
        stores: Vec<KvStore>,
        tasks: Vec<JoinHandle<bft_agreement::AgreementResult<Vec<u8>>>>,
        max_message_size: usize,
    }

    fn deploy() -> Deployment {
        let config = test_config();
        let weak = config.quorum().weak();
        let transport = Arc::new(ChannelTransport::new());
        let registry = SharedCheckpointStore::new();
        let mut deployment = Deployment {
            transport: Arc::clone(&transport),
            handles: Vec::new(),
            services: Vec::new(),
            stores: Vec::new(),
            tasks: Vec::new(),
            max_message_size: config.max_message_size,
        };

        for id in 0..config.replica_count {
            let store = KvStore::new();
            let deps = ReplicaDependencies {
                transport: Arc::clone(&transport),
                crypto: Arc::new(KeyRingCrypto::new(
                    Principal::Replica(id),
                    config.replica_count,
                    MASTER,
                )),
                state: Arc::new(InMemoryStateSync::new(
                    id,
                    store.clone(),
                    Arc::clone(&registry),
                    weak,
                )),
                app: Arc::new(KvApplication::new(store.clone())),
                config: config.clone(),
            };
            let replica = Replica::new(id, deps).expect("valid configuration");
            let service = Arc::new(ReplicaService::new(replica));
            let (runner, handle) = ReplicaRunner::new(
                Arc::clone(&service),
                config.max_message_size,
                Duration::from_millis(10),
            );
            transport.connect_replica(id, handle.sender());
            deployment.tasks.push(tokio::spawn(runner.run()));
            deployment.handles.push(handle);
            deployment.services.push(service);
            deployment.stores.push(store);
        }
        deployment
    }

    async fn submit_all(deployment: &Deployment, envelope: &Envelope) {
        let bytes = envelope.encode().expect("encodable request");
        for handle in &deployment.handles {
            handle.submit(bytes.clone()).await.expect("runner is alive");
        }
    }

    async fn await_reply(
        client: &mut SimClient,
        inbox: &mut mpsc::Receiver<Vec<u8>>,
        max_message_size: usize,
    ) -> bft_agreement::domain::Reply {
        loop {
            let bytes = tokio::time::timeout(REPLY_TIMEOUT, inbox.recv())
                .await
                .expect("reply before the timeout")
                .expect("client channel open");
            let Ok(envelope) = Envelope::decode(&bytes, max_message_size) else {
                continue;
            };
            if let Some(reply) = client.accept(&envelope) {
                return reply;
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_replicas_order_requests_over_channels() {
        init_test_logging();
        bft_telemetry::register_metrics().expect("host metrics");
        let deployment = deploy();
        let (client_tx, mut inbox) = mpsc::channel(256);
        deployment.transport.register_client(CLIENT, client_tx);

        let mut client = SimClient::for_quorum(CLIENT, test_config().quorum());
        for i in 0..5 {
            let request = client.request(&put("counter", &i.to_string()), false);
            submit_all(&deployment, &client.envelope(request)).await;
            let reply = await_reply(&mut client, &mut inbox, deployment.max_message_size).await;
            let previous = decode_kv_result(&reply.result).expect("kv result");
            let expected = (i > 0).then(|| (i - 1).to_string().into_bytes());
            assert_eq!(previous, expected);
        }

        // Replies need f+1 replicas; give the slowest one time to catch up.
        for service in &deployment.services {
            let mut executed = 0;
            for _ in 0..100 {
                executed = service.snapshot().await.expect("running").last_executed;
                if executed == 5 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            assert_eq!(executed, 5);
        }
        for store in &deployment.stores[1..] {
            assert_eq!(store.snapshot(), deployment.stores[0].snapshot());
        }

        // Closing every route stops the runners, which persist on the way out.
        deployment.transport.disconnect_all();
        drop(deployment.handles);
        for task in deployment.tasks {
            let persisted = task.await.expect("runner task").expect("clean shutdown");
            assert!(!persisted.is_empty());
        }
        for service in &deployment.services {
            assert!(service.tick().await.is_err());
        }

        let metrics = bft_telemetry::encode_metrics().expect("metrics encode");
        assert!(metrics.contains("bft_host_messages_received_total"));
    }
}
