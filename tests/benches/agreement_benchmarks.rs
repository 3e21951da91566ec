//! # Agreement Benchmarks
//!
//! | Group | Measures |
//! |-------|----------|
//! | ordering | Requests ordered and executed end to end on four simulated replicas |
//! | wire | Envelope encode/decode of full pre-prepares |
//! | authenticators | MAC vector generation and verification |

use bft_agreement::adapters::KeyRingCrypto;
use bft_agreement::domain::{Batch, PrePrepare, Request};
use bft_agreement::{CryptoService, Envelope, WireMessage};
use bft_tests::sim::{put, SimClient, SimNetwork, MASTER};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use shared_types::Principal;
use std::time::Duration;

// ============================================================================
// ORDERING
// ============================================================================

fn bench_ordering(c: &mut Criterion) {
    let mut group = c.benchmark_group("ordering");
    group.measurement_time(Duration::from_secs(10));

    for count in [1usize, 10, 100] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("sequential_puts", count), &count, |b, &count| {
            b.iter(|| {
                let mut net = SimNetwork::four();
                let mut client = SimClient::new(1, &net);
                for i in 0..count {
                    let done = client.execute(&mut net, &put("key", &i.to_string()));
                    black_box(done);
                }
                black_box(net.delivered())
            })
        });
    }

    // Two checkpoints' worth of requests, including log truncation.
    group.sample_size(10);
    group.bench_function("through_checkpoint", |b| {
        b.iter(|| {
            let mut net = SimNetwork::four();
            let mut client = SimClient::new(1, &net);
            for i in 0..260 {
                client.execute(&mut net, &put(&format!("k{}", i % 32), "v"));
            }
            black_box(net.replica(0).last_stable())
        })
    });

    group.finish();
}

// ============================================================================
// WIRE
// ============================================================================

fn pre_prepare(requests: usize) -> Envelope {
    let client = KeyRingCrypto::new(Principal::Client(1), 4, MASTER);
    let batch: Vec<Request> = (0..requests as u64)
        .map(|i| {
            let mut request = Request::new(1, i + 1, vec![0xAB; 64]);
            client.authenticate_request(&mut request);
            request
        })
        .collect();
    let pp = PrePrepare::new(0, 1, Batch::new(batch, vec![], 1u64.to_le_bytes().to_vec()));
    Envelope::new(Principal::Replica(0), WireMessage::PrePrepare(pp))
}

fn bench_wire(c: &mut Criterion) {
    let mut group = c.benchmark_group("wire");

    for requests in [1usize, 16, 64] {
        let envelope = pre_prepare(requests);
        let bytes = envelope.encode().expect("encodable");
        group.throughput(Throughput::Bytes(bytes.len() as u64));

        group.bench_with_input(BenchmarkId::new("encode_pre_prepare", requests), &envelope, |b, env| {
            b.iter(|| black_box(env.encode()))
        });
        group.bench_with_input(BenchmarkId::new("decode_pre_prepare", requests), &bytes, |b, bytes| {
            b.iter(|| black_box(Envelope::decode(bytes, 1 << 20)))
        });
    }

    group.finish();
}

// ============================================================================
// AUTHENTICATORS
// ============================================================================

fn bench_authenticators(c: &mut Criterion) {
    let mut group = c.benchmark_group("authenticators");

    for replicas in [4usize, 7, 13] {
        let sender = KeyRingCrypto::new(Principal::Replica(0), replicas, MASTER);
        let receiver = KeyRingCrypto::new(Principal::Replica(1), replicas, MASTER);
        let message = vec![0x5A; 256];
        let auth = sender.authenticate(&message);

        group.bench_with_input(BenchmarkId::new("authenticate", replicas), &message, |b, m| {
            b.iter(|| black_box(sender.authenticate(m)))
        });
        group.bench_with_input(BenchmarkId::new("verify", replicas), &message, |b, m| {
            b.iter(|| black_box(receiver.verify(Principal::Replica(0), m, &auth)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_ordering, bench_wire, bench_authenticators);
criterion_main!(benches);
