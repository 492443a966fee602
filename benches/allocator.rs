//! Allocator benchmarks.

use clustermem::persistence::checksum::{block_checksum, buffer_checksum};
use clustermem::prelude::*;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::sync::Arc;
use std::time::Duration;

const BUFFER: usize = 32 * 1024;

fn start(buffers: usize) -> ClusterMemoryService {
    let sg = [SgElement::new(0x1000_0000, required_bytes(buffers))];
    let collaborators = Collaborators {
        segment: Arc::new(PersistentSegment::new(&sg).unwrap()),
        luns: LunSet::in_memory(&Layout::new(buffers)),
        peer_link: None,
        controller: Arc::new(LocalPersistenceController::new(false)),
        peer_alive: false,
    };
    let config = ServiceConfig::builder()
        .buffer_count(buffers)
        .build()
        .unwrap();
    let service = ClusterMemoryService::start(config, collaborators).unwrap();
    service.wait_until_running(Duration::from_secs(5)).unwrap();
    service
        .register_client(ClientRegistration::new(ClientId::TEST, PolicyKind::Simple))
        .unwrap();
    service
}

fn bench_alloc_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_free");

    for buffers_per_alloc in [1u64, 4, 16] {
        let service = start(64);
        let owner = OwnerId::create(ClientId::TEST, 1).unwrap();
        service
            .register_owner(owner, OwnerRegistration::default())
            .unwrap();
        let id = AllocationId::new(owner, 1);

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(
            BenchmarkId::from_parameter(buffers_per_alloc),
            &buffers_per_alloc,
            |b, n| {
                b.iter(|| {
                    service
                        .submit(BufferRequest::alloc(id, n * BUFFER as u64))
                        .unwrap();
                    service.submit(BufferRequest::free(id)).unwrap();
                });
            },
        );
        service.shutdown();
    }

    group.finish();
}

fn bench_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("commit");

    for len in [512usize, 4096, BUFFER] {
        let service = start(8);
        let owner = OwnerId::create(ClientId::TEST, 2).unwrap();
        service
            .register_owner(owner, OwnerRegistration::default())
            .unwrap();
        let id = AllocationId::new(owner, 1);
        service
            .submit(BufferRequest::alloc(id, BUFFER as u64))
            .unwrap();
        let payload = bytes::Bytes::from(vec![0x5Au8; len]);

        group.throughput(Throughput::Bytes(len as u64));
        group.bench_with_input(BenchmarkId::from_parameter(len), &payload, |b, payload| {
            b.iter(|| {
                service
                    .submit(BufferRequest::commit(id, 0, payload.clone()))
                    .unwrap();
                service
                    .submit(BufferRequest::new(Opcode::GetExclusiveLock, id))
                    .unwrap();
            });
        });
        service.shutdown();
    }

    group.finish();
}

fn bench_checksums(c: &mut Criterion) {
    let mut group = c.benchmark_group("checksum");
    let buffer = vec![0xA5u8; BUFFER];

    group.throughput(Throughput::Bytes(BUFFER as u64));
    group.bench_function("buffer", |b| {
        b.iter(|| std::hint::black_box(buffer_checksum(&buffer)));
    });
    group.throughput(Throughput::Bytes(512));
    group.bench_function("block", |b| {
        b.iter(|| std::hint::black_box(block_checksum(&buffer[..512])));
    });

    group.finish();
}

criterion_group!(benches, bench_alloc_free, bench_commit, bench_checksums);
criterion_main!(benches);
