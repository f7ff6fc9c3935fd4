//! Router benchmarks for switchyard-core.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use switchyard_core::{ConnectionId, ConsistentHashRouter, HashRing, ServiceSession};
use switchyard_protocol::{InstanceType, RouteMetadata};

fn sessions(n: usize) -> Vec<Arc<ServiceSession>> {
    (0..n)
        .map(|i| {
            Arc::new(ServiceSession::new(
                InstanceType::Logic,
                format!("logic-{i}"),
                ConnectionId::generate(),
            ))
        })
        .collect()
}

fn bench_cached_route(c: &mut Criterion) {
    let mut group = c.benchmark_group("route_cached");
    for n in [2, 8, 32] {
        let router = ConsistentHashRouter::new();
        let eligible = sessions(n);
        let metadata = RouteMetadata::room("room-42");
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| router.route(black_box(&metadata), black_box(&eligible)))
        });
    }
    group.finish();
}

fn bench_ring_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_build");
    for n in [2, 8, 32] {
        let ids: Vec<String> = (0..n).map(|i| format!("logic-{i}")).collect();
        group.bench_with_input(BenchmarkId::from_parameter(n), &ids, |b, ids| {
            b.iter(|| HashRing::build(black_box(ids), 150))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_cached_route, bench_ring_build);
criterion_main!(benches);
