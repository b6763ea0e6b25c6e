//! Benchmarks for kernel hot paths
//!
//! Run with: cargo bench
//!
//! Measures entity creation, query iteration (sequential and chunk-parallel)
//! and frame-capture serialization pressure.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use fdp_kernel::{DataPolicy, Repository};

#[derive(Debug, Copy, Clone)]
struct Position {
    x: f32,
    y: f32,
    z: f32,
}

#[derive(Debug, Copy, Clone)]
struct Velocity {
    x: f32,
    y: f32,
    z: f32,
}

fn populated(count: u32) -> Repository {
    let mut repo = Repository::new();
    repo.register_unmanaged::<Position>(DataPolicy::RECORDABLE).unwrap();
    repo.register_unmanaged::<Velocity>(DataPolicy::RECORDABLE).unwrap();
    for i in 0..count {
        let entity = repo.create_entity().unwrap();
        repo.add_component(entity, Position { x: i as f32, y: 0.0, z: 0.0 })
            .unwrap();
        repo.add_component(entity, Velocity { x: 1.0, y: 2.0, z: 3.0 })
            .unwrap();
    }
    repo
}

fn bench_create(c: &mut Criterion) {
    let mut group = c.benchmark_group("create");

    group.bench_function("create_10k_two_components", |b| {
        b.iter(|| {
            let repo = populated(10_000);
            black_box(repo.entity_count())
        });
    });

    group.finish();
}

fn bench_iteration(c: &mut Criterion) {
    let mut group = c.benchmark_group("iterate");

    for count in [10_000u32, 100_000] {
        let mut repo = populated(count);

        group.bench_with_input(BenchmarkId::new("sequential", count), &count, |b, _| {
            let query = repo.query().write::<Position>().with::<Velocity>().build();
            b.iter(|| {
                query.for_each_chunk_mut(&mut repo, |mut chunk| {
                    let (positions, velocities) =
                        chunk.slice_pair_mut::<Position, Velocity>().unwrap();
                    for (pos, vel) in positions.iter_mut().zip(velocities) {
                        pos.x += vel.x * 0.016;
                        pos.y += vel.y * 0.016;
                        pos.z += vel.z * 0.016;
                    }
                });
            });
        });

        #[cfg(feature = "parallel")]
        group.bench_with_input(BenchmarkId::new("parallel", count), &count, |b, _| {
            let query = repo.query().write::<Position>().with::<Velocity>().build();
            b.iter(|| {
                query.for_each_parallel(&mut repo, |mut chunk| {
                    let (positions, velocities) =
                        chunk.slice_pair_mut::<Position, Velocity>().unwrap();
                    for (pos, vel) in positions.iter_mut().zip(velocities) {
                        pos.x += vel.x * 0.016;
                        pos.y += vel.y * 0.016;
                        pos.z += vel.z * 0.016;
                    }
                });
            });
        });
    }

    group.finish();
}

fn bench_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("tick");

    group.bench_function("tick_100k_idle", |b| {
        let mut repo = populated(100_000);
        b.iter(|| {
            repo.tick(0.016);
            black_box(repo.global_version())
        });
    });

    group.finish();
}

criterion_group!(benches, bench_create, bench_iteration, bench_tick);
criterion_main!(benches);
