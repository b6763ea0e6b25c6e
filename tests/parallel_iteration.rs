#![cfg(feature = "parallel")]

use fdp_kernel::{DataPolicy, Repository};

#[derive(Clone, Copy, Debug, PartialEq)]
struct Position {
    x: f32,
    y: f32,
    z: f32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct Velocity {
    x: f32,
    y: f32,
    z: f32,
}

const ENTITY_COUNT: u32 = 100_000;
const DT: f32 = 1.0 / 60.0;

fn populate() -> Repository {
    let mut repo = Repository::new();
    repo.register_unmanaged::<Position>(DataPolicy::NONE).unwrap();
    repo.register_unmanaged::<Velocity>(DataPolicy::NONE).unwrap();

    for i in 0..ENTITY_COUNT {
        let entity = repo.create_entity().unwrap();
        let f = i as f32;
        repo.add_component(entity, Position { x: f, y: f * 0.5, z: -f }).unwrap();
        repo.add_component(
            entity,
            Velocity {
                x: (i % 17) as f32 * 0.25,
                y: (i % 23) as f32 * -0.125,
                z: (i % 5) as f32,
            },
        )
        .unwrap();
    }
    repo
}

fn integrate_sequential(repo: &mut Repository) {
    let query = repo.query().write::<Position>().with::<Velocity>().build();
    query.for_each_chunk_mut(repo, |mut chunk| {
        let (positions, velocities) = chunk.slice_pair_mut::<Position, Velocity>().unwrap();
        for (pos, vel) in positions.iter_mut().zip(velocities) {
            pos.x += vel.x * DT;
            pos.y += vel.y * DT;
            pos.z += vel.z * DT;
        }
    });
}

fn integrate_parallel(repo: &mut Repository) {
    let query = repo.query().write::<Position>().with::<Velocity>().build();
    query.for_each_parallel(repo, |mut chunk| {
        let (positions, velocities) = chunk.slice_pair_mut::<Position, Velocity>().unwrap();
        for (pos, vel) in positions.iter_mut().zip(velocities) {
            pos.x += vel.x * DT;
            pos.y += vel.y * DT;
            pos.z += vel.z * DT;
        }
    });
}

fn collect_positions(repo: &Repository) -> Vec<(u32, [u32; 3])> {
    let query = repo.query().with::<Position>().build();
    let mut out = Vec::with_capacity(ENTITY_COUNT as usize);
    query.for_each(repo, |entity, row| {
        let pos = row.get::<Position>().unwrap();
        out.push((entity.index(), [pos.x.to_bits(), pos.y.to_bits(), pos.z.to_bits()]));
    });
    out
}

#[test]
fn test_parallel_matches_sequential_bitwise() {
    let mut sequential_repo = populate();
    let mut parallel_repo = populate();

    for _ in 0..3 {
        integrate_sequential(&mut sequential_repo);
        sequential_repo.tick(DT);
        integrate_parallel(&mut parallel_repo);
        parallel_repo.tick(DT);
    }

    let sequential = collect_positions(&sequential_repo);
    let parallel = collect_positions(&parallel_repo);
    assert_eq!(sequential.len(), ENTITY_COUNT as usize);
    assert_eq!(sequential, parallel, "per-chunk work must be order-independent across chunks");
}

#[test]
fn test_parallel_stamps_written_columns() {
    let mut repo = populate();
    repo.tick(DT);
    let version = repo.global_version();

    integrate_parallel(&mut repo);

    let pos_id = repo.registry().id_of::<Position>().unwrap();
    let vel_id = repo.registry().id_of::<Velocity>().unwrap();
    for archetype in repo.archetypes() {
        if !archetype.mask().contains(pos_id.mask_bit()) {
            continue;
        }
        for chunk in archetype.chunks() {
            if chunk.is_empty() {
                continue;
            }
            assert_eq!(chunk.write_version(), version);
            let pos_col = archetype.column_index(pos_id).unwrap();
            assert_eq!(chunk.column_version(pos_col), version);
            // The read-only column keeps its old stamp
            let vel_col = archetype.column_index(vel_id).unwrap();
            assert!(chunk.column_version(vel_col) < version);
        }
    }
}

#[test]
fn test_parallel_respects_write_set() {
    let mut repo = populate();
    let query = repo.query().write::<Position>().with::<Velocity>().build();
    query.for_each_parallel(&mut repo, |mut chunk| {
        // Velocity was not declared writable
        assert!(chunk.slice_mut::<Velocity>().is_none());
        assert!(chunk.slice::<Velocity>().is_some());
    });
}
