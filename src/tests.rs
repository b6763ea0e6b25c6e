//! Cross-module behavior tests.

use crate::component::DataPolicy;
use crate::entity::Lifecycle;
use crate::error::FdpError;
use crate::repository::Repository;

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

#[derive(Debug, PartialEq)]
struct Label(String);

fn repo_with_types() -> Repository {
    let mut repo = Repository::new();
    repo.register_unmanaged::<Position>(DataPolicy::RECORDABLE)
        .unwrap();
    repo.register_unmanaged::<Velocity>(DataPolicy::RECORDABLE)
        .unwrap();
    repo.register_managed::<Label>(DataPolicy::NONE).unwrap();
    repo
}

#[test]
fn test_create_destroy_is_alive() {
    let mut repo = repo_with_types();
    let entity = repo.create_entity().unwrap();
    assert!(repo.is_alive(entity));
    assert_eq!(repo.lifecycle(entity), Some(Lifecycle::Active));
    assert_eq!(repo.entity_count(), 1);

    repo.destroy_entity(entity).unwrap();
    assert!(!repo.is_alive(entity));
    assert_eq!(repo.entity_count(), 0);

    // Strict mode: destroying a dead handle is an error
    assert!(matches!(
        repo.destroy_entity(entity),
        Err(FdpError::EntityNotFound)
    ));
}

#[test]
fn test_stale_handle_detected_after_index_reuse() {
    let mut repo = repo_with_types();
    let first = repo.create_entity().unwrap();
    repo.destroy_entity(first).unwrap();

    let second = repo.create_entity().unwrap();
    assert_eq!(second.index(), first.index());
    assert_ne!(second.generation(), first.generation());
    assert!(repo.is_alive(second));
    assert!(!repo.is_alive(first));
}

#[test]
fn test_component_add_get_remove() {
    let mut repo = repo_with_types();
    let entity = repo.create_entity().unwrap();

    assert!(!repo.has_component::<Position>(entity));
    repo.add_component(entity, Position { x: 1.0, y: 2.0, z: 3.0 })
        .unwrap();
    assert!(repo.has_component::<Position>(entity));
    assert_eq!(
        repo.get_component::<Position>(entity),
        Some(&Position { x: 1.0, y: 2.0, z: 3.0 })
    );

    repo.remove_component::<Position>(entity).unwrap();
    assert!(!repo.has_component::<Position>(entity));
    assert!(repo.get_component::<Position>(entity).is_none());
    assert!(matches!(
        repo.remove_component::<Position>(entity),
        Err(FdpError::ComponentNotFound)
    ));
}

#[test]
fn test_set_overwrites_unconditionally() {
    let mut repo = repo_with_types();
    let entity = repo.create_entity().unwrap();
    repo.set_component(entity, Position { x: 1.0, y: 1.0, z: 1.0 })
        .unwrap();
    repo.set_component(entity, Position { x: 9.0, y: 9.0, z: 9.0 })
        .unwrap();
    assert_eq!(
        repo.get_component::<Position>(entity).unwrap().x,
        9.0
    );
}

#[test]
fn test_unregistered_type_is_misuse() {
    #[derive(Clone, Copy)]
    struct Unregistered(#[allow(dead_code)] u8);

    let mut repo = repo_with_types();
    let entity = repo.create_entity().unwrap();
    assert!(matches!(
        repo.add_component(entity, Unregistered(1)),
        Err(FdpError::TypeNotRegistered(_))
    ));
}

#[test]
fn test_managed_components_do_not_change_archetype() {
    let mut repo = repo_with_types();
    let entity = repo.create_entity().unwrap();
    repo.add_component(entity, Position { x: 0.0, y: 0.0, z: 0.0 })
        .unwrap();
    let mask_before = repo.entity_index().mask(entity).unwrap();

    repo.set_managed(entity, Label("named".into())).unwrap();
    assert!(repo.has_managed::<Label>(entity));
    assert_eq!(repo.entity_index().mask(entity).unwrap(), mask_before);

    assert_eq!(
        repo.get_managed::<Label>(entity),
        Some(&Label("named".into()))
    );
    assert!(repo.remove_managed::<Label>(entity).unwrap());
    assert!(!repo.has_managed::<Label>(entity));
}

#[test]
fn test_destroy_releases_managed_values() {
    let mut repo = repo_with_types();
    let entity = repo.create_entity().unwrap();
    repo.set_managed(entity, Label("gone".into())).unwrap();
    repo.destroy_entity(entity).unwrap();

    let reused = repo.create_entity().unwrap();
    assert_eq!(reused.index(), entity.index());
    assert!(!repo.has_managed::<Label>(reused));
}

#[test]
fn test_query_with_without() {
    let mut repo = repo_with_types();
    for i in 0..10 {
        let entity = repo.create_entity().unwrap();
        repo.add_component(entity, Position { x: i as f32, y: 0.0, z: 0.0 })
            .unwrap();
        if i % 2 == 0 {
            repo.add_component(entity, Velocity { x: 1.0, y: 0.0, z: 0.0 })
                .unwrap();
        }
    }

    let both = repo.query().with::<Position>().with::<Velocity>().build();
    assert_eq!(both.count(&repo), 5);

    let only_pos = repo.query().with::<Position>().without::<Velocity>().build();
    assert_eq!(only_pos.count(&repo), 5);

    let mut sum = 0.0f32;
    only_pos.for_each(&repo, |_, row| {
        sum += row.get::<Position>().unwrap().x;
    });
    assert_eq!(sum, 1.0 + 3.0 + 5.0 + 7.0 + 9.0);
}

#[test]
fn test_query_on_unregistered_type_matches_nothing() {
    #[derive(Clone, Copy)]
    struct Never(#[allow(dead_code)] u8);

    let mut repo = repo_with_types();
    let entity = repo.create_entity().unwrap();
    repo.add_component(entity, Position { x: 0.0, y: 0.0, z: 0.0 })
        .unwrap();

    let query = repo.query().with::<Never>().build();
    assert_eq!(query.count(&repo), 0);
}

#[test]
fn test_query_managed_predicate() {
    let mut repo = repo_with_types();
    let mut labeled = Vec::new();
    for i in 0..6 {
        let entity = repo.create_entity().unwrap();
        repo.add_component(entity, Position { x: 0.0, y: 0.0, z: 0.0 })
            .unwrap();
        if i < 2 {
            repo.set_managed(entity, Label(format!("e{i}"))).unwrap();
            labeled.push(entity);
        }
    }

    let query = repo
        .query()
        .with::<Position>()
        .with_managed::<Label>()
        .build();
    let mut seen = Vec::new();
    query.for_each(&repo, |entity, _| seen.push(entity));
    assert_eq!(seen, labeled);
}

#[test]
fn test_query_lifecycle_predicate() {
    let mut repo = repo_with_types();
    let a = repo.create_entity().unwrap();
    let b = repo.create_entity().unwrap();
    repo.add_component(a, Position { x: 0.0, y: 0.0, z: 0.0 }).unwrap();
    repo.add_component(b, Position { x: 0.0, y: 0.0, z: 0.0 }).unwrap();
    repo.set_lifecycle(b, Lifecycle::Constructing).unwrap();

    let active = repo
        .query()
        .with::<Position>()
        .with_lifecycle(Lifecycle::Active)
        .build();
    let mut seen = Vec::new();
    active.for_each(&repo, |entity, _| seen.push(entity));
    assert_eq!(seen, vec![a]);
}

#[test]
fn test_chunk_write_set_gate() {
    let mut repo = repo_with_types();
    let entity = repo.create_entity().unwrap();
    repo.add_component(entity, Position { x: 0.0, y: 0.0, z: 0.0 })
        .unwrap();
    repo.add_component(entity, Velocity { x: 1.0, y: 0.0, z: 0.0 })
        .unwrap();

    let query = repo
        .query()
        .write::<Position>()
        .with::<Velocity>()
        .build();
    query.for_each_chunk_mut(&mut repo, |mut chunk| {
        assert!(chunk.slice_mut::<Position>().is_some());
        // Velocity is read-only for this query
        assert!(chunk.slice_mut::<Velocity>().is_none());
        assert!(chunk.slice::<Velocity>().is_some());
    });
}

#[test]
fn test_event_visibility_follows_tick() {
    let mut repo = repo_with_types();
    repo.events_mut().publish(42u32);
    assert!(repo.events().read::<u32>().is_empty());

    repo.tick(0.016);
    assert_eq!(repo.events().read::<u32>(), &[42]);

    repo.tick(0.016);
    assert!(repo.events().read::<u32>().is_empty());
}

#[test]
fn test_singletons_are_repository_scoped() {
    #[derive(Debug, PartialEq)]
    struct Settings {
        gravity: f32,
    }

    let mut repo = repo_with_types();
    assert!(repo.get_singleton::<Settings>().is_none());
    repo.set_singleton(Settings { gravity: -9.81 });
    assert_eq!(repo.get_singleton::<Settings>().unwrap().gravity, -9.81);

    repo.get_singleton_mut::<Settings>().unwrap().gravity = -1.62;
    let taken = repo.remove_singleton::<Settings>().unwrap();
    assert_eq!(taken, Settings { gravity: -1.62 });
    assert!(repo.get_singleton::<Settings>().is_none());
}

#[test]
fn test_write_version_never_exceeds_global() {
    let mut repo = repo_with_types();
    for i in 0..100 {
        let entity = repo.create_entity().unwrap();
        repo.add_component(entity, Position { x: i as f32, y: 0.0, z: 0.0 })
            .unwrap();
        if i % 3 == 0 {
            repo.tick(0.016);
        }
    }

    let global = repo.global_version();
    for archetype in repo.archetypes() {
        for chunk in archetype.chunks() {
            assert!(chunk.write_version() <= global);
        }
    }
}

#[test]
fn test_destruction_log_records_indices() {
    let mut repo = repo_with_types();
    let a = repo.create_entity().unwrap();
    let b = repo.create_entity().unwrap();
    repo.destroy_entity(a).unwrap();
    repo.tick(0.016);
    repo.destroy_entity(b).unwrap();

    let log = repo.destruction_log();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].index, a.index());
    assert_eq!(log[1].index, b.index());
    assert!(log[0].version < log[1].version);
}

#[test]
fn test_mask_mirror_matches_archetype() {
    let mut repo = repo_with_types();
    let entity = repo.create_entity().unwrap();
    repo.add_component(entity, Position { x: 0.0, y: 0.0, z: 0.0 })
        .unwrap();
    repo.add_component(entity, Velocity { x: 0.0, y: 0.0, z: 0.0 })
        .unwrap();

    let location = repo.entity_index().location(entity).unwrap();
    let archetype = &repo.archetypes()[location.archetype_id as usize];
    assert_eq!(repo.entity_index().mask(entity).unwrap(), archetype.mask());
}

#[test]
fn test_prune_retires_empty_chunks() {
    let mut repo = repo_with_types();
    let mut spawned = Vec::new();
    for _ in 0..50 {
        let entity = repo.create_entity().unwrap();
        repo.add_component(entity, Position { x: 0.0, y: 0.0, z: 0.0 })
            .unwrap();
        spawned.push(entity);
    }
    for entity in spawned {
        repo.destroy_entity(entity).unwrap();
    }
    repo.tick(0.016);

    for archetype in repo.archetypes() {
        assert!(archetype.chunks().is_empty() || !archetype.chunks().last().unwrap().is_empty());
    }
}
