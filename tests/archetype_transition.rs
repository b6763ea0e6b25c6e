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

#[test]
fn test_add_component_moves_entity_between_archetypes() {
    let mut repo = Repository::new();
    let pos_id = repo.register_unmanaged::<Position>(DataPolicy::RECORDABLE).unwrap();
    let vel_id = repo.register_unmanaged::<Velocity>(DataPolicy::RECORDABLE).unwrap();

    let entity = repo.create_entity().unwrap();
    repo.add_component(entity, Position { x: 1.0, y: 2.0, z: 3.0 })
        .unwrap();

    // Archetype mask has the Position bit, not the Velocity bit
    let query = repo.query().with::<Position>().build();
    let mut masks = Vec::new();
    query.for_each(&repo, |_, _| {});
    for archetype in repo.archetypes() {
        if archetype.entity_count() > 0 && archetype.mask().contains(pos_id.mask_bit()) {
            masks.push(archetype.mask());
        }
    }
    assert_eq!(masks.len(), 1);
    assert!(masks[0].contains(pos_id.mask_bit()));
    assert!(!masks[0].contains(vel_id.mask_bit()));

    repo.add_component(entity, Velocity { x: 4.0, y: 5.0, z: 6.0 })
        .unwrap();

    // Entity moved to the archetype with both bits; Position preserved
    let both = repo.query().with::<Position>().with::<Velocity>().build();
    assert_eq!(both.count(&repo), 1);
    let mut found = None;
    both.for_each(&repo, |e, row| {
        found = Some((e, *row.get::<Position>().unwrap(), *row.get::<Velocity>().unwrap()));
    });
    let (found_entity, pos, vel) = found.unwrap();
    assert_eq!(found_entity, entity);
    assert_eq!(pos, Position { x: 1.0, y: 2.0, z: 3.0 });
    assert_eq!(vel, Velocity { x: 4.0, y: 5.0, z: 6.0 });
}

#[test]
fn test_remove_component_narrows_archetype() {
    let mut repo = Repository::new();
    repo.register_unmanaged::<Position>(DataPolicy::NONE).unwrap();
    repo.register_unmanaged::<Velocity>(DataPolicy::NONE).unwrap();

    let entity = repo.create_entity().unwrap();
    repo.add_component(entity, Position { x: 7.0, y: 8.0, z: 9.0 }).unwrap();
    repo.add_component(entity, Velocity { x: 0.1, y: 0.2, z: 0.3 }).unwrap();

    repo.remove_component::<Velocity>(entity).unwrap();
    assert!(repo.has_component::<Position>(entity));
    assert!(!repo.has_component::<Velocity>(entity));
    assert_eq!(
        repo.get_component::<Position>(entity),
        Some(&Position { x: 7.0, y: 8.0, z: 9.0 })
    );
}

#[test]
fn test_chunk_overflow_preserves_rows() {
    let mut repo = Repository::new();
    repo.register_unmanaged::<Position>(DataPolicy::NONE).unwrap();

    // First spawn discovers the per-chunk capacity, then overflow it
    let probe = repo.create_entity().unwrap();
    repo.add_component(probe, Position { x: 0.0, y: 0.0, z: 0.0 }).unwrap();
    let capacity = repo
        .archetypes()
        .iter()
        .find(|a| a.entity_count() == 1)
        .and_then(|a| a.chunks().first())
        .map(|c| c.capacity())
        .expect("probe archetype");
    assert!(capacity > 1000);

    let mut entities = vec![probe];
    for i in 1..capacity as u32 + 1 {
        let entity = repo.create_entity().unwrap();
        repo.add_component(entity, Position { x: i as f32, y: 0.0, z: 0.0 })
            .unwrap();
        entities.push(entity);
    }

    // capacity + 1 entities now live in two chunks of the same archetype
    let archetype = repo
        .archetypes()
        .iter()
        .find(|a| a.entity_count() == capacity + 1)
        .expect("archetype with all spawned entities");
    assert_eq!(archetype.chunks().len(), 2);
    assert_eq!(archetype.chunks()[0].len(), capacity);
    assert_eq!(archetype.chunks()[1].len(), 1);

    // Every prior row is intact
    for (i, &entity) in entities.iter().enumerate() {
        assert_eq!(repo.get_component::<Position>(entity).unwrap().x, i as f32);
    }
}

#[test]
fn test_swap_remove_patches_moved_entity() {
    let mut repo = Repository::new();
    repo.register_unmanaged::<Position>(DataPolicy::NONE).unwrap();

    let a = repo.create_entity().unwrap();
    let b = repo.create_entity().unwrap();
    let c = repo.create_entity().unwrap();
    for (i, &e) in [a, b, c].iter().enumerate() {
        repo.add_component(e, Position { x: i as f32, y: 0.0, z: 0.0 }).unwrap();
    }

    // Destroying the first row swaps the tail entity into its slot
    repo.destroy_entity(a).unwrap();
    assert!(repo.is_alive(b) && repo.is_alive(c));
    assert_eq!(repo.get_component::<Position>(b).unwrap().x, 1.0);
    assert_eq!(repo.get_component::<Position>(c).unwrap().x, 2.0);
}
