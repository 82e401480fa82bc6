//! Store-level behavior tests: structural changes, grouping, queries and
//! deferred playback.

use crate::entity::Location;
use crate::error::Error;
use crate::world::{Builder, CommandBuffer, World, DEFAULT_BLOCK_BYTES};

#[derive(Clone, Copy, PartialEq, Debug, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
struct Health(u32);

#[derive(Clone, Copy, PartialEq, Debug, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
struct Momentum([f32; 2]);

#[derive(Clone, Copy, PartialEq, Debug, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
struct SpawnOrder(u32);

#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
struct Grounded;

#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
struct Airborne;

#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
struct Migrant;

#[derive(Clone, Copy, PartialEq, Debug, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
struct Region([f32; 3]);

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Every entity back-pointer, directory entry and grouping arity must agree
/// after any sequence of operations.
fn assert_consistent(world: &World) {
    for archetype in world.archetype_table().iter() {
        let capacity = archetype.layout().capacity();
        for (chunk_index, chunk) in archetype.chunks().iter().enumerate() {
            assert!(chunk.count() <= capacity);
            assert_eq!(chunk.capacity(), capacity);
            assert_eq!(chunk.shared_values().len(), archetype.shared_types().len());
            for (row, &entity) in chunk.entities().iter().enumerate() {
                let location = world.locate(entity).expect("stored entity must be live");
                assert_eq!(
                    location,
                    Location { archetype: archetype.id(), chunk: chunk_index, row },
                );
            }
        }
    }
}

#[test]
fn create_locate_destroy_round_trip() {
    let mut world = World::new();
    let health = world.register_component::<Health>().unwrap();
    let archetype = world.create_archetype(&[health]).unwrap();

    let entity = world.create(archetype);
    assert!(world.contains(entity));
    world.destroy(entity).unwrap();

    assert_eq!(
        world.locate(entity),
        Err(Error::StaleEntity { index: entity.index(), generation: entity.generation() }),
    );

    let reused = world.create(archetype);
    assert_eq!(reused.index(), entity.index());
    assert_ne!(reused.generation(), entity.generation());
    assert_consistent(&world);
}

#[test]
fn destroy_through_stale_handle_is_invalid() {
    let mut world = World::new();
    let health = world.register_component::<Health>().unwrap();
    let archetype = world.create_archetype(&[health]).unwrap();

    let entity = world.create(archetype);
    world.destroy(entity).unwrap();
    assert_eq!(world.destroy(entity), Err(Error::InvalidEntity { index: entity.index() }));
}

#[test]
fn component_data_survives_swap_remove() {
    let mut world = World::new();
    let health = world.register_component::<Health>().unwrap();
    let archetype = world.create_archetype(&[health]).unwrap();

    let entities = world.create_many(archetype, 4);
    for (i, &entity) in entities.iter().enumerate() {
        world.set_component(entity, health, &Health(i.try_into().unwrap())).unwrap();
    }

    // Destroying the first row swaps the last into its place.
    world.destroy(entities[0]).unwrap();
    assert_eq!(world.get_component::<Health>(entities[3], health).unwrap(), Some(Health(3)));
    assert_eq!(world.get_component::<Health>(entities[1], health).unwrap(), Some(Health(1)));
    assert_consistent(&world);
}

#[test]
fn add_component_is_idempotent() {
    let mut world = World::new();
    let health = world.register_component::<Health>().unwrap();
    let momentum = world.register_component::<Momentum>().unwrap();
    let archetype = world.create_archetype(&[health]).unwrap();

    let entity = world.create(archetype);
    world.set_component(entity, health, &Health(9)).unwrap();

    world.add_component(entity, momentum).unwrap();
    let once = world.locate(entity).unwrap();
    world.add_component(entity, momentum).unwrap();
    let twice = world.locate(entity).unwrap();

    assert_eq!(once, twice);
    assert_eq!(world.get_component::<Health>(entity, health).unwrap(), Some(Health(9)));
    assert_eq!(world.get_component::<Momentum>(entity, momentum).unwrap(), Some(Momentum([0.0; 2])));
    assert_consistent(&world);
}

#[test]
fn remove_component_preserves_remaining_payload() {
    let mut world = World::new();
    let health = world.register_component::<Health>().unwrap();
    let momentum = world.register_component::<Momentum>().unwrap();
    let archetype = world.create_archetype(&[health, momentum]).unwrap();

    let entity = world.create(archetype);
    world.set_component(entity, health, &Health(31)).unwrap();
    world.remove_component(entity, momentum).unwrap();
    // Removing an absent type is a no-op success.
    world.remove_component(entity, momentum).unwrap();

    assert_eq!(world.get_component::<Health>(entity, health).unwrap(), Some(Health(31)));
    assert_eq!(world.get_component::<Momentum>(entity, momentum).unwrap(), None);
    assert_consistent(&world);
}

#[test]
fn bulk_create_fills_chunks_to_capacity() {
    init_logs();
    let mut world = World::new();
    let health = world.register_component::<Health>().unwrap();
    let momentum = world.register_component::<Momentum>().unwrap();
    let archetype = world.create_archetype(&[health, momentum]).unwrap();

    let count = 100_000;
    let entities = world.create_many(archetype, count);
    assert_eq!(entities.len(), count);

    // Health is 4 bytes and Momentum 8, so each row strides 12 bytes.
    let capacity = DEFAULT_BLOCK_BYTES / 12;
    let expected_chunks = count.div_ceil(capacity);

    let archetype = world.archetype(archetype);
    assert_eq!(archetype.layout().capacity(), capacity);
    assert_eq!(archetype.chunks().len(), expected_chunks);
    assert_eq!(archetype.row_count(), count);
    for chunk in &archetype.chunks()[..expected_chunks - 1] {
        assert!(chunk.is_full());
    }
}

#[test]
fn grouping_value_filter_matches_prototype_and_copies() {
    init_logs();
    let mut world = World::new();
    let grounded = world.register_component::<Grounded>().unwrap();
    let airborne = world.register_component::<Airborne>().unwrap();
    let region = world.register_shared::<Region>().unwrap();
    let archetype = world.create_archetype(&[grounded, airborne, region]).unwrap();

    let first_region = Region([1.0, 1.0, 1.0]);
    let second_region = Region([2.0, 2.0, 2.0]);

    let first = world.create(archetype);
    world.set_shared(first, region, &first_region).unwrap();
    let second = world.create(archetype);
    world.set_shared(second, region, &second_region).unwrap();

    world.instantiate(first, 50).unwrap();
    world.instantiate(second, 50).unwrap();

    let query = world
        .query()
        .with(grounded)
        .filter_shared(region, &first_region)
        .build()
        .unwrap();
    assert_eq!(query.evaluate(&world).row_count(), 51);

    // Instantiated copies carry the prototype's grouping value.
    assert_eq!(world.get_shared::<Region>(first, region).unwrap(), Some(first_region));
    assert_consistent(&world);
}

#[test]
fn batch_add_relocates_every_matched_row() {
    init_logs();
    let mut world = World::new();
    let health = world.register_component::<Health>().unwrap();
    let momentum = world.register_component::<Momentum>().unwrap();
    let migrant = world.register_component::<Migrant>().unwrap();

    let plain = world.create_archetype(&[health]).unwrap();
    let moving = world.create_archetype(&[health, momentum]).unwrap();
    world.create_many(plain, 400);
    world.create_many(moving, 600);

    let query = world.query().with(health).build().unwrap();
    assert_eq!(query.evaluate(&world).row_count(), 1000);

    let relocated = world.add_component_to_query(&query, migrant).unwrap();
    assert_eq!(relocated, 1000);

    // The original archetypes are drained...
    assert_eq!(world.archetype(plain).row_count(), 0);
    assert_eq!(world.archetype(moving).row_count(), 0);
    assert_eq!(world.archetype(plain).chunks().len(), 0);

    // ...and the extended archetypes hold every row, with the new column.
    let extended = world.query().with(migrant).build().unwrap();
    assert_eq!(extended.evaluate(&world).row_count(), 1000);
    assert_eq!(world.entity_count(), 1000);
    assert_consistent(&world);
}

#[test]
fn batch_add_is_a_no_op_where_type_exists() {
    let mut world = World::new();
    let health = world.register_component::<Health>().unwrap();
    let migrant = world.register_component::<Migrant>().unwrap();
    let tagged = world.create_archetype(&[health, migrant]).unwrap();
    world.create_many(tagged, 10);

    let query = world.query().with(health).build().unwrap();
    let relocated = world.add_component_to_query(&query, migrant).unwrap();
    assert_eq!(relocated, 0);
    assert_eq!(world.archetype(tagged).row_count(), 10);
}

#[test]
fn query_results_are_deterministic() {
    let mut world = World::new();
    let health = world.register_component::<Health>().unwrap();
    let momentum = world.register_component::<Momentum>().unwrap();
    let plain = world.create_archetype(&[health]).unwrap();
    let moving = world.create_archetype(&[health, momentum]).unwrap();
    world.create_many(plain, 123);
    world.create_many(moving, 456);

    let query = world.query().with(health).build().unwrap();
    let first = query.evaluate(&world).row_count();
    let second = query.evaluate(&world).row_count();
    assert_eq!(first, second);
    assert_eq!(first, 579);
}

#[test]
fn query_cache_revalidates_after_structural_change() {
    let mut world = World::new();
    let health = world.register_component::<Health>().unwrap();
    let momentum = world.register_component::<Momentum>().unwrap();
    let plain = world.create_archetype(&[health]).unwrap();
    world.create_many(plain, 5);

    let query = world.query().with(health).build().unwrap();
    assert_eq!(query.evaluate(&world).row_count(), 5);

    // A new matching archetype appears after the query was first evaluated.
    let moving = world.create_archetype(&[health, momentum]).unwrap();
    world.create_many(moving, 7);
    assert_eq!(query.evaluate(&world).row_count(), 12);
}

#[test]
fn set_shared_regroups_within_the_archetype() {
    let mut world = World::new();
    let health = world.register_component::<Health>().unwrap();
    let region = world.register_shared::<Region>().unwrap();
    let archetype = world.create_archetype(&[health, region]).unwrap();

    let entities = world.create_many(archetype, 3);
    world.set_component(entities[0], health, &Health(5)).unwrap();

    let near = Region([1.0, 0.0, 0.0]);
    world.set_shared(entities[0], region, &near).unwrap();
    world.set_shared(entities[1], region, &near).unwrap();

    // Two groupings: the zero default and `near`.
    let archetype_ref = world.archetype(archetype);
    assert_eq!(archetype_ref.chunks().len(), 2);
    assert_eq!(world.get_shared::<Region>(entities[0], region).unwrap(), Some(near));
    assert_eq!(world.get_shared::<Region>(entities[2], region).unwrap(), Some(Region([0.0; 3])));

    // Setting the value a chunk already has is a no-op.
    let before = world.locate(entities[0]).unwrap();
    world.set_shared(entities[0], region, &near).unwrap();
    assert_eq!(world.locate(entities[0]).unwrap(), before);

    // Payload survives the regrouping moves.
    assert_eq!(world.get_component::<Health>(entities[0], health).unwrap(), Some(Health(5)));
    assert_consistent(&world);
}

#[test]
fn emptied_groupings_release_their_values() {
    let mut world = World::new();
    let health = world.register_component::<Health>().unwrap();
    let region = world.register_shared::<Region>().unwrap();
    let archetype = world.create_archetype(&[health, region]).unwrap();

    let far = Region([9.0, 9.0, 9.0]);
    let entity = world.create(archetype);
    world.set_shared(entity, region, &far).unwrap();
    assert!(world.shared_values().find(region, bytemuck::bytes_of(&far)).is_some());

    world.destroy(entity).unwrap();
    assert_eq!(world.shared_values().find(region, bytemuck::bytes_of(&far)), None);
}

#[test]
fn set_shared_on_missing_type_extends_the_archetype() {
    let mut world = World::new();
    let health = world.register_component::<Health>().unwrap();
    let region = world.register_shared::<Region>().unwrap();
    let archetype = world.create_archetype(&[health]).unwrap();

    let entity = world.create(archetype);
    let somewhere = Region([3.0, 2.0, 1.0]);
    world.set_shared(entity, region, &somewhere).unwrap();

    assert_eq!(world.get_shared::<Region>(entity, region).unwrap(), Some(somewhere));
    let extended = world.archetype_of(entity).unwrap();
    assert_ne!(extended, archetype);
    assert_consistent(&world);
}

#[test]
fn clear_resets_entities_but_keeps_structure() {
    let mut world = World::new();
    let health = world.register_component::<Health>().unwrap();
    let archetype = world.create_archetype(&[health]).unwrap();
    let entities = world.create_many(archetype, 20);

    world.clear();
    assert_eq!(world.entity_count(), 0);
    assert_eq!(world.archetype(archetype).row_count(), 0);
    assert!(!world.contains(entities[0]));

    // The store stays usable with the same registrations.
    let entity = world.create(archetype);
    world.set_component(entity, health, &Health(1)).unwrap();
    assert_consistent(&world);
}

#[test]
fn oversized_archetype_is_rejected() {
    let mut world = Builder::new().block_bytes(64).build();

    #[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
    #[repr(C)]
    struct Huge([u8; 128]);

    let huge = world.register_component::<Huge>().unwrap();
    assert_eq!(
        world.create_archetype(&[huge]),
        Err(Error::CapacityExceeded { stride: 128, block_bytes: 64 }),
    );
}

#[test]
fn playback_applies_keyed_commands_in_sort_order() {
    init_logs();
    let mut world = World::new();
    let order = world.register_component::<SpawnOrder>().unwrap();
    let archetype = world.create_archetype(&[order]).unwrap();

    const PRODUCERS: usize = 8;
    const TOTAL: u32 = 10_000;

    let mut buffer = CommandBuffer::new(PRODUCERS);
    {
        let writers = buffer.writers().unwrap();
        std::thread::scope(|scope| {
            for (producer, mut writer) in writers.into_iter().enumerate() {
                scope.spawn(move || {
                    let mut key = u32::try_from(producer).unwrap();
                    while key < TOTAL {
                        writer.create_entity_with(key, archetype, order, &SpawnOrder(key));
                        // Spread the keys across producers so playback has to
                        // interleave every shard.
                        key += u32::try_from(PRODUCERS).unwrap();
                    }
                });
            }
        });
    }

    let applied = buffer.playback(&mut world).unwrap();
    assert_eq!(applied, TOTAL.try_into().unwrap());
    assert_eq!(world.entity_count(), TOTAL.try_into().unwrap());

    // Chunks fill in creation order, so concatenating the spawn-order
    // column over the chunk list recovers playback order.
    let query = world.query().with(order).build().unwrap();
    let snapshot = query.evaluate(&world);
    let mut seen: Vec<u32> = Vec::new();
    for chunk_ref in snapshot.chunks() {
        seen.extend(
            chunk_ref.chunk.column::<SpawnOrder>(world.registry(), order).iter().map(|o| o.0),
        );
    }
    assert_eq!(seen.len(), TOTAL.try_into().unwrap());
    assert!(seen.windows(2).all(|pair| pair[0] <= pair[1]), "keys must be non-decreasing");
    assert_consistent(&world);
}

#[test]
fn consumed_buffer_rejects_further_use() {
    let mut world = World::new();
    let health = world.register_component::<Health>().unwrap();
    let archetype = world.create_archetype(&[health]).unwrap();

    let mut buffer = CommandBuffer::new(1);
    buffer.create_entity(archetype).unwrap();
    buffer.playback(&mut world).unwrap();

    assert_eq!(buffer.create_entity(archetype), Err(Error::BufferClosed));
    assert!(matches!(buffer.writers(), Err(Error::BufferClosed)));
    assert_eq!(buffer.playback(&mut world), Err(Error::BufferClosed));
    assert_eq!(world.entity_count(), 1);
}

#[test]
fn non_keyed_commands_play_back_in_append_order() {
    let mut world = World::new();
    let order = world.register_component::<SpawnOrder>().unwrap();
    let archetype = world.create_archetype(&[order]).unwrap();

    let probe = world.create(archetype);

    let mut buffer = CommandBuffer::new(1);
    buffer.set_component(probe, order, &SpawnOrder(1)).unwrap();
    buffer.set_component(probe, order, &SpawnOrder(2)).unwrap();
    buffer.destroy_entity(probe).unwrap();
    buffer.playback(&mut world).unwrap();

    // The destroy recorded last must win over the earlier writes.
    assert!(!world.contains(probe));
}

#[test]
fn playback_surfaces_structural_errors() {
    let mut world = World::new();
    let health = world.register_component::<Health>().unwrap();
    let archetype = world.create_archetype(&[health]).unwrap();

    let doomed = world.create(archetype);
    world.destroy(doomed).unwrap();

    let mut buffer = CommandBuffer::new(1);
    buffer.destroy_entity(doomed).unwrap();
    assert_eq!(
        buffer.playback(&mut world),
        Err(Error::InvalidEntity { index: doomed.index() }),
    );
}
