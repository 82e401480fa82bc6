//! The world is the store handle: it owns the registry, the shared-value
//! store, the archetype table and the entity directory, and performs every
//! structural change.
//!
//! There is no process-wide singleton; callers create a [`World`] (directly
//! or through [`Builder`]) and pass it by reference. Shared references allow
//! any number of concurrent readers; structural mutation requires `&mut` and
//! is therefore exclusive, which is what makes each relocation atomic with
//! respect to observers.
//!
//! Every structural operation either completes or leaves the store
//! untouched: a new row is staged completely before the old row is
//! released, and the directory is repointed before the operation returns.

use std::iter;

use xias::Xias;

use crate::archetype::{Archetype, ArchetypeId, Archetypes};
use crate::comp::{Registry, TypeIndex};
use crate::entity::{Directory, Entity, Location};
use crate::error::{Error, Result};
use crate::query::{self, Query};
use crate::shared::{ValueId, Values};

pub mod offline;
pub use offline::CommandBuffer;

#[cfg(test)]
mod tests;

/// The default chunk block size in bytes.
pub const DEFAULT_BLOCK_BYTES: usize = 16 * 1024;

const DEFAULT_POOL_CAP: usize = 8;

/// Configures and builds a [`World`].
pub struct Builder {
    block_bytes: usize,
    pool_cap:    usize,
}

impl Default for Builder {
    fn default() -> Self { Self::new() }
}

impl Builder {
    /// Starts from the default configuration.
    pub fn new() -> Self {
        Self { block_bytes: DEFAULT_BLOCK_BYTES, pool_cap: DEFAULT_POOL_CAP }
    }

    /// Sets the chunk block size. Chunk capacity for an archetype is
    /// `floor(block_bytes / stride)`.
    pub fn block_bytes(mut self, block_bytes: usize) -> Self {
        assert!(block_bytes > 0, "block_bytes must be nonzero");
        self.block_bytes = block_bytes;
        self
    }

    /// Sets how many retired empty chunks each archetype keeps for reuse.
    pub fn chunk_pool_cap(mut self, pool_cap: usize) -> Self {
        self.pool_cap = pool_cap;
        self
    }

    /// Builds the world.
    pub fn build(self) -> World {
        World {
            registry:   Registry::default(),
            shared:     Values::default(),
            archetypes: Archetypes::new(self.block_bytes, self.pool_cap),
            directory:  Directory::default(),
            version:    0,
        }
    }
}

/// An in-memory entity-component store.
pub struct World {
    registry:   Registry,
    shared:     Values,
    archetypes: Archetypes,
    directory:  Directory,
    /// Monotonically increasing; advanced by every structural mutation.
    /// Query caches are keyed by it.
    version:    u64,
}

impl Default for World {
    fn default() -> Self { Self::new() }
}

impl World {
    /// Creates a world with the default configuration.
    pub fn new() -> Self { Builder::new().build() }

    /// The component type registry.
    pub fn registry(&self) -> &Registry { &self.registry }

    /// Registers `T` as a per-entity component, or returns its existing id.
    pub fn register_component<T: bytemuck::Pod>(&mut self) -> Result<TypeIndex> {
        self.registry.register::<T>()
    }

    /// Registers `T` as a shared (grouping) component, or returns its
    /// existing id.
    pub fn register_shared<T: bytemuck::Pod>(&mut self) -> Result<TypeIndex> {
        self.registry.register_shared::<T>()
    }

    /// Resolves a type set to its archetype, creating it on first use.
    ///
    /// The set is normalized internally; order and duplicates do not matter.
    pub fn create_archetype(&mut self, types: &[TypeIndex]) -> Result<ArchetypeId> {
        let mut types = types.to_vec();
        types.sort_unstable();
        types.dedup();

        let before = self.archetypes.len();
        let id = self.archetypes.get_or_create(&types, &self.registry)?;
        if self.archetypes.len() != before {
            self.version += 1;
        }
        Ok(id)
    }

    /// The archetype for an id previously returned by
    /// [`create_archetype`](Self::create_archetype).
    pub fn archetype(&self, id: ArchetypeId) -> &Archetype { self.archetypes.get(id) }

    /// The archetype an entity currently belongs to.
    pub fn archetype_of(&self, entity: Entity) -> Result<ArchetypeId> {
        Ok(self.directory.locate(entity)?.archetype)
    }

    /// Resolves an entity to its `(archetype, chunk, row)` location.
    pub fn locate(&self, entity: Entity) -> Result<Location> { self.directory.locate(entity) }

    /// Whether the handle refers to a live entity.
    pub fn contains(&self, entity: Entity) -> bool { self.directory.locate(entity).is_ok() }

    /// The number of live entities.
    pub fn entity_count(&self) -> usize { self.directory.len() }

    /// The structural version counter. Monotonically increasing; any cached
    /// view keyed by an older version must be recomputed.
    pub fn structural_version(&self) -> u64 { self.version }

    /// Starts building a [`Query`].
    pub fn query(&self) -> query::Builder<'_> { query::Builder::new(self) }

    pub(crate) fn archetype_table(&self) -> &Archetypes { &self.archetypes }

    pub(crate) fn shared_values(&self) -> &Values { &self.shared }

    // ---- entity creation ----

    /// Creates one entity in the given archetype.
    ///
    /// Per-entity components start zeroed; shared components start at the
    /// interned zero value of their type.
    pub fn create(&mut self, archetype: ArchetypeId) -> Entity {
        let entities = self.create_many(archetype, 1);
        entities.into_iter().next().expect("create_many(1) yields one entity")
    }

    /// Creates `count` entities in the given archetype, filling chunks in
    /// capacity order.
    pub fn create_many(&mut self, archetype: ArchetypeId, count: usize) -> Vec<Entity> {
        let assignment = self.default_assignment(archetype);
        let entities = self.create_rows(archetype, &assignment, count);
        for &id in &assignment {
            self.shared.release(id);
        }
        self.version += 1;
        log::debug!("created {count} entities in {archetype:?}");
        entities
    }

    /// Creates `count` copies of `prototype`: same archetype, same grouping
    /// assignment, per-entity payload copied byte-for-byte.
    pub fn instantiate(&mut self, prototype: Entity, count: usize) -> Result<Vec<Entity>> {
        let src = self.directory.locate(prototype)?;
        let assignment: Vec<ValueId> =
            self.archetypes.get(src.archetype).chunk(src.chunk).shared_values().to_vec();

        let mut entities = Vec::with_capacity(count);
        let mut remaining = count;
        while remaining > 0 {
            let archetype = self.archetypes.get_mut(src.archetype);
            let chunk_index = archetype.open_chunk(&assignment, &mut self.shared);
            let spare = {
                let chunk = archetype.chunk(chunk_index);
                chunk.capacity() - chunk.count()
            };
            let take = remaining.min(spare);
            for _ in 0..take {
                let entity = self.directory.allocate();
                let row = if chunk_index == src.chunk {
                    archetype.chunk_mut(chunk_index).push_cloned(entity, src.row)
                } else {
                    let (dst, src_chunk) = archetype.chunk_pair_mut(chunk_index, src.chunk);
                    dst.push_copied(entity, src_chunk, src.row)
                };
                self.directory
                    .relocate(entity, Location { archetype: src.archetype, chunk: chunk_index, row });
                entities.push(entity);
            }
            remaining -= take;
        }

        self.version += 1;
        log::debug!("instantiated {count} copies of {prototype:?}");
        Ok(entities)
    }

    // ---- entity destruction ----

    /// Destroys an entity, releasing its row.
    ///
    /// Destroying through a stale handle fails with
    /// [`Error::InvalidEntity`]; it is never silently ignored.
    pub fn destroy(&mut self, entity: Entity) -> Result<()> {
        let location = self.directory.locate(entity).map_err(|error| match error {
            Error::StaleEntity { index, .. } => Error::InvalidEntity { index },
            other => other,
        })?;
        self.directory.free(entity).expect("located entity frees exactly once");
        self.release_row(location);
        self.version += 1;
        Ok(())
    }

    /// Destroys every entity and resets the directory, keeping registered
    /// types and archetypes. Handles issued before the reset come back
    /// stale.
    pub fn clear(&mut self) {
        for id in 0..self.archetypes.len() {
            let archetype = self.archetypes.get_mut(ArchetypeId(id.small_int()));
            archetype.reset(&mut self.shared);
        }
        self.directory.reset();
        self.version += 1;
        log::debug!("world cleared");
    }

    // ---- component transitions ----

    /// Adds component type `ty` to an entity, relocating it to the extended
    /// archetype. Adding a type that is already present is a no-op success.
    pub fn add_component(&mut self, entity: Entity, ty: TypeIndex) -> Result<()> {
        let src = self.directory.locate(entity)?;
        let src_archetype = self.archetypes.get(src.archetype);
        if src_archetype.contains(ty) {
            return Ok(());
        }

        let dst_types: Vec<TypeIndex> =
            itertools::merge(src_archetype.types().iter().copied(), iter::once(ty)).collect();
        let dst_id = self.archetypes.get_or_create(&dst_types, &self.registry)?;

        let (assignment, temps) = self.transition_assignment(src, dst_id, None);
        self.move_entity(entity, src, dst_id, &assignment);
        for id in temps {
            self.shared.release(id);
        }
        self.version += 1;
        Ok(())
    }

    /// Removes component type `ty` from an entity, relocating it to the
    /// narrowed archetype. Removing an absent type is a no-op success.
    pub fn remove_component(&mut self, entity: Entity, ty: TypeIndex) -> Result<()> {
        let src = self.directory.locate(entity)?;
        let src_archetype = self.archetypes.get(src.archetype);
        if !src_archetype.contains(ty) {
            return Ok(());
        }

        let dst_types: Vec<TypeIndex> =
            src_archetype.types().iter().copied().filter(|&t| t != ty).collect();
        let dst_id = self.archetypes.get_or_create(&dst_types, &self.registry)?;

        let (assignment, temps) = self.transition_assignment(src, dst_id, None);
        self.move_entity(entity, src, dst_id, &assignment);
        for id in temps {
            self.shared.release(id);
        }
        self.version += 1;
        Ok(())
    }

    // ---- shared values ----

    /// Sets the grouping value of shared component `ty` for an entity,
    /// relocating it to a chunk whose assignment matches.
    ///
    /// If the entity's archetype lacks `ty`, the type is added in the same
    /// relocation. Setting the value a chunk already has is a no-op.
    ///
    /// # Panics
    /// Panics if `ty` was not registered from `T` or is not shared.
    pub fn set_shared<T: bytemuck::Pod>(
        &mut self,
        entity: Entity,
        ty: TypeIndex,
        value: &T,
    ) -> Result<()> {
        self.registry.check_typed::<T>(ty);
        self.set_shared_bytes(entity, ty, bytemuck::bytes_of(value))
    }

    /// The grouping value of shared component `ty` for an entity, or `None`
    /// if its archetype lacks the type.
    pub fn get_shared<T: bytemuck::Pod>(&self, entity: Entity, ty: TypeIndex) -> Result<Option<T>> {
        self.registry.check_typed::<T>(ty);
        let location = self.directory.locate(entity)?;
        let archetype = self.archetypes.get(location.archetype);
        let Some(slot) = archetype.shared_types().iter().position(|&shared| shared == ty) else {
            return Ok(None);
        };
        let id = archetype.chunk(location.chunk).shared_values()[slot];
        // The intern table stores plain byte boxes with no alignment
        // guarantee, so the value is read out by copy.
        Ok(Some(bytemuck::pod_read_unaligned(self.shared.bytes(id))))
    }

    pub(crate) fn set_shared_bytes(
        &mut self,
        entity: Entity,
        ty: TypeIndex,
        bytes: &[u8],
    ) -> Result<()> {
        let info = self.registry.info(ty);
        assert!(info.shared, "{} is not a shared component", info.name);
        assert_eq!(bytes.len(), info.size, "payload size mismatch for {}", info.name);

        let src = self.directory.locate(entity)?;
        let src_archetype = self.archetypes.get(src.archetype);
        let dst_id = if src_archetype.contains(ty) {
            src.archetype
        } else {
            let dst_types: Vec<TypeIndex> =
                itertools::merge(src_archetype.types().iter().copied(), iter::once(ty)).collect();
            self.archetypes.get_or_create(&dst_types, &self.registry)?
        };

        let new_id = self.shared.intern(ty, bytes);
        let (assignment, temps) = self.transition_assignment(src, dst_id, Some((ty, new_id)));

        if dst_id == src.archetype
            && self.archetypes.get(src.archetype).chunk(src.chunk).shared_values() == &assignment[..]
        {
            for id in temps {
                self.shared.release(id);
            }
            self.shared.release(new_id);
            return Ok(());
        }

        self.move_entity(entity, src, dst_id, &assignment);
        for id in temps {
            self.shared.release(id);
        }
        self.shared.release(new_id);
        self.version += 1;
        Ok(())
    }

    // ---- component data ----

    /// Overwrites the value of per-entity component `ty` for an entity.
    ///
    /// # Panics
    /// Panics if `ty` was not registered from `T` or is absent from the
    /// entity's archetype.
    pub fn set_component<T: bytemuck::Pod>(
        &mut self,
        entity: Entity,
        ty: TypeIndex,
        value: &T,
    ) -> Result<()> {
        self.registry.check_typed::<T>(ty);
        self.set_component_bytes(entity, ty, bytemuck::bytes_of(value))
    }

    /// The value of per-entity component `ty` for an entity, or `None` if
    /// its archetype lacks the type.
    pub fn get_component<T: bytemuck::Pod>(
        &self,
        entity: Entity,
        ty: TypeIndex,
    ) -> Result<Option<T>> {
        self.registry.check_typed::<T>(ty);
        let location = self.directory.locate(entity)?;
        let archetype = self.archetypes.get(location.archetype);
        if !archetype.contains(ty) {
            return Ok(None);
        }
        let bytes = archetype.chunk(location.chunk).component_bytes(location.row, ty);
        Ok(Some(bytemuck::pod_read_unaligned(bytes)))
    }

    pub(crate) fn set_component_bytes(
        &mut self,
        entity: Entity,
        ty: TypeIndex,
        bytes: &[u8],
    ) -> Result<()> {
        let location = self.directory.locate(entity)?;
        let archetype = self.archetypes.get_mut(location.archetype);
        assert!(
            archetype.contains(ty),
            "entity archetype has no {} column",
            self.registry.info(ty).name,
        );
        archetype.chunk_mut(location.chunk).write_component_bytes(location.row, ty, bytes);
        Ok(())
    }

    // ---- batch operations over query results ----

    /// Adds component `ty` to every entity matched by `query`, grouping
    /// moves by destination so chunks fill densely. Returns the number of
    /// relocated entities.
    pub fn add_component_to_query(&mut self, query: &Query, ty: TypeIndex) -> Result<usize> {
        // Archetypes already containing the type are no-ops; skipping them
        // also keeps the drain loop terminating.
        self.for_each_matched_row(
            query,
            |archetype| archetype.contains(ty),
            |world, entity| world.add_component(entity, ty),
        )
    }

    /// Removes component `ty` from every entity matched by `query`.
    /// Returns the number of relocated entities.
    pub fn remove_component_from_query(&mut self, query: &Query, ty: TypeIndex) -> Result<usize> {
        self.for_each_matched_row(
            query,
            |archetype| !archetype.contains(ty),
            |world, entity| world.remove_component(entity, ty),
        )
    }

    /// Destroys every entity matched by `query`. Returns the number
    /// destroyed.
    pub fn destroy_query(&mut self, query: &Query) -> Result<usize> {
        self.for_each_matched_row(query, |_| false, |world, entity| world.destroy(entity))
    }

    // ---- internals ----

    /// Runs `op` for the last row of some matching chunk until no matching
    /// rows remain in non-skipped archetypes. `op` must remove the row from
    /// the match set (by moving, destroying or mutating it), otherwise this
    /// loops forever.
    fn for_each_matched_row(
        &mut self,
        query: &Query,
        skip: impl Fn(&Archetype) -> bool,
        mut op: impl FnMut(&mut World, Entity) -> Result<()>,
    ) -> Result<usize> {
        let (matched, filters): (Vec<ArchetypeId>, Vec<(TypeIndex, ValueId)>) = {
            let snapshot = query.evaluate(self);
            let Some((archetypes, filters)) = snapshot.parts() else {
                return Ok(0);
            };
            (archetypes.to_vec(), filters.to_vec())
        };

        let mut affected = 0;
        for src_id in matched {
            if skip(self.archetypes.get(src_id)) {
                continue;
            }
            loop {
                let entity = {
                    let archetype = self.archetypes.get(src_id);
                    let slots: Vec<(usize, ValueId)> = filters
                        .iter()
                        .map(|&(ty, id)| {
                            let slot = archetype
                                .shared_types()
                                .iter()
                                .position(|&shared| shared == ty)
                                .expect("filter type absent from matched archetype");
                            (slot, id)
                        })
                        .collect();
                    let Some(chunk) = archetype.chunks().iter().find(|chunk| {
                        chunk.count() > 0
                            && slots.iter().all(|&(slot, id)| chunk.shared_values()[slot] == id)
                    }) else {
                        break;
                    };
                    chunk.entity(chunk.count() - 1)
                };
                op(self, entity)?;
                affected += 1;
            }
        }
        Ok(affected)
    }

    /// Interns the zero value of every shared type of `archetype`.
    /// The caller owns one reference to each returned id.
    fn default_assignment(&mut self, archetype: ArchetypeId) -> Vec<ValueId> {
        let shared_types: Vec<TypeIndex> = self.archetypes.get(archetype).shared_types().to_vec();
        let mut assignment = Vec::with_capacity(shared_types.len());
        for ty in shared_types {
            let zeroes = vec![0u8; self.registry.info(ty).size];
            assignment.push(self.shared.intern(ty, &zeroes));
        }
        assignment
    }

    /// Allocates `count` zeroed rows in `archetype` under `assignment`,
    /// chunk by chunk.
    fn create_rows(
        &mut self,
        archetype_id: ArchetypeId,
        assignment: &[ValueId],
        count: usize,
    ) -> Vec<Entity> {
        let mut entities = Vec::with_capacity(count);
        let mut remaining = count;
        while remaining > 0 {
            let archetype = self.archetypes.get_mut(archetype_id);
            let chunk_index = archetype.open_chunk(assignment, &mut self.shared);
            let chunk = archetype.chunk_mut(chunk_index);
            let take = remaining.min(chunk.capacity() - chunk.count());
            for _ in 0..take {
                let entity = self.directory.allocate();
                let row = chunk.push_zeroed(entity);
                self.directory
                    .relocate(entity, Location { archetype: archetype_id, chunk: chunk_index, row });
                entities.push(entity);
            }
            remaining -= take;
        }
        entities
    }

    /// Builds the grouping assignment for moving a row from `src` into
    /// `dst_id`: values carried over from the source chunk where the shared
    /// type survives, `override_value` where given, and freshly interned
    /// zero values for shared types the destination adds.
    ///
    /// Returns the assignment and the temporary ids the caller must release
    /// after the move.
    fn transition_assignment(
        &mut self,
        src: Location,
        dst_id: ArchetypeId,
        override_value: Option<(TypeIndex, ValueId)>,
    ) -> (Vec<ValueId>, Vec<ValueId>) {
        let src_pairs: Vec<(TypeIndex, ValueId)> = {
            let archetype = self.archetypes.get(src.archetype);
            archetype
                .shared_types()
                .iter()
                .copied()
                .zip(archetype.chunk(src.chunk).shared_values().iter().copied())
                .collect()
        };
        let dst_shared: Vec<TypeIndex> = self.archetypes.get(dst_id).shared_types().to_vec();

        let mut assignment = Vec::with_capacity(dst_shared.len());
        let mut temps = Vec::new();
        for ty in dst_shared {
            if let Some((_, id)) = override_value.filter(|&(override_ty, _)| override_ty == ty) {
                assignment.push(id);
            } else if let Some(&(_, id)) = src_pairs.iter().find(|&&(src_ty, _)| src_ty == ty) {
                assignment.push(id);
            } else {
                let zeroes = vec![0u8; self.registry.info(ty).size];
                let id = self.shared.intern(ty, &zeroes);
                temps.push(id);
                assignment.push(id);
            }
        }
        (assignment, temps)
    }

    /// Relocates one entity row into `dst_id` under `assignment`.
    ///
    /// The destination row is fully staged (copied and registered in the
    /// directory) before the source row is released, so no partial state is
    /// ever observable.
    fn move_entity(
        &mut self,
        entity: Entity,
        src: Location,
        dst_id: ArchetypeId,
        assignment: &[ValueId],
    ) {
        let (chunk_index, row) = if dst_id == src.archetype {
            let archetype = self.archetypes.get_mut(dst_id);
            let chunk_index = archetype.open_chunk(assignment, &mut self.shared);
            debug_assert_ne!(chunk_index, src.chunk, "move within one grouping is a no-op");
            let (dst_chunk, src_chunk) = archetype.chunk_pair_mut(chunk_index, src.chunk);
            (chunk_index, dst_chunk.push_copied(entity, src_chunk, src.row))
        } else {
            let (dst_archetype, src_archetype) = self.archetypes.get2_mut(dst_id, src.archetype);
            let chunk_index = dst_archetype.open_chunk(assignment, &mut self.shared);
            let row = dst_archetype
                .chunk_mut(chunk_index)
                .push_copied(entity, src_archetype.chunk(src.chunk), src.row);
            (chunk_index, row)
        };

        self.directory.relocate(entity, Location { archetype: dst_id, chunk: chunk_index, row });
        self.release_row(src);
    }

    /// Swap-removes a row, repointing the directory entry of whichever
    /// entity the swap displaced, and retires the chunk if it emptied.
    fn release_row(&mut self, location: Location) {
        let archetype = self.archetypes.get_mut(location.archetype);
        if let Some(displaced) = archetype.chunk_mut(location.chunk).swap_remove(location.row) {
            self.directory.relocate(displaced, location);
        }

        if archetype.chunk(location.chunk).is_empty() {
            let swapped = archetype.retire_chunk(location.chunk, &mut self.shared);
            if swapped {
                // A chunk moved into this index; its rows kept their order.
                let chunk = archetype.chunk(location.chunk);
                for (row, &entity) in chunk.entities().iter().enumerate() {
                    self.directory.relocate(
                        entity,
                        Location { archetype: location.archetype, chunk: location.chunk, row },
                    );
                }
            }
        }
    }
}

static_assertions::assert_impl_all!(World: Send, Sync);
