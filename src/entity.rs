//! Entities and the directory that locates them.
//!
//! An entity is a pair of slot index and generation.
//! The directory recycles slot indices through a LIFO free list and bumps
//! the generation on reuse, so a handle held across a destroy is detected
//! as [`StaleEntity`](Error::StaleEntity) instead of silently aliasing the
//! slot's next occupant.
//!
//! The directory owns no component payloads; it is purely an index.

use std::num::NonZeroU32;

use xias::Xias;

use crate::archetype::ArchetypeId;
use crate::error::{Error, Result};

/// A handle to an entity.
///
/// Handles are plain values; holding one does not keep the entity alive.
/// A handle whose slot has been freed or recycled fails every operation
/// with [`Error::StaleEntity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Entity {
    index:      u32,
    generation: NonZeroU32,
}

impl Entity {
    /// The directory slot index.
    pub fn index(self) -> u32 { self.index }

    /// The generation under which this handle was issued.
    pub fn generation(self) -> u32 { self.generation.get() }

    fn stale_error(self) -> Error {
        Error::StaleEntity { index: self.index, generation: self.generation.get() }
    }
}

/// Where an entity's row currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    /// The archetype holding the entity.
    pub archetype: ArchetypeId,
    /// Chunk index within the archetype's chunk list.
    pub chunk:     usize,
    /// Row within the chunk.
    pub row:       usize,
}

enum SlotState {
    /// Allocated but not yet placed into a chunk.
    Reserved,
    Live(Location),
    Free,
}

struct Slot {
    generation: NonZeroU32,
    state:      SlotState,
}

fn next_generation(generation: NonZeroU32) -> NonZeroU32 {
    match NonZeroU32::new(generation.get().wrapping_add(1)) {
        Some(next) => next,
        None => NonZeroU32::new(1).expect("1 is nonzero"),
    }
}

/// Maps entity handles to their current `(archetype, chunk, row)` location.
#[derive(Default)]
pub struct Directory {
    slots: Vec<Slot>,
    free:  Vec<u32>,
    live:  usize,
}

impl Directory {
    /// Allocates a fresh handle, reusing a freed slot if one is available.
    ///
    /// The handle is *reserved* until [`relocate`](Self::relocate) places it;
    /// the structural executor always does both within one operation.
    pub fn allocate(&mut self) -> Entity {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = self.slots.get_mut(index.small_int::<usize>()).expect("free list corrupt");
            slot.generation = next_generation(slot.generation);
            slot.state = SlotState::Reserved;
            Entity { index, generation: slot.generation }
        } else {
            let index: u32 = self.slots.len().small_int();
            let generation = NonZeroU32::new(1).expect("1 is nonzero");
            self.slots.push(Slot { generation, state: SlotState::Reserved });
            Entity { index, generation }
        }
    }

    /// Clears the slot and pushes it onto the free list.
    ///
    /// The generation is bumped on the *next* reuse, not here, which is what
    /// lets a second `free` of the same handle be reported as
    /// [`Error::DoubleFree`] rather than corrupting an unrelated entity.
    pub fn free(&mut self, entity: Entity) -> Result<()> {
        let slot = self.slot_mut(entity)?;
        if matches!(slot.state, SlotState::Free) {
            return Err(Error::DoubleFree { index: entity.index });
        }
        slot.state = SlotState::Free;
        self.free.push(entity.index);
        self.live -= 1;
        Ok(())
    }

    /// Resolves a handle to its current location.
    pub fn locate(&self, entity: Entity) -> Result<Location> {
        let slot = self.slot(entity)?;
        match slot.state {
            SlotState::Live(location) => Ok(location),
            SlotState::Free => Err(entity.stale_error()),
            SlotState::Reserved => panic!("entity {} allocated but never placed", entity.index),
        }
    }

    /// Points a handle at a new location after a row move.
    pub(crate) fn relocate(&mut self, entity: Entity, location: Location) {
        let slot = self.slot_mut(entity).expect("relocating a dead entity");
        slot.state = SlotState::Live(location);
    }

    /// The number of currently live or reserved entities.
    pub fn len(&self) -> usize { self.live }

    /// Whether no entities are live.
    pub fn is_empty(&self) -> bool { self.live == 0 }

    /// Frees every slot while preserving generations,
    /// so handles issued before the reset come back stale, not dangling.
    pub(crate) fn reset(&mut self) {
        self.free.clear();
        for (index, slot) in self.slots.iter_mut().enumerate().rev() {
            slot.state = SlotState::Free;
            self.free.push(index.small_int());
        }
        self.live = 0;
    }

    fn slot(&self, entity: Entity) -> Result<&Slot> {
        let slot = self
            .slots
            .get(entity.index.small_int::<usize>())
            .ok_or(Error::InvalidEntity { index: entity.index })?;
        if slot.generation != entity.generation {
            return Err(entity.stale_error());
        }
        Ok(slot)
    }

    fn slot_mut(&mut self, entity: Entity) -> Result<&mut Slot> {
        let slot = self
            .slots
            .get_mut(entity.index.small_int::<usize>())
            .ok_or(Error::InvalidEntity { index: entity.index })?;
        if slot.generation != entity.generation {
            return Err(entity.stale_error());
        }
        Ok(slot)
    }
}

static_assertions::assert_impl_all!(Directory: Send, Sync);
static_assertions::assert_impl_all!(Entity: Send, Sync, Copy);

#[cfg(test)]
mod tests {
    use super::*;

    fn place(directory: &mut Directory, entity: Entity) {
        directory.relocate(entity, Location { archetype: ArchetypeId(0), chunk: 0, row: 0 });
    }

    #[test]
    fn freed_slot_is_reused_with_new_generation() {
        let mut directory = Directory::default();
        let first = directory.allocate();
        place(&mut directory, first);
        directory.free(first).unwrap();

        let second = directory.allocate();
        assert_eq!(second.index(), first.index());
        assert_ne!(second.generation(), first.generation());
    }

    #[test]
    fn locate_after_free_is_stale() {
        let mut directory = Directory::default();
        let entity = directory.allocate();
        place(&mut directory, entity);
        directory.free(entity).unwrap();

        assert_eq!(
            directory.locate(entity),
            Err(Error::StaleEntity { index: entity.index(), generation: entity.generation() }),
        );
    }

    #[test]
    fn double_free_is_detected() {
        let mut directory = Directory::default();
        let entity = directory.allocate();
        place(&mut directory, entity);
        directory.free(entity).unwrap();
        assert_eq!(directory.free(entity), Err(Error::DoubleFree { index: entity.index() }));
    }

    #[test]
    fn unallocated_index_is_invalid() {
        let directory = Directory::default();
        let mut other = Directory::default();
        let entity = other.allocate();
        assert_eq!(directory.locate(entity), Err(Error::InvalidEntity { index: 0 }));
    }
}
