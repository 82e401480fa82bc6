//! An archetype is a normalized set of component types and the chunks that
//! store its entities.
//!
//! Archetypes are created lazily the first time a type set is used and are
//! never destroyed while the store lives; only their chunk lists grow and
//! shrink. Two requests for the same normalized set always resolve to the
//! same [`ArchetypeId`].

use std::sync::Arc;

use bitvec::vec::BitVec;
use indexmap::IndexMap;
use xias::Xias;

use crate::comp::{Registry, TypeIndex, TypeInfo};
use crate::error::Result;
use crate::shared::{ValueId, Values};
use crate::storage::{Chunk, ChunkLayout};

/// Identifies an archetype within its store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArchetypeId(pub(crate) u32);

impl ArchetypeId {
    pub(crate) fn usize(self) -> usize { self.0.small_int() }
}

/// One archetype: its type set, chunk layout and chunk list.
pub struct Archetype {
    id:           ArchetypeId,
    /// All component types, sorted and duplicate-free.
    types:        Box<[TypeIndex]>,
    /// Membership bits indexed by [`TypeIndex`].
    signature:    BitVec,
    /// The shared subset of `types`, in sorted order. Chunk grouping
    /// assignments use this order.
    shared_types: Box<[TypeIndex]>,
    layout:       Arc<ChunkLayout>,
    chunks:       Vec<Chunk>,
    /// Most-recently-used chunk per grouping assignment. Entries may go
    /// stale when the chunk list shifts; users revalidate before trusting.
    recent:       IndexMap<Box<[ValueId]>, usize>,
    /// Retired empty chunks kept around for reuse.
    pool:         Vec<Chunk>,
    pool_cap:     usize,
}

impl Archetype {
    fn new(
        id: ArchetypeId,
        types: Box<[TypeIndex]>,
        registry: &Registry,
        block_bytes: usize,
        pool_cap: usize,
    ) -> Result<Self> {
        let mut signature = BitVec::new();
        for &ty in &*types {
            if signature.len() <= ty.usize() {
                signature.resize(ty.usize() + 1, false);
            }
            signature.set(ty.usize(), true);
        }

        let mut shared_types = Vec::new();
        let mut unshared = Vec::<TypeInfo>::new();
        for &ty in &*types {
            let info = registry.info(ty);
            if info.shared {
                shared_types.push(ty);
            } else {
                unshared.push(info.clone());
            }
        }

        let layout = Arc::new(ChunkLayout::compute(block_bytes, &unshared)?);
        log::trace!(
            "archetype {id:?} created: {} types, capacity {}",
            types.len(),
            layout.capacity(),
        );
        Ok(Self {
            id,
            types,
            signature,
            shared_types: shared_types.into(),
            layout,
            chunks: Vec::new(),
            recent: IndexMap::new(),
            pool: Vec::new(),
            pool_cap,
        })
    }

    /// The id of this archetype.
    pub fn id(&self) -> ArchetypeId { self.id }

    /// All component types, sorted and duplicate-free.
    pub fn types(&self) -> &[TypeIndex] { &self.types }

    /// The shared (grouping) subset of the type set, sorted.
    pub fn shared_types(&self) -> &[TypeIndex] { &self.shared_types }

    /// Whether the type set contains `ty`.
    pub fn contains(&self, ty: TypeIndex) -> bool {
        self.signature.get(ty.usize()).map_or(false, |bit| *bit)
    }

    /// The chunk layout, shared by all chunks of this archetype.
    pub fn layout(&self) -> &Arc<ChunkLayout> { &self.layout }

    /// The live chunks, in list order.
    pub fn chunks(&self) -> &[Chunk] { &self.chunks }

    /// One chunk by index.
    pub fn chunk(&self, index: usize) -> &Chunk {
        self.chunks.get(index).expect("chunk index out of bounds")
    }

    pub(crate) fn chunk_mut(&mut self, index: usize) -> &mut Chunk {
        self.chunks.get_mut(index).expect("chunk index out of bounds")
    }

    /// Disjoint access to a destination and a source chunk.
    pub(crate) fn chunk_pair_mut(&mut self, dst: usize, src: usize) -> (&mut Chunk, &Chunk) {
        assert_ne!(dst, src, "chunk pair must be disjoint");
        if dst < src {
            let (left, right) = self.chunks.split_at_mut(src);
            (&mut left[dst], &right[0])
        } else {
            let (left, right) = self.chunks.split_at_mut(dst);
            (&mut right[0], &left[src])
        }
    }

    /// The total number of rows across all chunks.
    pub fn row_count(&self) -> usize { self.chunks.iter().map(Chunk::count).sum() }

    /// Returns the index of a chunk with the given grouping assignment and at
    /// least one free row, creating (or reviving from the pool) one if needed.
    ///
    /// Creating a chunk retains every id in `assignment`.
    pub(crate) fn open_chunk(&mut self, assignment: &[ValueId], values: &mut Values) -> usize {
        debug_assert_eq!(assignment.len(), self.shared_types.len(), "grouping assignment arity");

        if let Some(&index) = self.recent.get(assignment) {
            if let Some(chunk) = self.chunks.get(index) {
                if !chunk.is_full() && chunk.shared_values() == assignment {
                    return index;
                }
            }
        }

        if let Some(index) = self
            .chunks
            .iter()
            .position(|chunk| !chunk.is_full() && chunk.shared_values() == assignment)
        {
            self.recent.insert(assignment.into(), index);
            return index;
        }

        for &id in assignment {
            values.retain(id);
        }
        let chunk = match self.pool.pop() {
            Some(mut chunk) => {
                chunk.set_shared_values(assignment.into());
                chunk
            }
            None => Chunk::new(Arc::clone(&self.layout), assignment.into()),
        };
        let index = self.chunks.len();
        self.chunks.push(chunk);
        self.recent.insert(assignment.into(), index);
        index
    }

    /// Removes an emptied chunk from the list, releasing its grouping values
    /// and pooling the block for reuse.
    ///
    /// Returns `true` if another chunk was swapped into `index`, in which
    /// case the caller must repoint the directory entries of its entities.
    pub(crate) fn retire_chunk(&mut self, index: usize, values: &mut Values) -> bool {
        let mut chunk = self.chunks.swap_remove(index);
        debug_assert!(chunk.is_empty(), "retiring a non-empty chunk");
        for &id in &*chunk.take_shared_values() {
            values.release(id);
        }
        if self.pool.len() < self.pool_cap {
            self.pool.push(chunk);
        }
        // Indices shifted; drop all cached positions rather than chase them.
        self.recent.clear();
        index < self.chunks.len()
    }

    /// Drops every row and retires every chunk. Used by the store-wide
    /// reset; the caller repoints or frees the affected directory entries.
    pub(crate) fn reset(&mut self, values: &mut Values) {
        while let Some(mut chunk) = self.chunks.pop() {
            chunk.clear_rows();
            for &id in &*chunk.take_shared_values() {
                values.release(id);
            }
            if self.pool.len() < self.pool_cap {
                self.pool.push(chunk);
            }
        }
        self.recent.clear();
    }
}

/// The table of all archetypes in a store.
pub(crate) struct Archetypes {
    /// Normalized type set → id. The entry's map index equals the id.
    index:       IndexMap<Box<[TypeIndex]>, ArchetypeId>,
    list:        Vec<Archetype>,
    block_bytes: usize,
    pool_cap:    usize,
}

impl Archetypes {
    pub(crate) fn new(block_bytes: usize, pool_cap: usize) -> Self {
        Self { index: IndexMap::new(), list: Vec::new(), block_bytes, pool_cap }
    }

    /// Resolves a normalized (sorted, duplicate-free) type set to its
    /// archetype, creating it on first use.
    pub(crate) fn get_or_create(
        &mut self,
        types: &[TypeIndex],
        registry: &Registry,
    ) -> Result<ArchetypeId> {
        debug_assert!(types.windows(2).all(|pair| pair[0] < pair[1]), "type set not normalized");
        if let Some(&id) = self.index.get(types) {
            return Ok(id);
        }

        let id = ArchetypeId(self.list.len().small_int());
        let archetype = Archetype::new(id, types.into(), registry, self.block_bytes, self.pool_cap)?;
        self.list.push(archetype);
        self.index.insert(types.into(), id);
        Ok(id)
    }

    pub(crate) fn get(&self, id: ArchetypeId) -> &Archetype {
        self.list.get(id.usize()).expect("ArchetypeId out of range")
    }

    pub(crate) fn get_mut(&mut self, id: ArchetypeId) -> &mut Archetype {
        self.list.get_mut(id.usize()).expect("ArchetypeId out of range")
    }

    /// Disjoint access to two distinct archetypes.
    pub(crate) fn get2_mut(
        &mut self,
        first: ArchetypeId,
        second: ArchetypeId,
    ) -> (&mut Archetype, &mut Archetype) {
        assert_ne!(first, second, "archetype pair must be disjoint");
        let (a, b) = (first.usize(), second.usize());
        if a < b {
            let (left, right) = self.list.split_at_mut(b);
            (&mut left[a], &mut right[0])
        } else {
            let (left, right) = self.list.split_at_mut(a);
            (&mut right[0], &mut left[b])
        }
    }

    pub(crate) fn len(&self) -> usize { self.list.len() }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Archetype> { self.list.iter() }
}
