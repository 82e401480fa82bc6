//! Chunks: fixed-capacity, column-major blocks of component rows.
//!
//! A chunk owns one contiguous heap allocation holding one array per
//! unshared component type of its archetype. Shared component types occupy
//! no per-row bytes; the chunk records a single [`ValueId`] per shared type
//! instead. Rows are packed hole-free in `[0, count)` and removal swaps the
//! last row into the hole.
//!
//! # Unsafe code
//! The block is manually allocated and accessed through raw pointers.
//! Soundness rests on three checks that are all enforced before any pointer
//! is produced:
//! - a column slice for `T` is only created for a column registered from `T`
//!   itself ([`Registry::check_typed`]);
//! - column offsets are laid out in descending alignment order, so every
//!   column start is aligned for its type;
//! - slice lengths are bounded by `count`, never by raw capacity.

use std::alloc::{self, Layout};
use std::ptr::{self, NonNull};
use std::sync::Arc;

use crate::comp::{Registry, TypeIndex, TypeInfo};
use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::shared::ValueId;

/// Placement of one unshared column within the chunk block.
#[derive(Debug, Clone)]
pub(crate) struct Column {
    pub(crate) ty:     TypeIndex,
    pub(crate) size:   usize,
    pub(crate) offset: usize,
}

/// The memory layout shared by every chunk of one archetype.
///
/// Capacity is `floor(block_bytes / stride)` where `stride` is the sum of
/// unshared component sizes, and is constant for the archetype's lifetime.
pub struct ChunkLayout {
    capacity:   usize,
    block:      Layout,
    /// Columns in descending alignment order; iteration order is layout order.
    columns:    Vec<Column>,
}

impl ChunkLayout {
    /// Computes the layout for the given unshared component descriptors.
    ///
    /// An archetype whose unshared components are all zero-sized has no
    /// per-row bytes at all; its chunks hold `block_bytes` rows so that tag
    /// archetypes still chunk finitely.
    pub(crate) fn compute(block_bytes: usize, infos: &[TypeInfo]) -> Result<Self> {
        let stride: usize = infos.iter().map(|info| info.size).sum();
        let capacity = if stride == 0 { block_bytes } else { block_bytes / stride };
        if capacity == 0 {
            return Err(Error::CapacityExceeded { stride, block_bytes });
        }

        let mut ordered: Vec<&TypeInfo> = infos.iter().collect();
        ordered.sort_by_key(|info| (std::cmp::Reverse(info.align), info.id));

        let max_align = ordered.first().map_or(1, |info| info.align);
        let mut columns = Vec::with_capacity(ordered.len());
        let mut offset = 0;
        for info in ordered {
            columns.push(Column { ty: info.id, size: info.size, offset });
            offset += info.size * capacity;
        }

        let block = Layout::from_size_align(offset, max_align)
            .expect("column bytes bounded by block_bytes");
        Ok(Self { capacity, block, columns })
    }

    /// The number of rows a chunk of this layout can hold.
    pub fn capacity(&self) -> usize { self.capacity }

    pub(crate) fn column(&self, ty: TypeIndex) -> Option<&Column> {
        self.columns.iter().find(|column| column.ty == ty)
    }

    pub(crate) fn columns(&self) -> &[Column] { &self.columns }
}

/// A fixed-capacity storage block for entities of one archetype that share
/// one grouping-value assignment.
pub struct Chunk {
    data:          NonNull<u8>,
    layout:        Arc<ChunkLayout>,
    entities:      Vec<Entity>,
    shared_values: Box<[ValueId]>,
}

// The raw block is uniquely owned by the chunk and only reachable through
// `&Chunk` / `&mut Chunk`, so the usual borrow rules make it thread-safe.
unsafe impl Send for Chunk {}
unsafe impl Sync for Chunk {}

impl Chunk {
    /// Allocates an empty chunk.
    ///
    /// `shared_values` must be in the archetype's shared-type order; the
    /// caller (the archetype table) retains each id for the chunk.
    pub(crate) fn new(layout: Arc<ChunkLayout>, shared_values: Box<[ValueId]>) -> Self {
        let data = if layout.block.size() == 0 {
            // No per-row bytes (tag-only archetype): nothing to allocate.
            NonNull::new(layout.block.align() as *mut u8).expect("alignment is nonzero")
        } else {
            NonNull::new(unsafe { alloc::alloc(layout.block) })
                .unwrap_or_else(|| alloc::handle_alloc_error(layout.block))
        };
        let entities = Vec::with_capacity(layout.capacity);
        Self { data, layout, entities, shared_values }
    }

    /// The number of occupied rows.
    pub fn count(&self) -> usize { self.entities.len() }

    /// The row capacity, constant for the owning archetype.
    pub fn capacity(&self) -> usize { self.layout.capacity }

    /// Whether no rows are free.
    pub fn is_full(&self) -> bool { self.count() == self.capacity() }

    /// Whether no rows are occupied.
    pub fn is_empty(&self) -> bool { self.entities.is_empty() }

    /// The entities stored in this chunk, in row order.
    pub fn entities(&self) -> &[Entity] { &self.entities }

    /// The entity occupying `row`.
    pub fn entity(&self, row: usize) -> Entity {
        *self.entities.get(row).expect("row out of bounds")
    }

    /// The grouping-value assignment, in the archetype's shared-type order.
    pub fn shared_values(&self) -> &[ValueId] { &self.shared_values }

    pub(crate) fn set_shared_values(&mut self, shared_values: Box<[ValueId]>) {
        debug_assert!(self.is_empty(), "reassigning grouping values of a non-empty chunk");
        self.shared_values = shared_values;
    }

    /// Takes the grouping assignment out of a chunk being retired,
    /// leaving it empty.
    pub(crate) fn take_shared_values(&mut self) -> Box<[ValueId]> {
        std::mem::take(&mut self.shared_values)
    }

    /// Appends a zero-initialized row for `entity` and returns its index.
    pub(crate) fn push_zeroed(&mut self, entity: Entity) -> usize {
        let row = self.count();
        assert!(row < self.capacity(), "chunk overflow");
        for column in self.layout.columns() {
            if column.size == 0 {
                continue;
            }
            unsafe {
                ptr::write_bytes(self.row_ptr(column, row), 0, column.size);
            }
        }
        self.entities.push(entity);
        row
    }

    /// Appends a row for `entity` copied byte-for-byte from `src_row` of
    /// `src` for every column the two layouts have in common; columns absent
    /// in `src` are zeroed.
    pub(crate) fn push_copied(&mut self, entity: Entity, src: &Chunk, src_row: usize) -> usize {
        debug_assert!(src_row < src.count(), "source row out of bounds");
        let row = self.count();
        assert!(row < self.capacity(), "chunk overflow");
        for column in self.layout.columns() {
            if column.size == 0 {
                continue;
            }
            let dst = unsafe { self.data.as_ptr().add(column.offset + row * column.size) };
            match src.layout.column(column.ty) {
                Some(src_column) => unsafe {
                    debug_assert_eq!(src_column.size, column.size);
                    ptr::copy_nonoverlapping(src.row_ptr_const(src_column, src_row), dst, column.size);
                },
                None => unsafe {
                    ptr::write_bytes(dst, 0, column.size);
                },
            }
        }
        self.entities.push(entity);
        row
    }

    /// Appends a row for `entity` cloned from another row of this chunk.
    pub(crate) fn push_cloned(&mut self, entity: Entity, src_row: usize) -> usize {
        debug_assert!(src_row < self.count(), "source row out of bounds");
        let row = self.count();
        assert!(row < self.capacity(), "chunk overflow");
        for column in self.layout.columns() {
            if column.size == 0 {
                continue;
            }
            // Source and destination rows are distinct, so the ranges cannot
            // overlap.
            unsafe {
                ptr::copy_nonoverlapping(
                    self.row_ptr(column, src_row),
                    self.row_ptr(column, row),
                    column.size,
                );
            }
        }
        self.entities.push(entity);
        row
    }

    /// Drops every row at once; payloads are plain-old-data and need no
    /// per-value teardown.
    pub(crate) fn clear_rows(&mut self) { self.entities.clear(); }

    /// Removes `row` by swapping the last row into it.
    ///
    /// Returns the entity that now occupies `row`, or `None` if the removed
    /// row was the last one. The caller fixes up the directory entry of the
    /// returned entity.
    pub(crate) fn swap_remove(&mut self, row: usize) -> Option<Entity> {
        let last = self.count().checked_sub(1).expect("swap_remove on an empty chunk");
        assert!(row <= last, "row out of bounds");
        if row != last {
            for column in self.layout.columns() {
                if column.size == 0 {
                    continue;
                }
                unsafe {
                    ptr::copy_nonoverlapping(
                        self.row_ptr(column, last),
                        self.row_ptr(column, row),
                        column.size,
                    );
                }
            }
        }
        self.entities.swap_remove(row);
        (row != last).then(|| self.entity(row))
    }

    /// The raw bytes of one component of one row.
    pub fn component_bytes(&self, row: usize, ty: TypeIndex) -> &[u8] {
        assert!(row < self.count(), "row out of bounds");
        let column = self.layout.column(ty).expect("type not in this archetype");
        unsafe { std::slice::from_raw_parts(self.row_ptr_const(column, row), column.size) }
    }

    /// Overwrites one component of one row.
    pub(crate) fn write_component_bytes(&mut self, row: usize, ty: TypeIndex, bytes: &[u8]) {
        assert!(row < self.count(), "row out of bounds");
        let column = self.layout.column(ty).expect("type not in this archetype");
        assert_eq!(bytes.len(), column.size, "payload size mismatch");
        if column.size == 0 {
            return;
        }
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.row_ptr(column, row), column.size);
        }
    }

    /// A typed view of the column for `ty`, length [`count`](Self::count).
    pub fn column<T: bytemuck::Pod>(&self, registry: &Registry, ty: TypeIndex) -> &[T] {
        let info = registry.check_typed::<T>(ty);
        let column = self.layout.column(ty).expect("type not in this archetype");
        debug_assert_eq!(info.size, column.size);
        unsafe {
            std::slice::from_raw_parts(
                self.data.as_ptr().add(column.offset).cast::<T>(),
                self.count(),
            )
        }
    }

    /// A mutable typed view of the column for `ty`.
    pub fn column_mut<T: bytemuck::Pod>(&mut self, registry: &Registry, ty: TypeIndex) -> &mut [T] {
        let info = registry.check_typed::<T>(ty);
        let column = self.layout.column(ty).expect("type not in this archetype");
        debug_assert_eq!(info.size, column.size);
        unsafe {
            std::slice::from_raw_parts_mut(
                self.data.as_ptr().add(column.offset).cast::<T>(),
                self.count(),
            )
        }
    }

    fn row_ptr(&self, column: &Column, row: usize) -> *mut u8 {
        unsafe { self.data.as_ptr().add(column.offset + row * column.size) }
    }

    fn row_ptr_const(&self, column: &Column, row: usize) -> *const u8 {
        unsafe { self.data.as_ptr().add(column.offset + row * column.size) }
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        if self.layout.block.size() > 0 {
            unsafe { alloc::dealloc(self.data.as_ptr(), self.layout.block) };
        }
    }
}

static_assertions::assert_impl_all!(Chunk: Send, Sync);
