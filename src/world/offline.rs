//! Deferred structural changes: recorded concurrently, applied by one
//! exclusive playback pass.
//!
//! A [`CommandBuffer`] is split into per-producer shards. Each producer
//! appends `(sort key, operation)` intents to its own [`Writer`] without
//! synchronizing with the others. Playback merges all shards, orders the
//! entries by sort key (ties broken by shard index, then append order) and
//! applies each as an immediate structural call against the store.
//!
//! The join between the parallel recording phase and playback is modeled by
//! the borrow checker: writers mutably borrow the buffer, so playback cannot
//! start until every writer is gone. Consumption is modeled with an explicit
//! flag: a played-back buffer rejects further use with
//! [`BufferClosed`](Error::BufferClosed).
//!
//! Operations recorded through the buffer's own non-keyed methods carry
//! sort key 0 and therefore play back in plain append order; no ordering is
//! promised between keyed and non-keyed entries beyond the sort itself.

use rayon::slice::ParallelSliceMut;
use xias::Xias;

use crate::archetype::ArchetypeId;
use crate::comp::TypeIndex;
use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::world::World;

enum Op {
    Create { archetype: ArchetypeId, components: Vec<(TypeIndex, Box<[u8]>)> },
    Destroy { entity: Entity },
    Add { entity: Entity, ty: TypeIndex },
    Remove { entity: Entity, ty: TypeIndex },
    SetShared { entity: Entity, ty: TypeIndex, bytes: Box<[u8]> },
    Set { entity: Entity, ty: TypeIndex, bytes: Box<[u8]> },
}

struct Entry {
    sort_key: u32,
    op:       Op,
}

/// One producer's append log.
#[derive(Default)]
struct Shard {
    entries: Vec<Entry>,
}

/// A non-blocking recording handle for one producer.
///
/// Writers are handed out by [`CommandBuffer::writers`], one per shard, and
/// may be moved to worker threads. Appends through different writers never
/// contend.
pub struct Writer<'b> {
    shard: &'b mut Shard,
}

impl Writer<'_> {
    fn push(&mut self, sort_key: u32, op: Op) { self.shard.entries.push(Entry { sort_key, op }); }

    /// Queues creation of an entity in `archetype`.
    pub fn create_entity(&mut self, sort_key: u32, archetype: ArchetypeId) {
        self.push(sort_key, Op::Create { archetype, components: Vec::new() });
    }

    /// Queues creation of an entity with one initial component value.
    pub fn create_entity_with<T: bytemuck::Pod>(
        &mut self,
        sort_key: u32,
        archetype: ArchetypeId,
        ty: TypeIndex,
        value: &T,
    ) {
        let components = vec![(ty, bytemuck::bytes_of(value).into())];
        self.push(sort_key, Op::Create { archetype, components });
    }

    /// Queues destruction of an entity.
    pub fn destroy_entity(&mut self, sort_key: u32, entity: Entity) {
        self.push(sort_key, Op::Destroy { entity });
    }

    /// Queues adding component `ty` to an entity.
    pub fn add_component(&mut self, sort_key: u32, entity: Entity, ty: TypeIndex) {
        self.push(sort_key, Op::Add { entity, ty });
    }

    /// Queues removing component `ty` from an entity.
    pub fn remove_component(&mut self, sort_key: u32, entity: Entity, ty: TypeIndex) {
        self.push(sort_key, Op::Remove { entity, ty });
    }

    /// Queues a grouping-value change.
    pub fn set_shared<T: bytemuck::Pod>(
        &mut self,
        sort_key: u32,
        entity: Entity,
        ty: TypeIndex,
        value: &T,
    ) {
        self.push(sort_key, Op::SetShared { entity, ty, bytes: bytemuck::bytes_of(value).into() });
    }

    /// Queues a component-value write.
    pub fn set_component<T: bytemuck::Pod>(
        &mut self,
        sort_key: u32,
        entity: Entity,
        ty: TypeIndex,
        value: &T,
    ) {
        self.push(sort_key, Op::Set { entity, ty, bytes: bytemuck::bytes_of(value).into() });
    }
}

/// An append-only log of deferred structural changes.
pub struct CommandBuffer {
    shards:   Vec<Shard>,
    consumed: bool,
}

impl CommandBuffer {
    /// Creates a buffer with one append shard per expected producer.
    pub fn new(num_shards: usize) -> Self {
        assert!(num_shards > 0, "a command buffer needs at least one shard");
        Self { shards: (0..num_shards).map(|_| Shard::default()).collect(), consumed: false }
    }

    /// Hands out one [`Writer`] per shard for the parallel recording phase.
    ///
    /// All writers borrow the buffer, so playback cannot begin until every
    /// writer has been dropped; that borrow is the producer join barrier.
    pub fn writers(&mut self) -> Result<Vec<Writer<'_>>> {
        if self.consumed {
            return Err(Error::BufferClosed);
        }
        Ok(self.shards.iter_mut().map(|shard| Writer { shard }).collect())
    }

    /// The number of recorded entries.
    pub fn len(&self) -> usize { self.shards.iter().map(|shard| shard.entries.len()).sum() }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    fn record(&mut self, op: Op) -> Result<()> {
        if self.consumed {
            return Err(Error::BufferClosed);
        }
        let shard = self.shards.first_mut().expect("buffer has at least one shard");
        shard.entries.push(Entry { sort_key: 0, op });
        Ok(())
    }

    /// Queues creation of an entity in append order (sort key 0).
    pub fn create_entity(&mut self, archetype: ArchetypeId) -> Result<()> {
        self.record(Op::Create { archetype, components: Vec::new() })
    }

    /// Queues destruction of an entity in append order.
    pub fn destroy_entity(&mut self, entity: Entity) -> Result<()> {
        self.record(Op::Destroy { entity })
    }

    /// Queues adding component `ty` to an entity in append order.
    pub fn add_component(&mut self, entity: Entity, ty: TypeIndex) -> Result<()> {
        self.record(Op::Add { entity, ty })
    }

    /// Queues removing component `ty` from an entity in append order.
    pub fn remove_component(&mut self, entity: Entity, ty: TypeIndex) -> Result<()> {
        self.record(Op::Remove { entity, ty })
    }

    /// Queues a grouping-value change in append order.
    pub fn set_shared<T: bytemuck::Pod>(
        &mut self,
        entity: Entity,
        ty: TypeIndex,
        value: &T,
    ) -> Result<()> {
        self.record(Op::SetShared { entity, ty, bytes: bytemuck::bytes_of(value).into() })
    }

    /// Queues a component-value write in append order.
    pub fn set_component<T: bytemuck::Pod>(
        &mut self,
        entity: Entity,
        ty: TypeIndex,
        value: &T,
    ) -> Result<()> {
        self.record(Op::Set { entity, ty, bytes: bytemuck::bytes_of(value).into() })
    }

    /// Applies every recorded entry to `world` in sort-key order and
    /// consumes the buffer. Returns the number of applied entries.
    ///
    /// Playback is single-threaded and exclusive. If an entry fails, the
    /// error is returned, entries applied before it stay applied, and the
    /// buffer still counts as consumed; retry policy belongs to the caller.
    pub fn playback(&mut self, world: &mut World) -> Result<usize> {
        if self.consumed {
            return Err(Error::BufferClosed);
        }
        self.consumed = true;

        let mut entries: Vec<(u32, u32, u32, Op)> = Vec::with_capacity(self.len());
        for (shard_index, shard) in self.shards.iter_mut().enumerate() {
            entries.extend(
                shard
                    .entries
                    .drain(..)
                    .enumerate()
                    .map(|(seq, entry)| {
                        (entry.sort_key, shard_index.small_int(), seq.small_int(), entry.op)
                    }),
            );
        }
        entries.par_sort_by_key(|&(sort_key, shard, seq, _)| (sort_key, shard, seq));

        let total = entries.len();
        log::debug!("playing back {total} commands");
        for (_, _, _, op) in entries {
            apply(world, op)?;
        }
        Ok(total)
    }
}

fn apply(world: &mut World, op: Op) -> Result<()> {
    match op {
        Op::Create { archetype, components } => {
            let entity = world.create(archetype);
            for (ty, bytes) in components {
                world.set_component_bytes(entity, ty, &bytes)?;
            }
            Ok(())
        }
        Op::Destroy { entity } => world.destroy(entity),
        Op::Add { entity, ty } => world.add_component(entity, ty),
        Op::Remove { entity, ty } => world.remove_component(entity, ty),
        Op::SetShared { entity, ty, bytes } => world.set_shared_bytes(entity, ty, &bytes),
        Op::Set { entity, ty, bytes } => world.set_component_bytes(entity, ty, &bytes),
    }
}

static_assertions::assert_impl_all!(CommandBuffer: Send, Sync);
static_assertions::assert_impl_all!(Writer<'static>: Send);
