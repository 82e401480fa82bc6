//! Declarative filters over archetypes and grouping values.
//!
//! A [`Query`] matches an archetype iff every required type is in its set,
//! no excluded type is, and (when an any-of set is given) at least one
//! any-of type is. Within a matching archetype, a chunk additionally
//! matches iff its grouping assignment equals every shared-value filter.
//!
//! Contradictory filters are rejected with
//! [`InvalidQuery`](Error::InvalidQuery) when the query is built, not when
//! it is evaluated.
//!
//! Evaluation caches the matched-archetype list keyed by the store's
//! structural version and recomputes whenever the version has advanced;
//! row and chunk data are always read live, so a snapshot taken after a
//! mutation is a fresh, consistent view.

use parking_lot::Mutex;

use crate::archetype::{Archetype, ArchetypeId};
use crate::comp::TypeIndex;
use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::shared::ValueId;
use crate::storage::Chunk;
use crate::world::World;

/// Builds a [`Query`]. Obtained from [`World::query`].
pub struct Builder<'w> {
    world:   &'w World,
    all:     Vec<TypeIndex>,
    none:    Vec<TypeIndex>,
    any:     Vec<TypeIndex>,
    filters: Vec<(TypeIndex, Box<[u8]>)>,
}

impl<'w> Builder<'w> {
    pub(crate) fn new(world: &'w World) -> Self {
        Self { world, all: Vec::new(), none: Vec::new(), any: Vec::new(), filters: Vec::new() }
    }

    /// Requires `ty` to be present.
    pub fn with(mut self, ty: TypeIndex) -> Self {
        self.all.push(ty);
        self
    }

    /// Requires `ty` to be absent.
    pub fn without(mut self, ty: TypeIndex) -> Self {
        self.none.push(ty);
        self
    }

    /// Requires at least one of the types passed through `with_any` calls
    /// to be present.
    pub fn with_any(mut self, ty: TypeIndex) -> Self {
        self.any.push(ty);
        self
    }

    /// Requires the grouping value of the shared component `ty` to equal
    /// `value`. Implies `with(ty)`.
    ///
    /// # Panics
    /// Panics if `ty` was not registered from `T`.
    pub fn filter_shared<T: bytemuck::Pod>(mut self, ty: TypeIndex, value: &T) -> Self {
        self.world.registry().check_typed::<T>(ty);
        self.filters.push((ty, bytemuck::bytes_of(value).into()));
        self
    }

    /// Validates the filter and produces a reusable [`Query`].
    pub fn build(self) -> Result<Query> {
        let Self { world, mut all, mut none, mut any, filters } = self;

        for &(ty, _) in &filters {
            if !world.registry().info(ty).shared {
                return Err(Error::InvalidQuery {
                    reason: "grouping filter on a per-entity component",
                });
            }
            all.push(ty);
        }

        all.sort_unstable();
        all.dedup();
        none.sort_unstable();
        none.dedup();
        any.sort_unstable();
        any.dedup();

        if all.iter().any(|ty| none.binary_search(ty).is_ok()) {
            return Err(Error::InvalidQuery { reason: "type both required and excluded" });
        }
        if any.iter().any(|ty| none.binary_search(ty).is_ok()) {
            return Err(Error::InvalidQuery { reason: "any-of type also excluded" });
        }
        if let [only] = any[..] {
            if all.binary_search(&only).is_ok() {
                return Err(Error::InvalidQuery {
                    reason: "single any-of type already required",
                });
            }
        }

        Ok(Query {
            all: all.into(),
            none: none.into(),
            any: any.into(),
            filters: filters.into(),
            cache: Mutex::new(None),
        })
    }
}

struct Cache {
    version:    u64,
    archetypes: Vec<ArchetypeId>,
}

/// An immutable, reusable filter descriptor.
///
/// A query may be evaluated any number of times; each evaluation reflects
/// the store as of that call.
pub struct Query {
    all:     Box<[TypeIndex]>,
    none:    Box<[TypeIndex]>,
    any:     Box<[TypeIndex]>,
    filters: Box<[(TypeIndex, Box<[u8]>)]>,
    cache:   Mutex<Option<Cache>>,
}

impl Query {
    fn matches_archetype(&self, archetype: &Archetype) -> bool {
        self.all.iter().all(|&ty| archetype.contains(ty))
            && !self.none.iter().any(|&ty| archetype.contains(ty))
            && (self.any.is_empty() || self.any.iter().any(|&ty| archetype.contains(ty)))
    }

    /// Evaluates the query against the store's current structure.
    pub fn evaluate<'w>(&self, world: &'w World) -> Snapshot<'w> {
        let version = world.structural_version();
        let archetypes = {
            let mut cache = self.cache.lock();
            let stale = cache.as_ref().map_or(true, |cache| cache.version != version);
            if stale {
                let matched: Vec<ArchetypeId> = world
                    .archetype_table()
                    .iter()
                    .filter(|archetype| self.matches_archetype(archetype))
                    .map(Archetype::id)
                    .collect();
                log::trace!(
                    "query recomputed at version {version}: {} archetypes matched",
                    matched.len(),
                );
                *cache = Some(Cache { version, archetypes: matched });
            }
            cache.as_ref().expect("just populated").archetypes.clone()
        };

        // A filter value that was never interned matches nothing.
        let mut filter_ids = Vec::with_capacity(self.filters.len());
        let mut unmatchable = false;
        for (ty, bytes) in &*self.filters {
            match world.shared_values().find(*ty, bytes) {
                Some(id) => filter_ids.push((*ty, id)),
                None => {
                    unmatchable = true;
                    break;
                }
            }
        }

        Snapshot { world, archetypes, filter_ids, unmatchable }
    }
}

static_assertions::assert_impl_all!(Query: Send, Sync);

/// One matching chunk yielded by a [`Snapshot`].
pub struct ChunkRef<'w> {
    /// The archetype owning the chunk.
    pub archetype:   &'w Archetype,
    /// The chunk's index within the archetype's chunk list.
    pub chunk_index: usize,
    /// The chunk itself.
    pub chunk:       &'w Chunk,
}

/// The result of one query evaluation: a lazy, restartable sequence of
/// matching chunks.
pub struct Snapshot<'w> {
    world:       &'w World,
    archetypes:  Vec<ArchetypeId>,
    filter_ids:  Vec<(TypeIndex, ValueId)>,
    unmatchable: bool,
}

impl<'w> Snapshot<'w> {
    /// The raw match data for the batch executor: matched archetype ids and
    /// resolved shared filters, or `None` when a filter value was never
    /// interned (nothing can match).
    pub(crate) fn parts(&self) -> Option<(&[ArchetypeId], &[(TypeIndex, ValueId)])> {
        (!self.unmatchable).then(|| (&self.archetypes[..], &self.filter_ids[..]))
    }

    /// The matched archetypes, in creation order.
    pub fn archetypes(&self) -> impl Iterator<Item = &'w Archetype> + '_ {
        let world = self.world;
        let archetypes = if self.unmatchable { &[][..] } else { &self.archetypes[..] };
        archetypes.iter().map(move |&id| world.archetype_table().get(id))
    }

    /// The matching chunks, grouped by archetype.
    pub fn chunks(&self) -> impl Iterator<Item = ChunkRef<'w>> + '_ {
        self.archetypes().flat_map(move |archetype| {
            // Positions of the filtered shared types within this archetype's
            // grouping assignment.
            let filter_slots: Vec<(usize, ValueId)> = self
                .filter_ids
                .iter()
                .map(|&(ty, id)| {
                    let slot = archetype
                        .shared_types()
                        .iter()
                        .position(|&shared| shared == ty)
                        .expect("filter type required by query but absent from matched archetype");
                    (slot, id)
                })
                .collect();

            archetype.chunks().iter().enumerate().filter_map(move |(chunk_index, chunk)| {
                let matched = filter_slots
                    .iter()
                    .all(|&(slot, id)| chunk.shared_values()[slot] == id);
                matched.then_some(ChunkRef { archetype, chunk_index, chunk })
            })
        })
    }

    /// The total number of matching rows.
    pub fn row_count(&self) -> usize {
        self.chunks().map(|chunk_ref| chunk_ref.chunk.count()).sum()
    }

    /// Every matching entity, in chunk-row order.
    pub fn entities(&self) -> impl Iterator<Item = Entity> + '_ {
        self.chunks().flat_map(|chunk_ref| chunk_ref.chunk.entities().to_vec())
    }
}
