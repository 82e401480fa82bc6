//! An archetype-chunk entity store for simulation runtimes.
//!
//! densec manages large populations of lightweight entities, each an
//! identifier associated with a mutable set of plain-old-data components.
//! Entities with the same component-type set are grouped into an
//! *archetype*, and an archetype's entities are packed into fixed-capacity,
//! cache-friendly *chunks*, one column per component type.
//!
//! # Shared components
//! A component type can be registered as *shared*: instead of one value per
//! row, every entity in a chunk carries the same value, stored once per
//! chunk as an index into a reference-counted intern table. Changing an
//! entity's shared value moves it to a chunk whose assignment matches, so
//! iteration never branches on grouping values; filtering happens at chunk
//! granularity.
//!
//! # Queries
//! A [`Query`] matches archetypes by required, excluded and any-of type
//! sets, and chunks by shared-value equality. Matched archetype lists are
//! cached against the store's structural version counter and recomputed
//! whenever structure changes; results are never served stale.
//!
//! # Deferred mutation
//! The store allows many concurrent readers but only one structural
//! mutator, enforced by `&`/`&mut` borrows on [`World`]. Worker tasks that
//! want to propose structural changes in parallel record them into a
//! [`CommandBuffer`] through independent per-producer writers; a single
//! playback pass then applies everything in deterministic sort-key order.
//!
//! # What this crate is not
//! The store does not interpret component payloads: no math types, no
//! rendering, no serialization. Components are opaque [`bytemuck::Pod`]
//! records identified by a runtime [`TypeIndex`].

pub mod archetype;
pub use archetype::{Archetype, ArchetypeId};

pub mod comp;
pub use comp::TypeIndex;

pub mod entity;
pub use entity::Entity;

mod error;
pub use error::{Error, Result};

pub mod query;
pub use query::Query;

pub mod shared;
pub use shared::ValueId;

pub mod storage;
pub use storage::Chunk;

pub mod world;
pub use world::{Builder, CommandBuffer, World};
