//! Error kinds surfaced by store operations.
//!
//! All failures here are local and synchronous.
//! Idempotent no-ops (adding a component that is already present,
//! removing one that is absent) are successes, not errors.

/// Convenience alias for results of store operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The error type for all fallible store operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The entity handle refers to a slot that has been freed
    /// or recycled under a newer generation.
    #[error("entity {index}v{generation} is stale")]
    StaleEntity {
        /// The slot index of the offending handle.
        index:      u32,
        /// The generation of the offending handle.
        generation: u32,
    },

    /// The operation refers to an entity that does not exist in the directory.
    #[error("entity index {index} was never allocated")]
    InvalidEntity {
        /// The out-of-range slot index.
        index: u32,
    },

    /// The entity slot was already freed and has not been reused since.
    #[error("entity {index} freed twice")]
    DoubleFree {
        /// The slot index freed twice.
        index: u32,
    },

    /// No more component type ids can be assigned.
    #[error("component type registry exhausted ({max} ids)")]
    RegistryExhausted {
        /// The fixed id capacity of the registry.
        max: usize,
    },

    /// The query filter is contradictory and can never match.
    #[error("invalid query: {reason}")]
    InvalidQuery {
        /// Why the filter is contradictory.
        reason: &'static str,
    },

    /// The command buffer was already played back.
    #[error("command buffer is consumed")]
    BufferClosed,

    /// The archetype row stride does not fit in a chunk block.
    #[error("archetype stride {stride} exceeds chunk block size {block_bytes}")]
    CapacityExceeded {
        /// Bytes required per row.
        stride:      usize,
        /// Bytes available per chunk.
        block_bytes: usize,
    },
}
