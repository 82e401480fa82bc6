//! A component is a plain-old-data record attached to entities.
//!
//! The store never interprets component contents.
//! Each distinct Rust type is registered once and receives a stable
//! [`TypeIndex`]; the registry records its byte size, alignment and whether
//! it is a *shared* (grouping) component or a *per-entity* one.
//!
//! Components must be [`bytemuck::Pod`]:
//! rows are zero-initialized on creation, relocated byte-for-byte between
//! chunks, and shared values are deduplicated by byte equality.
//! All of these are only sound for plain-old-data payloads.

use std::any::{type_name, TypeId};
use std::collections::HashMap;
use std::mem;

use xias::Xias;

use crate::error::{Error, Result};

/// The fixed maximum number of component types a store can register.
pub const MAX_TYPES: usize = 1 << 14;

/// A stable numeric identifier for a registered component type.
///
/// Indices are assigned in registration order and are only meaningful
/// within the store that issued them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeIndex(pub(crate) u16);

impl TypeIndex {
    pub(crate) fn usize(self) -> usize { self.0.small_int() }
}

/// Layout and kind of a registered component type.
#[derive(Debug, Clone)]
pub struct TypeInfo {
    /// The id assigned at registration.
    pub id:     TypeIndex,
    /// Byte size of one value. Zero for tag types.
    pub size:   usize,
    /// Required alignment of the column start.
    pub align:  usize,
    /// Whether values are deduplicated per chunk instead of stored per row.
    pub shared: bool,
    /// The Rust type name, for logs and panic messages only.
    pub name:   &'static str,

    pub(crate) type_id: TypeId,
}

/// Assigns [`TypeIndex`] values to component types and records their layout.
///
/// The registry lives as long as the store that owns it;
/// descriptors are immutable once registered.
#[derive(Default)]
pub struct Registry {
    infos:   Vec<TypeInfo>,
    by_type: HashMap<TypeId, TypeIndex>,
}

impl Registry {
    /// Registers `T` as a per-entity component, or returns its existing id.
    pub fn register<T: bytemuck::Pod>(&mut self) -> Result<TypeIndex> {
        self.register_with::<T>(false)
    }

    /// Registers `T` as a shared (grouping) component, or returns its existing id.
    pub fn register_shared<T: bytemuck::Pod>(&mut self) -> Result<TypeIndex> {
        self.register_with::<T>(true)
    }

    fn register_with<T: bytemuck::Pod>(&mut self, shared: bool) -> Result<TypeIndex> {
        if let Some(&id) = self.by_type.get(&TypeId::of::<T>()) {
            let info = self.info(id);
            if info.shared != shared {
                panic!(
                    "{} is already registered as a {} component",
                    type_name::<T>(),
                    if info.shared { "shared" } else { "per-entity" },
                );
            }
            return Ok(id);
        }

        if self.infos.len() >= MAX_TYPES {
            return Err(Error::RegistryExhausted { max: MAX_TYPES });
        }

        let id = TypeIndex(self.infos.len().small_int());
        self.infos.push(TypeInfo {
            id,
            size: mem::size_of::<T>(),
            align: mem::align_of::<T>(),
            shared,
            name: type_name::<T>(),
            type_id: TypeId::of::<T>(),
        });
        self.by_type.insert(TypeId::of::<T>(), id);
        log::trace!("registered {} as {id:?} (shared: {shared})", type_name::<T>());
        Ok(id)
    }

    /// Returns the descriptor for a registered id.
    ///
    /// # Panics
    /// Panics if `id` was not issued by this registry.
    pub fn info(&self, id: TypeIndex) -> &TypeInfo {
        self.infos.get(id.usize()).expect("TypeIndex from a different registry")
    }

    /// Returns the id of `T` if it has been registered.
    pub fn lookup<T: bytemuck::Pod>(&self) -> Option<TypeIndex> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    /// The number of registered types.
    pub fn len(&self) -> usize { self.infos.len() }

    /// Whether no types have been registered yet.
    pub fn is_empty(&self) -> bool { self.infos.is_empty() }

    /// Asserts that `id` describes exactly the Rust type `T`.
    ///
    /// This is the gate that makes typed column access sound:
    /// a slice of `T` is only ever produced for a column whose descriptor
    /// was created from `T` itself.
    pub(crate) fn check_typed<T: bytemuck::Pod>(&self, id: TypeIndex) -> &TypeInfo {
        let info = self.info(id);
        if info.type_id != TypeId::of::<T>() {
            panic!("{id:?} is {}, not {}", info.name, type_name::<T>());
        }
        info
    }
}
