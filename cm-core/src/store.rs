//! Keyed resource store
//!
//! String-keyed map from resource key to cached record handle. A sub-resource is
//! reachable under two keys, one by 1-based ordinal and one by name, both scoped to
//! the owning entity. The store does no locking of its own; it lives inside the
//! shared cache and is only touched with the cache lock held.

use std::collections::HashMap;
use std::fmt;

use cm_error::{ChassisError, Result};
use cm_protocol::{EntityType, ResourceClass};

use crate::data::ChildKind;

/// Unique identifier of one cached record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey(String);

impl ResourceKey {
    pub fn entity(entity_type: EntityType, slot: u32) -> Self {
        Self(format!("{}/{}/{}", ResourceClass::Entity, entity_type, slot))
    }

    pub fn child_by_ordinal(
        kind: ChildKind,
        entity_type: EntityType,
        slot: u32,
        ordinal: u32,
    ) -> Self {
        Self(format!("{}/{}/{}/#{}", kind.class(), entity_type, slot, ordinal))
    }

    pub fn child_by_name(kind: ChildKind, entity_type: EntityType, slot: u32, name: &str) -> Self {
        Self(format!("{}/{}/{}/@{}", kind.class(), entity_type, slot, name))
    }

    pub fn ext_control_group(name: &str) -> Self {
        Self(format!("{}/{}", ResourceClass::ExtControlGroup, name))
    }

    pub fn nvram(tag: u64) -> Self {
        Self(format!("{}/{}", ResourceClass::Nvram, tag))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug)]
pub struct ResourceStore<V> {
    entries: HashMap<ResourceKey, V>,
}

impl<V> ResourceStore<V> {
    pub fn new() -> Self {
        Self { entries: HashMap::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { entries: HashMap::with_capacity(capacity) }
    }

    /// Insert a record under a key that must not already be present
    pub fn insert(&mut self, key: ResourceKey, value: V) -> Result<()> {
        if self.entries.contains_key(&key) {
            return Err(ChassisError::StoreInsert(key.0));
        }
        self.entries.insert(key, value);
        Ok(())
    }

    /// Remove a record, handing it back to the caller
    pub fn remove(&mut self, key: &ResourceKey) -> Option<V> {
        self.entries.remove(key)
    }

    pub fn get(&self, key: &ResourceKey) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &ResourceKey> {
        self.entries.keys()
    }
}

impl<V> Default for ResourceStore<V> {
    fn default() -> Self {
        Self::new()
    }
}
