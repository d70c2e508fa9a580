//! Shared hardware-state cache
//!
//! `Cache` owns everything the poll loop, remote poller and request handler share:
//! the resource store, the entity arena, external-control groups, the hardware
//! layer and the NVRAM cache. `SharedCache` wraps it in one process-wide lock that
//! is only ever taken with a bounded wait.
//!
//! The lock is not re-entrant. Code running under it receives `&mut Cache` and must
//! not acquire again.

use std::sync::Arc;
use std::time::Duration;

use cm_error::{ChassisError, Result};
use cm_protocol::{EntityType, Notification, ResourceLocator};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::constants::timing;
use crate::data::{ChildKind, Entity, EntityAddr, EntityId, ExtControlGroup, PlatformConfig};
use crate::entity::{self, PollContext};
use crate::hw::Hal;
use crate::nvram::Nvram;
use crate::store::{ResourceKey, ResourceStore};

/// What a resource key resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceRef {
    Entity(EntityId),
    /// Child at `ordinal` (1-based) within its kind's collection on `entity`
    Child { entity: EntityId, kind: ChildKind, ordinal: u32 },
    ExtControlGroup(usize),
}

pub struct Cache {
    config: PlatformConfig,
    store: ResourceStore<ResourceRef>,
    entities: Vec<Entity>,
    ext_groups: Vec<ExtControlGroup>,
    hal: Box<dyn Hal>,
    nvram: Option<Nvram>,
}

impl Cache {
    /// Build the startup cache: one entity per configured slot plus every
    /// external-control group. A store insertion failure here is fatal.
    pub fn build(config: PlatformConfig, hal: Box<dyn Hal>) -> Result<Self> {
        let slots: u32 = EntityType::ALL.iter().map(|t| config.slots.for_type(*t)).sum();
        let mut store = ResourceStore::with_capacity(slots as usize * 16);
        let mut entities = Vec::with_capacity(slots as usize);

        for entity_type in EntityType::ALL {
            for slot in 1..=config.slots.for_type(entity_type) {
                let id = entities.len();
                store.insert(ResourceKey::entity(entity_type, slot), ResourceRef::Entity(id))?;
                entities.push(Entity::new(id, EntityAddr::new(entity_type, slot)));
            }
        }

        let mut ext_groups = Vec::with_capacity(config.ext_control_groups.len());
        for (index, group) in config.ext_control_groups.iter().enumerate() {
            store.insert(
                ResourceKey::ext_control_group(&group.name),
                ResourceRef::ExtControlGroup(index),
            )?;
            ext_groups.push(ExtControlGroup {
                name: group.name.clone(),
                members: group.sensors.clone(),
                temperature: None,
            });
        }

        info!(
            entities = entities.len(),
            ext_groups = ext_groups.len(),
            keys = store.len(),
            "Cache built"
        );
        Ok(Self { config, store, entities, ext_groups, hal, nvram: None })
    }

    pub fn with_nvram(mut self, nvram: Nvram) -> Self {
        self.attach_nvram(nvram);
        self
    }

    /// Install the NVRAM cache once the device has been loaded
    pub fn attach_nvram(&mut self, nvram: Nvram) {
        self.nvram = Some(nvram);
    }

    /// Poll every entity once, in arena order
    pub fn poll_entities(&mut self) -> Vec<Notification> {
        let mut out = Vec::new();
        for id in 0..self.entities.len() {
            out.extend(self.poll_entity(id));
        }
        debug!(notifications = out.len(), "Poll cycle complete");
        out
    }

    pub fn poll_entity(&mut self, id: EntityId) -> Vec<Notification> {
        let Self { config, store, entities, hal, .. } = self;
        let Some(entity) = entities.get_mut(id) else {
            return Vec::new();
        };
        let mut ctx = PollContext { hal: hal.as_mut(), store, config };
        entity::poll_entity(&mut ctx, entity)
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    pub fn store(&self) -> &ResourceStore<ResourceRef> {
        &self.store
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(id)
    }

    pub fn entity_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.entities.get_mut(id)
    }

    pub fn ext_groups(&self) -> &[ExtControlGroup] {
        &self.ext_groups
    }

    pub(crate) fn ext_groups_mut(&mut self) -> &mut [ExtControlGroup] {
        &mut self.ext_groups
    }

    pub fn nvram(&self) -> Option<&Nvram> {
        self.nvram.as_ref()
    }

    pub fn nvram_mut(&mut self) -> Option<&mut Nvram> {
        self.nvram.as_mut()
    }

    /// Hardware layer together with an entity, for handlers that actuate children
    pub(crate) fn hal_and_entity(
        &mut self,
        id: EntityId,
    ) -> Option<(&mut (dyn Hal + '_), &mut Entity, &PlatformConfig)> {
        let Self { hal, entities, config, .. } = self;
        let entity = entities.get_mut(id)?;
        Some((hal.as_mut(), entity, &*config))
    }

    /// Resolve an entity by slot address through the store
    pub fn find_entity(&self, entity_type: EntityType, slot: u32) -> Result<EntityId> {
        let key = ResourceKey::entity(entity_type, slot);
        match self.store.get(&key) {
            Some(ResourceRef::Entity(id)) => Ok(*id),
            _ => Err(ChassisError::not_found(key.to_string())),
        }
    }

    /// Resolve a child by ordinal or name through the store.
    ///
    /// Returns the owning entity and the child's index within its kind.
    pub fn find_child(
        &self,
        kind: ChildKind,
        locator: &ResourceLocator,
    ) -> Result<(EntityId, usize)> {
        let key = match (&locator.name, locator.ordinal) {
            (Some(name), _) => {
                ResourceKey::child_by_name(kind, locator.entity_type, locator.slot, name)
            }
            (None, Some(ordinal)) => {
                ResourceKey::child_by_ordinal(kind, locator.entity_type, locator.slot, ordinal)
            }
            (None, None) => {
                return Err(ChassisError::invalid("locator has neither ordinal nor name"))
            }
        };
        match self.store.get(&key) {
            Some(ResourceRef::Child { entity, kind: found, ordinal }) if *found == kind => {
                Ok((*entity, *ordinal as usize - 1))
            }
            _ => Err(ChassisError::not_found(key.to_string())),
        }
    }

    /// Resolve an external-control group by name through the store
    pub fn find_ext_group(&self, name: &str) -> Result<usize> {
        let key = ResourceKey::ext_control_group(name);
        match self.store.get(&key) {
            Some(ResourceRef::ExtControlGroup(index)) => Ok(*index),
            _ => Err(ChassisError::not_found(key.to_string())),
        }
    }
}

/// The cache behind its process-wide lock
#[derive(Clone)]
pub struct SharedCache {
    inner: Arc<Mutex<Cache>>,
    timeout: Duration,
}

impl SharedCache {
    pub fn new(cache: Cache) -> Self {
        Self { inner: Arc::new(Mutex::new(cache)), timeout: timing::LOCK_TIMEOUT }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Take the lock, giving up after the configured bound
    pub fn acquire(&self) -> Result<MutexGuard<'_, Cache>> {
        self.inner
            .try_lock_for(self.timeout)
            .ok_or(ChassisError::LockTimeout(self.timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ExtControlGroupConfig;
    use crate::hw::SimHal;

    fn built() -> Cache {
        let config = PlatformConfig::default();
        let sim = SimHal::populated(&config);
        Cache::build(config, Box::new(sim)).unwrap()
    }

    #[test]
    fn test_build_creates_one_entity_per_slot() {
        let cache = built();
        assert_eq!(cache.entities().len(), 7);
        assert_eq!(cache.store().len(), 7);
        let id = cache.find_entity(EntityType::FanTray, 4).unwrap();
        assert_eq!(cache.entity(id).unwrap().addr, EntityAddr::new(EntityType::FanTray, 4));
        assert!(cache.find_entity(EntityType::FanTray, 5).unwrap_err().is_not_found());
    }

    #[test]
    fn test_duplicate_group_is_fatal() {
        let mut config = PlatformConfig::default();
        let group = ExtControlGroupConfig { name: "cpu".into(), sensors: vec![] };
        config.ext_control_groups = vec![group.clone(), group];
        let err = Cache::build(config, Box::new(SimHal::new())).err().unwrap();
        assert!(matches!(err, ChassisError::StoreInsert(_)));
    }

    #[test]
    fn test_children_resolvable_after_poll() {
        let mut cache = built();
        cache.poll_entities();
        let by_name = ResourceLocator::by_name(EntityType::Card, 1, "Outlet");
        let (entity, index) = cache.find_child(ChildKind::TemperatureSensor, &by_name).unwrap();
        assert_eq!(cache.entity(entity).unwrap().temp_sensors[index].ordinal, 2);

        let by_ordinal = ResourceLocator::by_ordinal(EntityType::Card, 1, 2);
        assert_eq!(
            cache.find_child(ChildKind::TemperatureSensor, &by_ordinal).unwrap(),
            (entity, index)
        );
        assert!(cache.find_child(ChildKind::Fan, &by_ordinal).unwrap_err().is_not_found());
    }

    #[test]
    fn test_hal_and_entity_split_borrow() {
        let mut cache = built();
        cache.poll_entities();
        let id = cache.find_entity(EntityType::FanTray, 1).unwrap();
        let (hal, entity, config) = cache.hal_and_entity(id).unwrap();
        assert!(hal.entity_present(entity.addr).unwrap());
        assert_eq!(config.slots.for_type(EntityType::FanTray), 4);
        let past_end = cache.entities().len();
        assert!(cache.hal_and_entity(past_end).is_none());
    }

    #[test]
    fn test_acquire_times_out_while_held() {
        let shared = SharedCache::new(built()).with_timeout(Duration::from_millis(20));
        let contender = shared.clone();
        let _guard = shared.acquire().unwrap();
        let handle = std::thread::spawn(move || contender.acquire().map(|_| ()));
        let err = handle.join().unwrap().unwrap_err();
        assert!(matches!(err, ChassisError::LockTimeout(_)));
    }
}
