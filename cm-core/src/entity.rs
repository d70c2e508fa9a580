//! Entity state machine
//!
//! One poll per entity per cycle, run with the cache lock held:
//!
//! 1. Snapshot and reset the fault-state
//! 2. Read presence (a failed read ends the cycle with nothing changed)
//! 3. Handle insertion (counters, power-on) and removal (EEPROM and children dropped)
//! 4. PSUs: read output power; unpowered means POWER-ERROR and a fresh init later
//! 5. Init with bounded retries; success (re)creates every child record
//! 6. On a full refresh reread identity and EEPROM
//! 7. PSU / fan-tray poll, then debounce the parent fault signal
//! 8. Poll fans, temperature sensors and power monitors
//!
//! The entity is notified at most once per cycle, after everything above.

use cm_protocol::{EntityType, FaultType, Notification, ResourceClass};
use tracing::{debug, info, warn};

use crate::cache::ResourceRef;
use crate::constants::entity as entity_const;
use crate::data::{
    now_millis, ChildKind, Display, Entity, Fan, HwHandle, HwResource, Led, PlatformConfig,
    PowerMonitor,
    TempSensor,
};
use crate::engine::{self, Integrator, ParentState, ThresholdTracker, TypePoll};
use crate::fault::FaultState;
use crate::hw::Hal;
use crate::led;
use crate::store::{ResourceKey, ResourceStore};
use crate::views;

/// Borrowed pieces of the cache an entity poll works on
pub struct PollContext<'a> {
    pub hal: &'a mut dyn Hal,
    pub store: &'a mut ResourceStore<ResourceRef>,
    pub config: &'a PlatformConfig,
}

type Constructor = fn(&mut Entity, u32, HwResource, &PlatformConfig);

/// Child constructors by kind, in creation order
const CONSTRUCTORS: [(ChildKind, Constructor); 5] = [
    (ChildKind::Fan, new_fan),
    (ChildKind::TemperatureSensor, new_temp_sensor),
    (ChildKind::Led, new_led),
    (ChildKind::Display, new_display),
    (ChildKind::PowerMonitor, new_power_monitor),
];

fn new_fan(entity: &mut Entity, ordinal: u32, hw: HwResource, config: &PlatformConfig) {
    entity.fans.push(Fan {
        parent: entity.id,
        ordinal,
        name: hw.name,
        handle: hw.handle,
        valid: false,
        target_speed: None,
        commanded_speed: 0,
        observed_speed: 0,
        max_speed: 0,
        fault_count: 0,
        fault: FaultState::new(),
        speed_control: true,
        margin_pct: config.fan_control.margin_pct,
        integrator: Integrator::new(&config.fan_control),
    });
}

fn new_temp_sensor(entity: &mut Entity, ordinal: u32, hw: HwResource, config: &PlatformConfig) {
    let slots = config.thresholds.count_for(&hw.name);
    entity.temp_sensors.push(TempSensor {
        parent: entity.id,
        ordinal,
        name: hw.name,
        handle: hw.handle,
        fault: FaultState::new(),
        shutdown_threshold: None,
        over_shutdown: false,
        tracker: ThresholdTracker::new(slots),
        last_poll_ms: 0,
    });
}

fn new_led(entity: &mut Entity, ordinal: u32, hw: HwResource, config: &PlatformConfig) {
    let requested = config.led_default(entity.addr.entity_type, &hw.name);
    entity.leds.push(Led {
        parent: entity.id,
        ordinal,
        name: hw.name,
        handle: hw.handle,
        requested,
        applied: None,
    });
}

fn new_display(entity: &mut Entity, ordinal: u32, hw: HwResource, _config: &PlatformConfig) {
    entity.displays.push(Display {
        parent: entity.id,
        ordinal,
        name: hw.name,
        handle: hw.handle,
        message: String::new(),
    });
}

fn new_power_monitor(entity: &mut Entity, ordinal: u32, hw: HwResource, _config: &PlatformConfig) {
    entity.power_monitors.push(PowerMonitor {
        parent: entity.id,
        ordinal,
        name: hw.name,
        handle: hw.handle,
        fault: FaultState::new(),
        reading: None,
    });
}

/// Drop every child record and both of its store keys
pub fn destroy_children(store: &mut ResourceStore<ResourceRef>, entity: &mut Entity) {
    let (entity_type, slot) = (entity.addr.entity_type, entity.addr.slot);
    for kind in ChildKind::ALL {
        for (ordinal, name) in entity.child_names(kind) {
            store.remove(&ResourceKey::child_by_ordinal(kind, entity_type, slot, ordinal));
            store.remove(&ResourceKey::child_by_name(kind, entity_type, slot, &name));
        }
    }
    entity.fans.clear();
    entity.temp_sensors.clear();
    entity.leds.clear();
    entity.displays.clear();
    entity.power_monitors.clear();
}

/// Enumerate hardware and create child records of every kind.
///
/// A failed enumeration or key insertion abandons the rest of that kind only.
pub fn create_children(ctx: &mut PollContext<'_>, entity: &mut Entity) {
    let (entity_type, slot) = (entity.addr.entity_type, entity.addr.slot);
    for (kind, constructor) in CONSTRUCTORS {
        let resources = match ctx.hal.enumerate(entity.addr, kind) {
            Ok(resources) => resources,
            Err(e) => {
                debug!(entity = %entity.addr, %kind, error = %e, "Enumeration failed");
                entity.fault.update(FaultType::CommError);
                continue;
            }
        };
        for hw in resources {
            let ordinal = entity.child_count(kind) as u32 + 1;
            let by_ordinal = ResourceKey::child_by_ordinal(kind, entity_type, slot, ordinal);
            let by_name = ResourceKey::child_by_name(kind, entity_type, slot, &hw.name);
            let target = ResourceRef::Child { entity: entity.id, kind, ordinal };
            if let Err(e) = ctx.store.insert(by_ordinal.clone(), target) {
                warn!(entity = %entity.addr, %kind, error = %e, "Child insert failed");
                break;
            }
            if let Err(e) = ctx.store.insert(by_name, target) {
                ctx.store.remove(&by_ordinal);
                warn!(entity = %entity.addr, %kind, error = %e, "Child insert failed");
                break;
            }
            constructor(entity, ordinal, hw, ctx.config);
        }
    }
    info!(entity = %entity.addr, children = entity.child_counts().total(), "Children created");
    led::resolve_entity(ctx.hal, entity, ctx.config);
}

fn child_notifications(
    entity: &Entity,
    kind: ChildKind,
    changed: &[u32],
    out: &mut Vec<Notification>,
) {
    for &ordinal in changed {
        let key = views::child_key(entity, kind, ordinal);
        let index = ordinal as usize - 1;
        let n = match kind {
            ChildKind::Fan => entity
                .fans
                .get(index)
                .map(|f| {
                    views::notification(ResourceClass::Fan, &key, &views::fan_view(entity, f))
                }),
            ChildKind::TemperatureSensor => entity.temp_sensors.get(index).map(|s| {
                views::notification(
                    ResourceClass::TemperatureSensor,
                    &key,
                    &views::temperature_view(entity, s),
                )
            }),
            ChildKind::PowerMonitor => entity.power_monitors.get(index).map(|m| {
                views::notification(
                    ResourceClass::PowerMonitor,
                    &key,
                    &views::power_monitor_view(entity, m),
                )
            }),
            ChildKind::Led | ChildKind::Display => None,
        };
        out.extend(n);
    }
}

/// Run one poll cycle for an entity. Returns the notifications it produced.
pub fn poll_entity(ctx: &mut PollContext<'_>, entity: &mut Entity) -> Vec<Notification> {
    let mut out = Vec::new();
    let addr = entity.addr;

    let prior = entity.fault;
    entity.fault.reset();

    let present = match ctx.hal.entity_present(addr) {
        Ok(present) => present,
        Err(e) => {
            debug!(entity = %addr, error = %e, "Presence read failed");
            entity.fault = prior;
            return out;
        }
    };

    let mut notify = !entity.valid || present != entity.present;
    entity.valid = true;
    let mut full_refresh = false;

    if present && !entity.present {
        entity.insertion_count += 1;
        entity.insertion_ts_ms = now_millis();
        entity.power_on = true;
        entity.init_ok = false;
        entity.init_fail_count = 0;
        entity.fault_count = 0;
        full_refresh = true;
        info!(entity = %addr, insertions = entity.insertion_count, "Entity inserted");
    } else if !present && entity.present {
        entity.eeprom_valid = false;
        entity.init_ok = false;
        entity.power_on = false;
        entity.power_status = false;
        entity.handle = None;
        entity.airflow = None;
        destroy_children(ctx.store, entity);
        info!(entity = %addr, "Entity removed");
    }
    entity.present = present;

    if present {
        let powered = poll_power(ctx.hal, entity, &mut full_refresh);

        if powered && !entity.init_ok {
            if entity.init_fail_count < entity_const::MAX_INIT_ATTEMPTS {
                try_init(ctx, entity, &mut full_refresh);
            }
            if !entity.init_ok && entity.init_fail_count >= entity_const::MAX_INIT_ATTEMPTS {
                entity.fault.update(FaultType::CommError);
            }
        }

        if entity.init_ok && full_refresh {
            notify |= refresh_identity(ctx.hal, entity);
        }

        let typed = match addr.entity_type {
            EntityType::Psu => engine::poll_psu(ctx.hal, entity, full_refresh),
            EntityType::FanTray => engine::poll_fan_tray(ctx.hal, entity, full_refresh),
            EntityType::Card => TypePoll::default(),
        };
        notify |= typed.notify;

        if let Some(parent) = typed.parent {
            debounce_parent_fault(ctx.hal, entity, parent, prior);
        }

        poll_children(ctx.hal, entity, full_refresh, &mut out);
    }

    if notify || entity.fault != prior {
        out.insert(0, views::entity_notification(entity));
    }
    out
}

/// Read PSU output power. Returns whether the entity counts as powered.
fn poll_power(hal: &mut dyn Hal, entity: &mut Entity, full_refresh: &mut bool) -> bool {
    if entity.addr.entity_type != EntityType::Psu {
        entity.power_status = true;
        return true;
    }

    let powered = match hal.psu_output_power(entity.addr) {
        Ok(powered) => {
            entity.power_read_ok = true;
            powered
        }
        Err(e) => {
            debug!(entity = %entity.addr, error = %e, "Output power read failed");
            entity.power_read_ok = false;
            entity.fault.update(FaultType::CommError);
            false
        }
    };
    entity.power_status = powered;

    if !powered {
        entity.fault.update(FaultType::PowerError);
        entity.init_ok = false;
        entity.eeprom_valid = false;
        for fan in &mut entity.fans {
            fan.target_speed = None;
        }
    } else if !entity.power_on {
        info!(entity = %entity.addr, "PSU output restored");
        *full_refresh = true;
    }
    entity.power_on = powered;
    powered
}

fn try_init(ctx: &mut PollContext<'_>, entity: &mut Entity, full_refresh: &mut bool) {
    let addr = entity.addr;
    let handle = ctx.hal.entity_init(addr).and_then(|()| ctx.hal.entity_handle(addr));
    match handle {
        Ok(handle) => {
            entity.init_ok = true;
            entity.handle = Some(handle);
            *full_refresh = true;
            destroy_children(ctx.store, entity);
            create_children(ctx, entity);
            info!(entity = %addr, "Entity initialized");
        }
        Err(e) => {
            entity.init_fail_count += 1;
            warn!(
                entity = %addr,
                attempt = entity.init_fail_count,
                error = %e,
                "Entity init failed"
            );
        }
    }
}

/// Reread identity and EEPROM. Returns true when the EEPROM became valid.
fn refresh_identity(hal: &mut dyn Hal, entity: &mut Entity) -> bool {
    let Some(handle) = entity.handle else {
        return false;
    };
    match hal.entity_info(handle) {
        Ok(info) => {
            let first_valid = !entity.eeprom_valid;
            entity.eeprom = info.eeprom;
            entity.eeprom_valid = true;
            first_valid
        }
        Err(e) => {
            debug!(entity = %entity.addr, error = %e, "EEPROM read failed");
            entity.fault.update(FaultType::CommError);
            entity.eeprom_valid = false;
            false
        }
    }
}

/// Count parent fault signals up to the cap.
///
/// At the cap a fan tray escalates HARDWARE-ERROR; any other entity type gets
/// its fault-state from the start of the cycle back instead.
fn debounce_parent_fault(
    hal: &mut dyn Hal,
    entity: &mut Entity,
    parent: HwHandle,
    prior: FaultState,
) {
    match hal.fault_status(parent) {
        Err(e) => {
            debug!(entity = %entity.addr, error = %e, "Fault status read failed");
            entity.fault.update(FaultType::CommError);
        }
        Ok(true) => {
            entity.fault_count = (entity.fault_count + 1).min(entity_const::FAULT_COUNT_CAP);
            if entity.fault_count >= entity_const::FAULT_COUNT_CAP {
                if entity.addr.entity_type == EntityType::FanTray {
                    entity.fault.update(FaultType::HardwareError);
                } else {
                    entity.fault = prior;
                }
            }
        }
        Ok(false) => entity.fault_count = 0,
    }
}

fn poll_children(
    hal: &mut dyn Hal,
    entity: &mut Entity,
    full_refresh: bool,
    out: &mut Vec<Notification>,
) {
    let parent = ParentState::of(entity, full_refresh);

    let mut changed = Vec::new();
    {
        let Entity { fans, fault, .. } = entity;
        for fan in fans.iter_mut() {
            if engine::poll_fan(hal, fan, &parent, fault) {
                changed.push(fan.ordinal);
            }
        }
    }
    child_notifications(entity, ChildKind::Fan, &changed, out);

    changed.clear();
    for sensor in entity.temp_sensors.iter_mut() {
        if engine::poll_temp_sensor(hal, sensor, &parent) {
            changed.push(sensor.ordinal);
        }
    }
    child_notifications(entity, ChildKind::TemperatureSensor, &changed, out);

    changed.clear();
    for monitor in entity.power_monitors.iter_mut() {
        if engine::poll_power_monitor(hal, monitor, &parent) {
            changed.push(monitor.ordinal);
        }
    }
    child_notifications(entity, ChildKind::PowerMonitor, &changed, out);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::EntityAddr;
    use crate::hw::{EntityInfo, SimHal};
    use cm_protocol::OperStatus;

    struct Fixture {
        sim: SimHal,
        hal: SimHal,
        store: ResourceStore<ResourceRef>,
        config: PlatformConfig,
        entity: Entity,
    }

    impl Fixture {
        fn new(addr: EntityAddr, fans: usize) -> Self {
            let sim = SimHal::new();
            sim.add_entity(addr, EntityInfo { fan_max_speed: 100, ..Default::default() });
            for i in 0..fans {
                sim.add_child(addr, ChildKind::Fan, &format!("Fan {}", i + 1));
            }
            let mut store = ResourceStore::new();
            store
                .insert(ResourceKey::entity(addr.entity_type, addr.slot), ResourceRef::Entity(0))
                .unwrap();
            Self {
                hal: sim.clone(),
                sim,
                store,
                config: PlatformConfig::default(),
                entity: Entity::new(0, addr),
            }
        }

        fn poll(&mut self) -> Vec<Notification> {
            let mut ctx =
                PollContext { hal: &mut self.hal, store: &mut self.store, config: &self.config };
            poll_entity(&mut ctx, &mut self.entity)
        }

        fn entity_notifications(&mut self) -> usize {
            self.poll().iter().filter(|n| n.class == ResourceClass::Entity).count()
        }
    }

    #[test]
    fn test_first_poll_initializes_and_notifies() {
        let addr = EntityAddr::new(EntityType::FanTray, 1);
        let mut fx = Fixture::new(addr, 3);
        assert_eq!(fx.entity_notifications(), 1);
        assert!(fx.entity.present);
        assert!(fx.entity.init_ok);
        assert!(fx.entity.eeprom_valid);
        assert_eq!(fx.entity.insertion_count, 1);
        assert_eq!(fx.entity.fans.len(), 3);
        assert_eq!(fx.entity.fans[2].ordinal, 3);
        // Entity key + two keys per fan
        assert_eq!(fx.store.len(), 7);
        // Steady state is quiet
        assert_eq!(fx.entity_notifications(), 0);
    }

    #[test]
    fn test_removal_drops_children_and_reinsertion_starts_fresh() {
        let addr = EntityAddr::new(EntityType::FanTray, 1);
        let mut fx = Fixture::new(addr, 3);
        fx.poll();

        fx.sim.set_present(addr, false);
        assert_eq!(fx.entity_notifications(), 1);
        assert_eq!(fx.entity.child_counts().total(), 0);
        assert!(!fx.entity.eeprom_valid);
        assert_eq!(fx.store.len(), 1);
        for ordinal in 1..=3 {
            let key =
                ResourceKey::child_by_ordinal(ChildKind::Fan, EntityType::FanTray, 1, ordinal);
            assert!(!fx.store.contains(&key));
        }

        fx.sim.set_present(addr, true);
        fx.poll();
        assert_eq!(fx.entity.insertion_count, 2);
        assert_eq!(fx.entity.fans[0].ordinal, 1);
        assert_eq!(fx.entity.fans[0].name, "Fan 1");
        let key = ResourceKey::child_by_name(ChildKind::Fan, EntityType::FanTray, 1, "Fan 3");
        assert!(fx.store.contains(&key));
    }

    #[test]
    fn test_presence_read_failure_changes_nothing() {
        let addr = EntityAddr::new(EntityType::Card, 1);
        let mut fx = Fixture::new(addr, 0);
        fx.sim.fail_presence_reads(addr, true);
        assert!(fx.poll().is_empty());
        assert!(!fx.entity.valid);
        assert!(!fx.entity.present);
    }

    #[test]
    fn test_init_retries_capped() {
        let addr = EntityAddr::new(EntityType::Card, 1);
        let mut fx = Fixture::new(addr, 0);
        fx.sim.fail_inits(addr, 10);
        fx.poll();
        fx.poll();
        assert_eq!(fx.entity.init_fail_count, 2);
        assert!(fx.entity.fault.is_ok());
        fx.poll();
        assert_eq!(fx.entity.init_fail_count, 3);
        assert_eq!(fx.entity.fault.fault_type, FaultType::CommError);
        fx.poll();
        assert_eq!(fx.entity.init_fail_count, 3, "no attempts past the cap");
        assert_eq!(fx.entity.fault.fault_type, FaultType::CommError);
    }

    #[test]
    fn test_unpowered_psu() {
        let addr = EntityAddr::new(EntityType::Psu, 1);
        let mut fx = Fixture::new(addr, 1);
        fx.poll();
        fx.entity.fans[0].target_speed = Some(50);

        fx.sim.set_powered(addr, false);
        assert_eq!(fx.entity_notifications(), 1);
        assert_eq!(fx.entity.fault.fault_type, FaultType::PowerError);
        assert_eq!(fx.entity.fault.oper_status, OperStatus::Fail);
        assert!(!fx.entity.init_ok);
        assert!(!fx.entity.eeprom_valid);
        assert_eq!(fx.entity.fans[0].target_speed, None);
        assert_eq!(fx.entity.fans[0].fault.fault_type, FaultType::PowerError);

        fx.sim.set_powered(addr, true);
        fx.poll();
        assert!(fx.entity.fault.is_ok());
        assert!(fx.entity.init_ok);
        assert!(fx.entity.eeprom_valid);
    }

    #[test]
    fn test_power_read_failure_is_comm_then_power() {
        let addr = EntityAddr::new(EntityType::Psu, 1);
        let mut fx = Fixture::new(addr, 0);
        fx.sim.fail_power_reads(addr, true);
        fx.poll();
        // Power error outranks the comm error of the failed read
        assert_eq!(fx.entity.fault.fault_type, FaultType::PowerError);
        assert!(!fx.entity.power_read_ok);
    }

    #[test]
    fn test_fan_tray_parent_fault_escalates_at_cap() {
        let addr = EntityAddr::new(EntityType::FanTray, 1);
        let mut fx = Fixture::new(addr, 0);
        fx.poll();
        fx.sim.set_entity_fault(addr, true);
        fx.poll();
        fx.poll();
        assert!(fx.entity.fault.is_ok());
        assert_eq!(fx.entity_notifications(), 1);
        assert_eq!(fx.entity.fault_count, entity_const::FAULT_COUNT_CAP);
        assert_eq!(fx.entity.fault.fault_type, FaultType::HardwareError);
    }

    #[test]
    fn test_psu_parent_fault_at_cap_restores_prior_state() {
        let addr = EntityAddr::new(EntityType::Psu, 1);
        let mut fx = Fixture::new(addr, 0);
        fx.poll();
        fx.sim.set_entity_fault(addr, true);
        for _ in 0..5 {
            fx.poll();
        }
        assert_eq!(fx.entity.fault_count, entity_const::FAULT_COUNT_CAP);
        assert!(fx.entity.fault.is_ok(), "non fan-tray parents never escalate");

        fx.sim.set_entity_fault(addr, false);
        fx.poll();
        assert_eq!(fx.entity.fault_count, 0);
    }

    #[test]
    fn test_stalled_fan_notifies_through_entity_poll() {
        let addr = EntityAddr::new(EntityType::FanTray, 2);
        let mut fx = Fixture::new(addr, 1);
        fx.poll();
        let handle = fx.entity.fans[0].handle;
        fx.sim.stall_fan(handle, 50);

        let mut fan_notifications = 0;
        for _ in 0..10 {
            fan_notifications += fx.poll().iter().filter(|n| n.class == ResourceClass::Fan).count();
        }
        assert_eq!(fan_notifications, 1);
        assert_eq!(fx.entity.fans[0].fault.fault_type, FaultType::HardwareError);
        // The entity itself stays healthy
        assert!(fx.entity.fault.is_ok());
    }

    #[test]
    fn test_led_defaults_applied_on_creation() {
        let addr = EntityAddr::new(EntityType::Card, 1);
        let mut fx = Fixture::new(addr, 0);
        let led = fx.sim.add_child(addr, ChildKind::Led, "Power");
        fx.config.led_defaults.push(crate::data::LedDefault {
            entity_type: EntityType::Card,
            led: "Power".into(),
            on: true,
        });
        fx.poll();
        assert_eq!(fx.sim.led_state(led), Some(true));
        assert_eq!(fx.entity.leds[0].applied, Some(true));
    }
}
