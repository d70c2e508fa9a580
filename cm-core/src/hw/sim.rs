//! In-memory chassis model
//!
//! Implements [`Hal`] over shared state so the daemon can run without a hardware
//! driver and tests can flip presence, cut PSU power, raise faults, fail reads,
//! stall fans and count LED pushes while the cache owns its own clone.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use cm_error::{ChassisError, Result};
use cm_protocol::{Airflow, EepromInfo, EntityType, PowerReading};
use parking_lot::Mutex;

use super::{EntityInfo, Hal};
use crate::data::{ChildKind, EntityAddr, HwHandle, HwResource, PlatformConfig};

const PSU_FAN_MAX_RPM: u32 = 18_000;
const TRAY_FAN_MAX_RPM: u32 = 21_000;
const AMBIENT_CELSIUS: i32 = 30;

#[derive(Debug)]
struct SimEntity {
    handle: HwHandle,
    present: bool,
    powered: bool,
    fault: bool,
    airflow: Airflow,
    info: EntityInfo,
    init_failures: u32,
    fail_presence: bool,
    fail_power: bool,
    fail_info: bool,
    children: Vec<HwHandle>,
}

#[derive(Debug)]
struct SimResource {
    kind: ChildKind,
    name: String,
    fault: bool,
    fail_reads: bool,
    observed: u32,
    follow_command: bool,
    commanded: Option<u32>,
    temperature: i32,
    power: PowerReading,
    led: Option<bool>,
    led_pushes: u32,
    display: String,
}

/// Complete simulated hardware state
#[derive(Debug, Default)]
pub struct SimChassis {
    entities: BTreeMap<EntityAddr, SimEntity>,
    entity_handles: HashMap<HwHandle, EntityAddr>,
    resources: HashMap<HwHandle, SimResource>,
    next_handle: u64,
}

impl SimChassis {
    fn alloc_handle(&mut self) -> HwHandle {
        self.next_handle += 1;
        HwHandle(self.next_handle)
    }

    fn entity(&self, addr: EntityAddr) -> Result<&SimEntity> {
        self.entities
            .get(&addr)
            .ok_or_else(|| ChassisError::HardwareNotFound(addr.to_string()))
    }

    fn entity_mut(&mut self, addr: EntityAddr) -> Result<&mut SimEntity> {
        self.entities
            .get_mut(&addr)
            .ok_or_else(|| ChassisError::HardwareNotFound(addr.to_string()))
    }

    fn resource_mut(&mut self, handle: HwHandle, op: &'static str) -> Result<&mut SimResource> {
        let res = self
            .resources
            .get_mut(&handle)
            .ok_or_else(|| ChassisError::HardwareNotFound(format!("handle {}", handle.0)))?;
        if res.fail_reads {
            return Err(ChassisError::hardware(op, format!("{} not responding", res.name)));
        }
        Ok(res)
    }

    /// Presence and power gate every child access
    fn check_owner_powered(&self, handle: HwHandle, op: &'static str) -> Result<()> {
        let owner = self
            .entities
            .values()
            .find(|e| e.children.contains(&handle))
            .ok_or_else(|| ChassisError::HardwareNotFound(format!("handle {}", handle.0)))?;
        if !owner.present {
            return Err(ChassisError::hardware(op, "entity not present"));
        }
        Ok(())
    }
}

/// Cloneable handle to a shared [`SimChassis`]
#[derive(Debug, Clone, Default)]
pub struct SimHal {
    inner: Arc<Mutex<SimChassis>>,
}

impl SimHal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fully populated chassis with every configured slot occupied
    pub fn populated(config: &PlatformConfig) -> Self {
        let sim = Self::new();
        for slot in 1..=config.slots.psu {
            let addr = EntityAddr::new(EntityType::Psu, slot);
            sim.add_entity(addr, sim_info(addr, PSU_FAN_MAX_RPM));
            sim.add_child(addr, ChildKind::Fan, "Fan 1");
            sim.add_child(addr, ChildKind::TemperatureSensor, "Temp 1");
            sim.add_child(addr, ChildKind::PowerMonitor, "Output");
            sim.add_child(addr, ChildKind::Led, "Fault");
            sim.add_child(addr, ChildKind::Led, "Good");
        }
        for slot in 1..=config.slots.fan_tray {
            let addr = EntityAddr::new(EntityType::FanTray, slot);
            sim.add_entity(addr, sim_info(addr, TRAY_FAN_MAX_RPM));
            sim.add_child(addr, ChildKind::Fan, "Fan 1");
            sim.add_child(addr, ChildKind::Fan, "Fan 2");
            sim.add_child(addr, ChildKind::Led, "Fault");
            sim.add_child(addr, ChildKind::Led, "Good");
        }
        for slot in 1..=config.slots.card {
            let addr = EntityAddr::new(EntityType::Card, slot);
            sim.add_entity(addr, sim_info(addr, 0));
            sim.add_child(addr, ChildKind::TemperatureSensor, "Inlet");
            sim.add_child(addr, ChildKind::TemperatureSensor, "Outlet");
            sim.add_child(addr, ChildKind::TemperatureSensor, "CPU");
            sim.add_child(addr, ChildKind::Led, "Alarm");
            sim.add_child(addr, ChildKind::Led, "Status");
            sim.add_child(addr, ChildKind::Led, "Locator");
            sim.add_child(addr, ChildKind::Display, "Front Panel");
        }
        sim
    }

    /// Add a present, powered entity; returns its entity handle
    pub fn add_entity(&self, addr: EntityAddr, info: EntityInfo) -> HwHandle {
        let mut chassis = self.inner.lock();
        let handle = chassis.alloc_handle();
        chassis.entity_handles.insert(handle, addr);
        chassis.entities.insert(
            addr,
            SimEntity {
                handle,
                present: true,
                powered: true,
                fault: false,
                airflow: Airflow::Normal,
                info,
                init_failures: 0,
                fail_presence: false,
                fail_power: false,
                fail_info: false,
                children: Vec::new(),
            },
        );
        handle
    }

    /// Add a child resource to an existing entity
    pub fn add_child(&self, addr: EntityAddr, kind: ChildKind, name: &str) -> HwHandle {
        let mut chassis = self.inner.lock();
        let handle = chassis.alloc_handle();
        let max_rpm = chassis.entities.get(&addr).map(|e| e.info.fan_max_speed).unwrap_or(0);
        chassis.resources.insert(
            handle,
            SimResource {
                kind,
                name: name.to_string(),
                fault: false,
                fail_reads: false,
                observed: max_rpm,
                follow_command: true,
                commanded: None,
                temperature: AMBIENT_CELSIUS,
                power: PowerReading::default(),
                led: None,
                led_pushes: 0,
                display: String::new(),
            },
        );
        if let Some(entity) = chassis.entities.get_mut(&addr) {
            entity.children.push(handle);
        }
        handle
    }

    /// Look up a child handle by entity, kind and name
    pub fn handle_of(&self, addr: EntityAddr, kind: ChildKind, name: &str) -> Option<HwHandle> {
        let chassis = self.inner.lock();
        let entity = chassis.entities.get(&addr)?;
        entity.children.iter().copied().find(|h| {
            chassis
                .resources
                .get(h)
                .map(|r| r.kind == kind && r.name == name)
                .unwrap_or(false)
        })
    }

    pub fn set_present(&self, addr: EntityAddr, present: bool) {
        if let Some(e) = self.inner.lock().entities.get_mut(&addr) {
            e.present = present;
        }
    }

    pub fn set_powered(&self, addr: EntityAddr, powered: bool) {
        if let Some(e) = self.inner.lock().entities.get_mut(&addr) {
            e.powered = powered;
        }
    }

    pub fn set_entity_fault(&self, addr: EntityAddr, fault: bool) {
        if let Some(e) = self.inner.lock().entities.get_mut(&addr) {
            e.fault = fault;
        }
    }

    pub fn set_airflow(&self, addr: EntityAddr, airflow: Airflow) {
        if let Some(e) = self.inner.lock().entities.get_mut(&addr) {
            e.airflow = airflow;
        }
    }

    /// Make the next `count` init attempts fail
    pub fn fail_inits(&self, addr: EntityAddr, count: u32) {
        if let Some(e) = self.inner.lock().entities.get_mut(&addr) {
            e.init_failures = count;
        }
    }

    pub fn fail_presence_reads(&self, addr: EntityAddr, fail: bool) {
        if let Some(e) = self.inner.lock().entities.get_mut(&addr) {
            e.fail_presence = fail;
        }
    }

    pub fn fail_power_reads(&self, addr: EntityAddr, fail: bool) {
        if let Some(e) = self.inner.lock().entities.get_mut(&addr) {
            e.fail_power = fail;
        }
    }

    pub fn fail_info_reads(&self, addr: EntityAddr, fail: bool) {
        if let Some(e) = self.inner.lock().entities.get_mut(&addr) {
            e.fail_info = fail;
        }
    }

    pub fn set_fault(&self, handle: HwHandle, fault: bool) {
        if let Some(r) = self.inner.lock().resources.get_mut(&handle) {
            r.fault = fault;
        }
    }

    pub fn fail_reads(&self, handle: HwHandle, fail: bool) {
        if let Some(r) = self.inner.lock().resources.get_mut(&handle) {
            r.fail_reads = fail;
        }
    }

    pub fn set_temperature(&self, handle: HwHandle, celsius: i32) {
        if let Some(r) = self.inner.lock().resources.get_mut(&handle) {
            r.temperature = celsius;
        }
    }

    /// Pin the observed fan speed regardless of commands
    pub fn stall_fan(&self, handle: HwHandle, observed_rpm: u32) {
        if let Some(r) = self.inner.lock().resources.get_mut(&handle) {
            r.observed = observed_rpm;
            r.follow_command = false;
        }
    }

    pub fn set_power_reading(&self, handle: HwHandle, reading: PowerReading) {
        if let Some(r) = self.inner.lock().resources.get_mut(&handle) {
            r.power = reading;
        }
    }

    pub fn commanded_speed(&self, handle: HwHandle) -> Option<u32> {
        self.inner.lock().resources.get(&handle).and_then(|r| r.commanded)
    }

    pub fn led_state(&self, handle: HwHandle) -> Option<bool> {
        self.inner.lock().resources.get(&handle).and_then(|r| r.led)
    }

    pub fn led_pushes(&self, handle: HwHandle) -> u32 {
        self.inner.lock().resources.get(&handle).map(|r| r.led_pushes).unwrap_or(0)
    }

    pub fn display_message(&self, handle: HwHandle) -> String {
        self.inner
            .lock()
            .resources
            .get(&handle)
            .map(|r| r.display.clone())
            .unwrap_or_default()
    }
}

fn sim_info(addr: EntityAddr, fan_max_speed: u32) -> EntityInfo {
    EntityInfo {
        eeprom: EepromInfo {
            name: format!("{}{}", addr.entity_type.as_str().to_uppercase(), addr.slot),
            vendor: "Simulated".into(),
            product: format!("SIM-{}", addr.entity_type.as_str().to_uppercase()),
            part_number: format!("SIM-{:04}", addr.slot),
            hw_version: "A00".into(),
            platform_name: "sim-chassis".into(),
            ppid: format!("SIMPPID{:08}", addr.slot),
            service_tag: format!("SVC{:04}", addr.slot),
        },
        fan_max_speed,
    }
}

impl Hal for SimHal {
    fn entity_present(&mut self, entity: EntityAddr) -> Result<bool> {
        let chassis = self.inner.lock();
        let e = chassis.entity(entity)?;
        if e.fail_presence {
            return Err(ChassisError::hardware(
                "presence read",
                format!("{} not responding", entity),
            ));
        }
        Ok(e.present)
    }

    fn entity_init(&mut self, entity: EntityAddr) -> Result<()> {
        let mut chassis = self.inner.lock();
        let e = chassis.entity_mut(entity)?;
        if !e.present {
            return Err(ChassisError::hardware("entity init", "entity not present"));
        }
        if e.init_failures > 0 {
            e.init_failures -= 1;
            return Err(ChassisError::hardware("entity init", format!("{} init failed", entity)));
        }
        Ok(())
    }

    fn entity_handle(&mut self, entity: EntityAddr) -> Result<HwHandle> {
        Ok(self.inner.lock().entity(entity)?.handle)
    }

    fn entity_info(&mut self, handle: HwHandle) -> Result<EntityInfo> {
        let chassis = self.inner.lock();
        let addr = chassis
            .entity_handles
            .get(&handle)
            .copied()
            .ok_or_else(|| ChassisError::HardwareNotFound(format!("handle {}", handle.0)))?;
        let e = chassis.entity(addr)?;
        if e.fail_info || !e.present {
            return Err(ChassisError::hardware(
                "eeprom read",
                format!("{} eeprom unreadable", addr),
            ));
        }
        Ok(e.info.clone())
    }

    fn psu_output_power(&mut self, entity: EntityAddr) -> Result<bool> {
        let chassis = self.inner.lock();
        let e = chassis.entity(entity)?;
        if e.fail_power {
            return Err(ChassisError::hardware(
                "power status read",
                format!("{} not responding", entity),
            ));
        }
        Ok(e.present && e.powered)
    }

    fn airflow(&mut self, handle: HwHandle) -> Result<Airflow> {
        let chassis = self.inner.lock();
        let addr = chassis
            .entity_handles
            .get(&handle)
            .copied()
            .ok_or_else(|| ChassisError::HardwareNotFound(format!("handle {}", handle.0)))?;
        Ok(chassis.entity(addr)?.airflow)
    }

    fn enumerate(&mut self, entity: EntityAddr, kind: ChildKind) -> Result<Vec<HwResource>> {
        let chassis = self.inner.lock();
        let e = chassis.entity(entity)?;
        if !e.present {
            return Err(ChassisError::hardware("enumerate", "entity not present"));
        }
        Ok(e.children
            .iter()
            .filter_map(|h| {
                chassis.resources.get(h).and_then(|r| {
                    (r.kind == kind).then(|| HwResource { handle: *h, name: r.name.clone() })
                })
            })
            .collect())
    }

    fn fault_status(&mut self, handle: HwHandle) -> Result<bool> {
        let mut chassis = self.inner.lock();
        if let Some(addr) = chassis.entity_handles.get(&handle).copied() {
            return Ok(chassis.entity(addr)?.fault);
        }
        chassis.check_owner_powered(handle, "fault read")?;
        Ok(chassis.resource_mut(handle, "fault read")?.fault)
    }

    fn fan_speed(&mut self, fan: HwHandle) -> Result<u32> {
        let mut chassis = self.inner.lock();
        chassis.check_owner_powered(fan, "fan speed read")?;
        let r = chassis.resource_mut(fan, "fan speed read")?;
        if r.follow_command {
            if let Some(commanded) = r.commanded {
                r.observed = commanded;
            }
        }
        Ok(r.observed)
    }

    fn set_fan_speed(&mut self, fan: HwHandle, rpm: u32) -> Result<()> {
        let mut chassis = self.inner.lock();
        chassis.check_owner_powered(fan, "fan speed write")?;
        chassis.resource_mut(fan, "fan speed write")?.commanded = Some(rpm);
        Ok(())
    }

    fn temperature(&mut self, sensor: HwHandle) -> Result<i32> {
        let mut chassis = self.inner.lock();
        chassis.check_owner_powered(sensor, "temperature read")?;
        Ok(chassis.resource_mut(sensor, "temperature read")?.temperature)
    }

    fn power_reading(&mut self, monitor: HwHandle) -> Result<PowerReading> {
        let mut chassis = self.inner.lock();
        chassis.check_owner_powered(monitor, "power read")?;
        Ok(chassis.resource_mut(monitor, "power read")?.power)
    }

    fn set_led(&mut self, led: HwHandle, on: bool) -> Result<()> {
        let mut chassis = self.inner.lock();
        let r = chassis.resource_mut(led, "led write")?;
        r.led = Some(on);
        r.led_pushes += 1;
        Ok(())
    }

    fn display_write(&mut self, display: HwHandle, message: &str) -> Result<()> {
        let mut chassis = self.inner.lock();
        chassis.resource_mut(display, "display write")?.display = message.to_string();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_populated_layout() {
        let config = PlatformConfig::default();
        let mut sim = SimHal::populated(&config);
        let tray = EntityAddr::new(EntityType::FanTray, 1);
        let fans = sim.enumerate(tray, ChildKind::Fan).unwrap();
        assert_eq!(fans.len(), 2);
        assert_eq!(fans[0].name, "Fan 1");
        let card = EntityAddr::new(EntityType::Card, 1);
        assert_eq!(sim.enumerate(card, ChildKind::TemperatureSensor).unwrap().len(), 3);
    }

    #[test]
    fn test_fan_follows_command_until_stalled() {
        let mut sim = SimHal::new();
        let tray = EntityAddr::new(EntityType::FanTray, 1);
        sim.add_entity(tray, EntityInfo { fan_max_speed: 100, ..Default::default() });
        let fan = sim.add_child(tray, ChildKind::Fan, "Fan 1");
        sim.set_fan_speed(fan, 60).unwrap();
        assert_eq!(sim.fan_speed(fan).unwrap(), 60);
        sim.stall_fan(fan, 40);
        sim.set_fan_speed(fan, 90).unwrap();
        assert_eq!(sim.fan_speed(fan).unwrap(), 40);
        assert_eq!(sim.commanded_speed(fan), Some(90));
    }

    #[test]
    fn test_init_failures_count_down() {
        let mut sim = SimHal::new();
        let psu = EntityAddr::new(EntityType::Psu, 1);
        sim.add_entity(psu, EntityInfo::default());
        sim.fail_inits(psu, 2);
        assert!(sim.entity_init(psu).is_err());
        assert!(sim.entity_init(psu).is_err());
        assert!(sim.entity_init(psu).is_ok());
    }

    #[test]
    fn test_absent_entity_children_unreadable() {
        let mut sim = SimHal::new();
        let psu = EntityAddr::new(EntityType::Psu, 1);
        sim.add_entity(psu, EntityInfo::default());
        let temp = sim.add_child(psu, ChildKind::TemperatureSensor, "Temp 1");
        assert!(sim.temperature(temp).is_ok());
        sim.set_present(psu, false);
        assert!(sim.temperature(temp).is_err());
        assert!(!sim.entity_present(psu).unwrap());
    }
}
