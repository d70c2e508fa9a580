//! Cached record types
//!
//! Entities live in an arena owned by the cache; their sub-resources live in per-kind
//! vectors inside the entity. A child's `parent` is the arena index of its entity and
//! is fixed at construction.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use cm_protocol::{Airflow, ChildCounts, EepromInfo, EntityType, PowerReading, ResourceClass};

use crate::engine::{Integrator, ThresholdTracker};
use crate::fault::FaultState;

/// Arena index of an entity
pub type EntityId = usize;

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Physical slot address of an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityAddr {
    pub entity_type: EntityType,
    pub slot: u32,
}

impl EntityAddr {
    pub fn new(entity_type: EntityType, slot: u32) -> Self {
        Self { entity_type, slot }
    }
}

impl fmt::Display for EntityAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.slot)
    }
}

/// Opaque hardware handle issued by the hardware layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HwHandle(pub u64);

/// A resource reported by hardware enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HwResource {
    pub handle: HwHandle,
    pub name: String,
}

/// Sub-resource kinds an entity can own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChildKind {
    Fan,
    TemperatureSensor,
    Led,
    Display,
    PowerMonitor,
}

impl ChildKind {
    pub const ALL: [ChildKind; 5] = [
        ChildKind::Fan,
        ChildKind::TemperatureSensor,
        ChildKind::Led,
        ChildKind::Display,
        ChildKind::PowerMonitor,
    ];

    pub fn class(&self) -> ResourceClass {
        match self {
            ChildKind::Fan => ResourceClass::Fan,
            ChildKind::TemperatureSensor => ResourceClass::TemperatureSensor,
            ChildKind::Led => ResourceClass::Led,
            ChildKind::Display => ResourceClass::Display,
            ChildKind::PowerMonitor => ResourceClass::PowerMonitor,
        }
    }
}

impl fmt::Display for ChildKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.class().as_str())
    }
}

/// One field-replaceable unit slot
#[derive(Debug, Clone)]
pub struct Entity {
    pub id: EntityId,
    pub addr: EntityAddr,
    pub present: bool,
    /// Set once the first poll has completed
    pub valid: bool,
    pub insertion_count: u32,
    pub insertion_ts_ms: u64,
    pub init_fail_count: u32,
    pub init_ok: bool,
    pub power_on: bool,
    pub power_status: bool,
    /// Outcome of the last output-power read (PSUs only)
    pub power_read_ok: bool,
    pub fault_count: u32,
    pub admin_up: bool,
    pub fault: FaultState,
    pub handle: Option<HwHandle>,
    pub eeprom: EepromInfo,
    pub eeprom_valid: bool,
    pub airflow: Option<Airflow>,
    pub fans: Vec<Fan>,
    pub temp_sensors: Vec<TempSensor>,
    pub leds: Vec<Led>,
    pub displays: Vec<Display>,
    pub power_monitors: Vec<PowerMonitor>,
}

impl Entity {
    pub fn new(id: EntityId, addr: EntityAddr) -> Self {
        Self {
            id,
            addr,
            present: false,
            valid: false,
            insertion_count: 0,
            insertion_ts_ms: 0,
            init_fail_count: 0,
            init_ok: false,
            power_on: false,
            power_status: false,
            power_read_ok: true,
            fault_count: 0,
            admin_up: true,
            fault: FaultState::new(),
            handle: None,
            eeprom: EepromInfo::default(),
            eeprom_valid: false,
            airflow: None,
            fans: Vec::new(),
            temp_sensors: Vec::new(),
            leds: Vec::new(),
            displays: Vec::new(),
            power_monitors: Vec::new(),
        }
    }

    pub fn child_counts(&self) -> ChildCounts {
        ChildCounts {
            fans: self.fans.len(),
            temperature_sensors: self.temp_sensors.len(),
            leds: self.leds.len(),
            displays: self.displays.len(),
            power_monitors: self.power_monitors.len(),
        }
    }

    pub fn child_count(&self, kind: ChildKind) -> usize {
        match kind {
            ChildKind::Fan => self.fans.len(),
            ChildKind::TemperatureSensor => self.temp_sensors.len(),
            ChildKind::Led => self.leds.len(),
            ChildKind::Display => self.displays.len(),
            ChildKind::PowerMonitor => self.power_monitors.len(),
        }
    }

    /// Ordinal and name of every child of a kind, in ordinal order
    pub fn child_names(&self, kind: ChildKind) -> Vec<(u32, String)> {
        fn collect<'a>(it: impl Iterator<Item = (u32, &'a String)>) -> Vec<(u32, String)> {
            it.map(|(o, n)| (o, n.clone())).collect()
        }
        match kind {
            ChildKind::Fan => collect(self.fans.iter().map(|c| (c.ordinal, &c.name))),
            ChildKind::TemperatureSensor => {
                collect(self.temp_sensors.iter().map(|c| (c.ordinal, &c.name)))
            }
            ChildKind::Led => collect(self.leds.iter().map(|c| (c.ordinal, &c.name))),
            ChildKind::Display => collect(self.displays.iter().map(|c| (c.ordinal, &c.name))),
            ChildKind::PowerMonitor => {
                collect(self.power_monitors.iter().map(|c| (c.ordinal, &c.name)))
            }
        }
    }

    /// Whether this is a PSU whose output is currently off
    pub fn is_unpowered_psu(&self) -> bool {
        self.addr.entity_type == EntityType::Psu && !self.power_status
    }
}

/// Fan sub-resource
#[derive(Debug, Clone)]
pub struct Fan {
    pub parent: EntityId,
    pub ordinal: u32,
    pub name: String,
    pub handle: HwHandle,
    /// Max speed has been read since creation
    pub valid: bool,
    /// Operator-configured target; `None` means run at max speed
    pub target_speed: Option<u32>,
    pub commanded_speed: u32,
    pub observed_speed: u32,
    pub max_speed: u32,
    pub fault_count: u32,
    pub fault: FaultState,
    pub speed_control: bool,
    pub margin_pct: u32,
    pub integrator: Integrator,
}

impl Fan {
    /// Speed the control loop drives toward
    pub fn effective_target(&self) -> u32 {
        self.target_speed.unwrap_or(self.max_speed)
    }
}

/// Temperature sensor sub-resource
#[derive(Debug, Clone)]
pub struct TempSensor {
    pub parent: EntityId,
    pub ordinal: u32,
    pub name: String,
    pub handle: HwHandle,
    pub fault: FaultState,
    pub shutdown_threshold: Option<i32>,
    pub over_shutdown: bool,
    pub tracker: ThresholdTracker,
    pub last_poll_ms: u64,
}

/// LED sub-resource
#[derive(Debug, Clone)]
pub struct Led {
    pub parent: EntityId,
    pub ordinal: u32,
    pub name: String,
    pub handle: HwHandle,
    /// Logical request
    pub requested: bool,
    /// Last state pushed to hardware; `None` until the first push
    pub applied: Option<bool>,
}

/// Display sub-resource
#[derive(Debug, Clone)]
pub struct Display {
    pub parent: EntityId,
    pub ordinal: u32,
    pub name: String,
    pub handle: HwHandle,
    pub message: String,
}

/// Power monitor sub-resource
#[derive(Debug, Clone)]
pub struct PowerMonitor {
    pub parent: EntityId,
    pub ordinal: u32,
    pub name: String,
    pub handle: HwHandle,
    pub fault: FaultState,
    pub reading: Option<PowerReading>,
}

/// Sensor named by an external-control group
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SensorRef {
    pub entity_type: EntityType,
    pub slot: u32,
    pub sensor: String,
}

/// Aggregated temperature of an external-control group
#[derive(Debug, Clone)]
pub struct ExtControlGroup {
    pub name: String,
    pub members: Vec<SensorRef>,
    pub temperature: Option<i32>,
}
