//! Request, response and notification types exchanged with the request/notification bus.
//!
//! The bus adapter translates its own key encoding into these types; nothing in here
//! fixes a wire format. Every type derives serde so an adapter can pick one.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum display message length accepted from the bus
pub const MAX_DISPLAY_MESSAGE: usize = 64;

/// Highest slot number a locator may name
const MAX_SLOT: u32 = 64;

/// Highest ordinal a locator may name
const MAX_ORDINAL: u32 = 255;

// ============================================================================
// Shared vocabulary
// ============================================================================

/// Kind of field-replaceable unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Psu,
    FanTray,
    Card,
}

impl EntityType {
    pub const ALL: [EntityType; 3] = [EntityType::Psu, EntityType::FanTray, EntityType::Card];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Psu => "psu",
            EntityType::FanTray => "fan_tray",
            EntityType::Card => "card",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Class of cached record a request or notification refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceClass {
    Entity,
    Fan,
    TemperatureSensor,
    Led,
    Display,
    PowerMonitor,
    ExtControlGroup,
    Nvram,
}

impl ResourceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceClass::Entity => "entity",
            ResourceClass::Fan => "fan",
            ResourceClass::TemperatureSensor => "temperature",
            ResourceClass::Led => "led",
            ResourceClass::Display => "display",
            ResourceClass::PowerMonitor => "power_monitor",
            ResourceClass::ExtControlGroup => "ext_control_group",
            ResourceClass::Nvram => "nvram",
        }
    }
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operational status half of a fault-state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperStatus {
    Up,
    Fail,
}

/// Fault type, declared least to most severe so the derived ordering is the severity order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultType {
    Ok,
    Unknown,
    CommError,
    ConfigError,
    CompatError,
    PowerError,
    HardwareError,
}

/// Airflow direction reported by fan trays and PSUs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Airflow {
    Normal,
    Reverse,
}

/// Identity data read from an entity's EEPROM
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EepromInfo {
    pub name: String,
    pub vendor: String,
    pub product: String,
    pub part_number: String,
    pub hw_version: String,
    pub platform_name: String,
    pub ppid: String,
    pub service_tag: String,
}

/// One power monitor sample
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerReading {
    pub input_voltage_mv: u32,
    pub input_current_ma: u32,
    pub output_voltage_mv: u32,
    pub output_current_ma: u32,
    pub output_power_mw: u32,
}

/// Identifies one sub-resource by its owning entity and either ordinal or name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLocator {
    pub entity_type: EntityType,
    pub slot: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ordinal: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ResourceLocator {
    pub fn by_ordinal(entity_type: EntityType, slot: u32, ordinal: u32) -> Self {
        Self { entity_type, slot, ordinal: Some(ordinal), name: None }
    }

    pub fn by_name(entity_type: EntityType, slot: u32, name: impl Into<String>) -> Self {
        Self { entity_type, slot, ordinal: None, name: Some(name.into()) }
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_slot(self.slot)?;
        match (&self.ordinal, &self.name) {
            (None, None) => Err("Locator needs an ordinal or a name".into()),
            (Some(o), _) if *o == 0 || *o > MAX_ORDINAL => {
                Err(format!("Ordinal {} out of range (1-{})", o, MAX_ORDINAL))
            }
            (_, Some(n)) if n.is_empty() => Err("Locator name is empty".into()),
            _ => Ok(()),
        }
    }
}

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "data")]
pub enum Request {
    GetEntity { entity_type: EntityType, slot: u32 },
    SetAdminStatus { entity_type: EntityType, slot: u32, up: bool },
    GetFan { locator: ResourceLocator },
    SetFanTarget { locator: ResourceLocator, speed: u32 },
    SetFanSpeedControl { locator: ResourceLocator, enabled: bool },
    GetTemperature { locator: ResourceLocator },
    SetThreshold { locator: ResourceLocator, index: usize, hi: i32, lo: i32 },
    SetThresholdsEnabled { locator: ResourceLocator, enabled: bool },
    SetShutdownThreshold { locator: ResourceLocator, celsius: Option<i32> },
    GetLed { locator: ResourceLocator },
    SetLed { locator: ResourceLocator, on: bool },
    GetDisplay { locator: ResourceLocator },
    SetDisplayMessage { locator: ResourceLocator, message: String },
    GetPowerMonitor { locator: ResourceLocator },
    GetExtControlGroup { name: String },
    GetNvram { tag: u64 },
    SetNvram { tag: u64, data: Option<Vec<u8>> },
}

impl Request {
    /// Validate request parameters before dispatch
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Request::GetEntity { slot, .. } | Request::SetAdminStatus { slot, .. } => {
                validate_slot(*slot)
            }

            Request::GetFan { locator }
            | Request::SetFanSpeedControl { locator, .. }
            | Request::GetTemperature { locator }
            | Request::SetThresholdsEnabled { locator, .. }
            | Request::SetShutdownThreshold { locator, .. }
            | Request::GetLed { locator }
            | Request::SetLed { locator, .. }
            | Request::GetDisplay { locator }
            | Request::GetPowerMonitor { locator } => locator.validate(),

            Request::SetFanTarget { locator, .. } => locator.validate(),

            Request::SetThreshold { locator, hi, lo, .. } => {
                locator.validate()?;
                if lo > hi {
                    return Err(format!("Threshold lo {} above hi {}", lo, hi));
                }
                Ok(())
            }

            Request::SetDisplayMessage { locator, message } => {
                locator.validate()?;
                if message.len() > MAX_DISPLAY_MESSAGE {
                    return Err(format!(
                        "Display message too long: {} bytes (max {})",
                        message.len(),
                        MAX_DISPLAY_MESSAGE
                    ));
                }
                Ok(())
            }

            Request::GetExtControlGroup { name } => {
                if name.is_empty() {
                    return Err("Group name is empty".into());
                }
                Ok(())
            }

            Request::GetNvram { .. } | Request::SetNvram { .. } => Ok(()),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Request::GetEntity { .. } => "GetEntity",
            Request::SetAdminStatus { .. } => "SetAdminStatus",
            Request::GetFan { .. } => "GetFan",
            Request::SetFanTarget { .. } => "SetFanTarget",
            Request::SetFanSpeedControl { .. } => "SetFanSpeedControl",
            Request::GetTemperature { .. } => "GetTemperature",
            Request::SetThreshold { .. } => "SetThreshold",
            Request::SetThresholdsEnabled { .. } => "SetThresholdsEnabled",
            Request::SetShutdownThreshold { .. } => "SetShutdownThreshold",
            Request::GetLed { .. } => "GetLed",
            Request::SetLed { .. } => "SetLed",
            Request::GetDisplay { .. } => "GetDisplay",
            Request::SetDisplayMessage { .. } => "SetDisplayMessage",
            Request::GetPowerMonitor { .. } => "GetPowerMonitor",
            Request::GetExtControlGroup { .. } => "GetExtControlGroup",
            Request::GetNvram { .. } => "GetNvram",
            Request::SetNvram { .. } => "SetNvram",
        }
    }
}

fn validate_slot(slot: u32) -> Result<(), String> {
    if slot == 0 || slot > MAX_SLOT {
        return Err(format!("Slot {} out of range (1-{})", slot, MAX_SLOT));
    }
    Ok(())
}

// ============================================================================
// Responses
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum Response {
    #[serde(rename = "ok")]
    Ok(ResourceData),
    #[serde(rename = "error")]
    Error { kind: String, message: String },
}

impl Response {
    pub fn error(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Response::Error { kind: kind.into(), message: message.into() }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok(_))
    }
}

/// Payload of a successful response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "resource", content = "value", rename_all = "snake_case")]
pub enum ResourceData {
    Done,
    Entity(EntityView),
    Fan(FanView),
    Temperature(TemperatureView),
    Led(LedView),
    Display(DisplayView),
    PowerMonitor(PowerMonitorView),
    ExtControlGroup(ExtControlGroupView),
    Nvram(NvramView),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChildCounts {
    pub fans: usize,
    pub temperature_sensors: usize,
    pub leds: usize,
    pub displays: usize,
    pub power_monitors: usize,
}

impl ChildCounts {
    pub fn total(&self) -> usize {
        self.fans + self.temperature_sensors + self.leds + self.displays + self.power_monitors
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityView {
    pub entity_type: EntityType,
    pub slot: u32,
    pub present: bool,
    pub insertion_count: u32,
    pub insertion_ts_ms: u64,
    pub init_ok: bool,
    pub init_fail_count: u32,
    pub power_on: bool,
    pub power_status: bool,
    pub fault_count: u32,
    pub admin_up: bool,
    pub oper_status: OperStatus,
    pub fault_type: FaultType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eeprom: Option<EepromInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub airflow: Option<Airflow>,
    pub children: ChildCounts,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanView {
    pub entity_type: EntityType,
    pub slot: u32,
    pub ordinal: u32,
    pub name: String,
    pub target_speed: Option<u32>,
    pub commanded_speed: u32,
    pub observed_speed: u32,
    pub max_speed: u32,
    pub speed_control: bool,
    pub margin_pct: u32,
    pub integrator: u32,
    pub speed_error: bool,
    pub fault_count: u32,
    pub oper_status: OperStatus,
    pub fault_type: FaultType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdView {
    pub index: usize,
    pub hi: i32,
    pub lo: i32,
    pub valid: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemperatureView {
    pub entity_type: EntityType,
    pub slot: u32,
    pub ordinal: u32,
    pub name: String,
    pub current: Option<i32>,
    pub previous: Option<i32>,
    pub samples: u8,
    pub shutdown_threshold: Option<i32>,
    pub over_shutdown: bool,
    pub thresholds_enabled: bool,
    pub thresholds: Vec<ThresholdView>,
    pub last_crossed_temp: i32,
    pub last_crossed_dir: i8,
    pub oper_status: OperStatus,
    pub fault_type: FaultType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedView {
    pub entity_type: EntityType,
    pub slot: u32,
    pub ordinal: u32,
    pub name: String,
    pub requested: bool,
    pub applied: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayView {
    pub entity_type: EntityType,
    pub slot: u32,
    pub ordinal: u32,
    pub name: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerMonitorView {
    pub entity_type: EntityType,
    pub slot: u32,
    pub ordinal: u32,
    pub name: String,
    pub reading: Option<PowerReading>,
    pub oper_status: OperStatus,
    pub fault_type: FaultType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtControlGroupView {
    pub name: String,
    pub members: usize,
    pub temperature: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NvramView {
    pub tag: u64,
    pub data: Option<Vec<u8>>,
}

// ============================================================================
// Notifications
// ============================================================================

/// Change notification: record class, resource key and the changed fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub class: ResourceClass,
    pub key: String,
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl Notification {
    pub fn new(class: ResourceClass, key: impl Into<String>) -> Self {
        Self { class, key: key.into(), fields: serde_json::Map::new() }
    }

    pub fn with(mut self, field: &str, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(field.to_string(), value.into());
        self
    }
}
