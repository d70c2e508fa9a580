//! Hardware abstraction
//!
//! The poll loop and bus handlers reach hardware only through [`Hal`]. Every call is
//! fallible; a failure is folded into the calling record's fault-state as a
//! communication error and retried on the next cycle.
//!
//! # Units
//!
//! - Fan speeds are in RPM
//! - Temperatures are whole degrees Celsius
//! - Power readings are in milli-units (mV, mA, mW)

mod sim;

pub use sim::{SimChassis, SimHal};

use cm_error::Result;
use cm_protocol::{Airflow, EepromInfo, PowerReading};

use crate::data::{ChildKind, EntityAddr, HwHandle, HwResource};

/// Identity and capability data read through an entity handle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityInfo {
    pub eeprom: EepromInfo,
    /// Max fan speed for fans housed in this entity
    pub fan_max_speed: u32,
}

pub trait Hal: Send {
    /// Read whether the slot is occupied
    fn entity_present(&mut self, entity: EntityAddr) -> Result<bool>;

    /// Bring up a newly present entity
    fn entity_init(&mut self, entity: EntityAddr) -> Result<()>;

    /// Resolve the handle used for entity-level reads
    fn entity_handle(&mut self, entity: EntityAddr) -> Result<HwHandle>;

    /// Read name, EEPROM fields and fan max speed
    fn entity_info(&mut self, handle: HwHandle) -> Result<EntityInfo>;

    /// Read whether a PSU's output is powered
    fn psu_output_power(&mut self, entity: EntityAddr) -> Result<bool>;

    /// Read the airflow direction of a fan tray or PSU
    fn airflow(&mut self, handle: HwHandle) -> Result<Airflow>;

    /// List the resources of one kind housed in an entity, in hardware order
    fn enumerate(&mut self, entity: EntityAddr, kind: ChildKind) -> Result<Vec<HwResource>>;

    /// Read the fault signal of an entity or fan
    fn fault_status(&mut self, handle: HwHandle) -> Result<bool>;

    fn fan_speed(&mut self, fan: HwHandle) -> Result<u32>;

    fn set_fan_speed(&mut self, fan: HwHandle, rpm: u32) -> Result<()>;

    fn temperature(&mut self, sensor: HwHandle) -> Result<i32>;

    fn power_reading(&mut self, monitor: HwHandle) -> Result<PowerReading>;

    fn set_led(&mut self, led: HwHandle, on: bool) -> Result<()>;

    fn display_write(&mut self, display: HwHandle, message: &str) -> Result<()>;
}
