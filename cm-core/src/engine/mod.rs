//! Per-cycle control engines
//!
//! - `fan_loop` - target/observed speed reconciliation with integrator fault detection
//! - `thermal` - hysteretic threshold crossing detection and sensor polling
//! - `power` - power monitor polling
//! - `psu_fantray` - airflow caching and parent handle resolution for PSUs and fan trays
//!
//! Every poll function resets the record's fault-state, escalates whatever it finds
//! this cycle, and returns whether the record should be notified.

mod fan_loop;
mod power;
mod psu_fantray;
mod thermal;

pub use fan_loop::{poll_fan, Integrator};
pub use power::poll_power_monitor;
pub use psu_fantray::{poll_fan_tray, poll_psu, TypePoll};
pub use thermal::{poll_temp_sensor, LastCrossed, Threshold, ThresholdTracker};

use cm_protocol::FaultType;

use crate::data::{Entity, HwHandle};
use crate::fault::FaultState;

/// What a child poll needs to know about its owning entity
#[derive(Debug, Clone, Copy)]
pub struct ParentState {
    pub handle: Option<HwHandle>,
    pub unpowered_psu: bool,
    pub power_read_ok: bool,
    pub full_refresh: bool,
}

impl ParentState {
    pub fn of(entity: &Entity, full_refresh: bool) -> Self {
        Self {
            handle: entity.handle,
            unpowered_psu: entity.is_unpowered_psu(),
            power_read_ok: entity.power_read_ok,
            full_refresh,
        }
    }

    /// Fault raised on children of an unpowered PSU
    pub fn unpowered_fault(&self) -> FaultType {
        if self.power_read_ok {
            FaultType::PowerError
        } else {
            FaultType::CommError
        }
    }
}

/// Whether a record's visible status differs from the cycle's starting snapshot
pub(crate) fn status_changed(prior: &FaultState, now: &FaultState) -> bool {
    prior != now
}
