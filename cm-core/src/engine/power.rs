//! Power monitor polling

use cm_protocol::FaultType;
use tracing::debug;

use super::{status_changed, ParentState};
use crate::data::PowerMonitor;
use crate::hw::Hal;

/// Poll one monitor. Returns true when the reading or the status changed.
pub fn poll_power_monitor(
    hal: &mut dyn Hal,
    monitor: &mut PowerMonitor,
    parent: &ParentState,
) -> bool {
    let prior = monitor.fault;
    monitor.fault.reset();

    if parent.unpowered_psu {
        monitor.fault.update(parent.unpowered_fault());
        return status_changed(&prior, &monitor.fault);
    }

    match hal.power_reading(monitor.handle) {
        Ok(reading) => {
            let changed = monitor.reading != Some(reading);
            monitor.reading = Some(reading);
            changed || status_changed(&prior, &monitor.fault)
        }
        Err(e) => {
            debug!(monitor = %monitor.name, error = %e, "Power read failed");
            monitor.fault.update(FaultType::CommError);
            status_changed(&prior, &monitor.fault)
        }
    }
}
