//! Fan control loop
//!
//! Each cycle compares the observed speed against the effective target (the
//! configured target, or max speed when none is set). A fan that is slower than
//! target by at least the error margin is commanded to target and the integrator
//! steps up; otherwise it decays toward zero. An integrator that reaches its limit
//! latches a speed error, and a latched speed error means HARDWARE-ERROR until the
//! integrator drains back to zero.
//!
//! Hardware fault signals are debounced: the fault counter must reach its cap before
//! HARDWARE-ERROR is raised, and below the cap the cycle ends with the previous
//! fault-state restored.

use cm_protocol::FaultType;
use tracing::{debug, info, warn};

use super::{status_changed, ParentState};
use crate::constants::fan as fan_const;
use crate::data::{Fan, FanControlTuning};
use crate::fault::FaultState;
use crate::hw::Hal;

/// Saturating speed-error integrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Integrator {
    pub incr: u32,
    pub decr: u32,
    pub limit: u32,
    pub sum: u32,
    /// Latched when `sum` reaches `limit`, cleared when it drains to zero
    pub speed_error: bool,
}

impl Integrator {
    pub fn new(tuning: &FanControlTuning) -> Self {
        Self {
            incr: tuning.integrator_incr,
            decr: tuning.integrator_decr,
            limit: tuning.integrator_limit,
            sum: 0,
            speed_error: false,
        }
    }

    pub fn increment(&mut self) {
        self.sum = self.sum.saturating_add(self.incr).min(self.limit);
        if self.sum >= self.limit {
            self.speed_error = true;
        }
    }

    pub fn decrement(&mut self) {
        self.sum = self.sum.saturating_sub(self.decr);
        if self.sum == 0 {
            self.speed_error = false;
        }
    }
}

/// True when `observed` trails `target` by at least `margin_pct` percent of target
fn below_margin(observed: u32, target: u32, margin_pct: u32) -> bool {
    if observed >= target {
        return false;
    }
    let error = u64::from(target - observed) * 100;
    error >= u64::from(margin_pct) * u64::from(target)
}

/// Run one control cycle for a fan. Returns true when the fan should be notified.
///
/// A failed max-speed read is charged to the owning entity through `parent_fault`.
pub fn poll_fan(
    hal: &mut dyn Hal,
    fan: &mut Fan,
    parent: &ParentState,
    parent_fault: &mut FaultState,
) -> bool {
    let prior = fan.fault;
    fan.fault.reset();

    if !fan.valid || parent.full_refresh {
        let info = match parent.handle {
            Some(handle) => hal.entity_info(handle),
            None => Err(cm_error::ChassisError::hardware("fan max speed read", "no entity handle")),
        };
        match info {
            Ok(info) => {
                fan.max_speed = info.fan_max_speed;
                fan.valid = true;
            }
            Err(e) => {
                debug!(fan = %fan.name, error = %e, "Max speed read failed");
                parent_fault.update(FaultType::CommError);
                return status_changed(&prior, &fan.fault);
            }
        }
    }

    if parent.unpowered_psu {
        fan.fault.update(parent.unpowered_fault());
        return status_changed(&prior, &fan.fault);
    }

    match hal.fault_status(fan.handle) {
        Err(e) => {
            debug!(fan = %fan.name, error = %e, "Fan fault read failed");
            fan.fault.update(FaultType::CommError);
            return status_changed(&prior, &fan.fault);
        }
        Ok(true) => {
            fan.fault_count = (fan.fault_count + 1).min(fan_const::FAULT_COUNT_CAP);
            if fan.fault_count >= fan_const::FAULT_COUNT_CAP {
                fan.fault.update(FaultType::HardwareError);
            } else {
                fan.fault = prior;
                return false;
            }
        }
        Ok(false) => fan.fault_count = 0,
    }

    match hal.fan_speed(fan.handle) {
        Ok(rpm) => fan.observed_speed = rpm,
        Err(e) => {
            debug!(fan = %fan.name, error = %e, "Fan speed read failed");
            fan.fault.update(FaultType::CommError);
            return status_changed(&prior, &fan.fault);
        }
    }

    let target = fan.effective_target();
    if target == 0 {
        fan.fault.update(FaultType::ConfigError);
    }

    if fan.speed_control && target > 0 && below_margin(fan.observed_speed, target, fan.margin_pct) {
        match hal.set_fan_speed(fan.handle, target) {
            Ok(()) => fan.commanded_speed = target,
            Err(e) => {
                warn!(fan = %fan.name, error = %e, "Fan speed command failed");
                fan.fault.update(FaultType::CommError);
            }
        }
        fan.integrator.increment();
    } else {
        fan.integrator.decrement();
    }

    if fan.integrator.speed_error {
        fan.fault.update(FaultType::HardwareError);
    }

    let changed = status_changed(&prior, &fan.fault);
    if changed {
        info!(
            fan = %fan.name,
            observed = fan.observed_speed,
            target_rpm = target,
            fault = ?fan.fault.fault_type,
            "Fan status changed"
        );
    }
    changed
}
