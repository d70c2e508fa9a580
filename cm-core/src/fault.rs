//! Fault state tracking
//!
//! Each cached record carries an {operational status, fault type} pair. The fault type
//! only ever escalates during a poll cycle; the only way back down is `reset()`, which
//! every poll performs before it starts looking for faults.

pub use cm_protocol::{FaultType, OperStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultState {
    pub oper_status: OperStatus,
    pub fault_type: FaultType,
}

impl FaultState {
    pub fn new() -> Self {
        Self { oper_status: OperStatus::Up, fault_type: FaultType::Ok }
    }

    /// Reset to {UP, OK}
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Escalate to `fault` if it outranks the stored fault type.
    ///
    /// Returns true only for the UP -> FAIL transition.
    pub fn update(&mut self, fault: FaultType) -> bool {
        if fault <= self.fault_type {
            return false;
        }
        let was_up = self.oper_status == OperStatus::Up;
        self.fault_type = fault;
        self.oper_status = OperStatus::Fail;
        was_up
    }

    pub fn is_ok(&self) -> bool {
        self.fault_type == FaultType::Ok
    }
}

impl Default for FaultState {
    fn default() -> Self {
        Self::new()
    }
}
