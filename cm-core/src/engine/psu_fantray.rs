//! PSU and fan-tray specific polling
//!
//! Both kinds cache their airflow direction (reread only on a full refresh or while
//! unknown) and yield the entity handle as the "parent" whose fault signal the
//! entity state machine debounces.

use cm_protocol::{EntityType, FaultType};
use tracing::{debug, info};

use crate::data::{Entity, HwHandle};
use crate::hw::Hal;

/// Outcome of a type-specific poll
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TypePoll {
    /// Handle whose fault status the entity poll should read
    pub parent: Option<HwHandle>,
    pub notify: bool,
}

fn refresh_airflow(
    hal: &mut dyn Hal,
    entity: &mut Entity,
    handle: HwHandle,
    full_refresh: bool,
) -> bool {
    if entity.airflow.is_some() && !full_refresh {
        return false;
    }
    match hal.airflow(handle) {
        Ok(airflow) => {
            let changed = entity.airflow != Some(airflow);
            if changed {
                info!(entity = %entity.addr, ?airflow, "Airflow direction");
            }
            entity.airflow = Some(airflow);
            changed
        }
        Err(e) => {
            debug!(entity = %entity.addr, error = %e, "Airflow read failed");
            entity.fault.update(FaultType::CommError);
            false
        }
    }
}

pub fn poll_psu(hal: &mut dyn Hal, entity: &mut Entity, full_refresh: bool) -> TypePoll {
    debug_assert_eq!(entity.addr.entity_type, EntityType::Psu);
    let Some(handle) = entity.handle else {
        return TypePoll::default();
    };
    if !entity.init_ok || entity.is_unpowered_psu() {
        return TypePoll::default();
    }
    let notify = refresh_airflow(hal, entity, handle, full_refresh);
    TypePoll { parent: Some(handle), notify }
}

pub fn poll_fan_tray(hal: &mut dyn Hal, entity: &mut Entity, full_refresh: bool) -> TypePoll {
    debug_assert_eq!(entity.addr.entity_type, EntityType::FanTray);
    let Some(handle) = entity.handle else {
        return TypePoll::default();
    };
    if !entity.init_ok {
        return TypePoll::default();
    }
    let notify = refresh_airflow(hal, entity, handle, full_refresh);
    TypePoll { parent: Some(handle), notify }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::EntityAddr;
    use crate::hw::{EntityInfo, SimHal};
    use cm_protocol::Airflow;

    fn ready(sim: &SimHal, addr: EntityAddr) -> Entity {
        let handle = sim.add_entity(addr, EntityInfo::default());
        let mut entity = Entity::new(0, addr);
        entity.present = true;
        entity.init_ok = true;
        entity.power_status = true;
        entity.handle = Some(handle);
        entity
    }

    #[test]
    fn test_airflow_cached_until_full_refresh() {
        let mut sim = SimHal::new();
        let addr = EntityAddr::new(EntityType::FanTray, 1);
        let mut tray = ready(&sim, addr);

        let poll = poll_fan_tray(&mut sim, &mut tray, false);
        assert!(poll.notify);
        assert_eq!(poll.parent, tray.handle);
        assert_eq!(tray.airflow, Some(Airflow::Normal));

        sim.set_airflow(addr, Airflow::Reverse);
        assert!(!poll_fan_tray(&mut sim, &mut tray, false).notify);
        assert_eq!(tray.airflow, Some(Airflow::Normal));

        assert!(poll_fan_tray(&mut sim, &mut tray, true).notify);
        assert_eq!(tray.airflow, Some(Airflow::Reverse));
    }

    #[test]
    fn test_unpowered_psu_has_no_parent() {
        let mut sim = SimHal::new();
        let mut psu = ready(&sim, EntityAddr::new(EntityType::Psu, 1));
        psu.power_status = false;
        assert_eq!(poll_psu(&mut sim, &mut psu, true), TypePoll::default());
        psu.power_status = true;
        assert!(poll_psu(&mut sim, &mut psu, true).parent.is_some());
    }
}
