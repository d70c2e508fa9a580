//! Conversion from cached records to bus views and notifications

use cm_protocol::{
    DisplayView, EntityView, ExtControlGroupView, FanView, LedView, Notification, PowerMonitorView,
    ResourceClass, TemperatureView,
};
use serde::Serialize;

use crate::data::{ChildKind, Display, Entity, ExtControlGroup, Fan, Led, PowerMonitor, TempSensor};
use crate::store::ResourceKey;

pub fn entity_view(entity: &Entity) -> EntityView {
    EntityView {
        entity_type: entity.addr.entity_type,
        slot: entity.addr.slot,
        present: entity.present,
        insertion_count: entity.insertion_count,
        insertion_ts_ms: entity.insertion_ts_ms,
        init_ok: entity.init_ok,
        init_fail_count: entity.init_fail_count,
        power_on: entity.power_on,
        power_status: entity.power_status,
        fault_count: entity.fault_count,
        admin_up: entity.admin_up,
        oper_status: entity.fault.oper_status,
        fault_type: entity.fault.fault_type,
        eeprom: entity.eeprom_valid.then(|| entity.eeprom.clone()),
        airflow: entity.airflow,
        children: entity.child_counts(),
    }
}

pub fn fan_view(entity: &Entity, fan: &Fan) -> FanView {
    FanView {
        entity_type: entity.addr.entity_type,
        slot: entity.addr.slot,
        ordinal: fan.ordinal,
        name: fan.name.clone(),
        target_speed: fan.target_speed,
        commanded_speed: fan.commanded_speed,
        observed_speed: fan.observed_speed,
        max_speed: fan.max_speed,
        speed_control: fan.speed_control,
        margin_pct: fan.margin_pct,
        integrator: fan.integrator.sum,
        speed_error: fan.integrator.speed_error,
        fault_count: fan.fault_count,
        oper_status: fan.fault.oper_status,
        fault_type: fan.fault.fault_type,
    }
}

pub fn temperature_view(entity: &Entity, sensor: &TempSensor) -> TemperatureView {
    let last = sensor.tracker.last_crossed();
    TemperatureView {
        entity_type: entity.addr.entity_type,
        slot: entity.addr.slot,
        ordinal: sensor.ordinal,
        name: sensor.name.clone(),
        current: sensor.tracker.current(),
        previous: sensor.tracker.previous(),
        samples: sensor.tracker.samples(),
        shutdown_threshold: sensor.shutdown_threshold,
        over_shutdown: sensor.over_shutdown,
        thresholds_enabled: sensor.tracker.enabled(),
        thresholds: sensor.tracker.views(),
        last_crossed_temp: last.temperature,
        last_crossed_dir: last.direction,
        oper_status: sensor.fault.oper_status,
        fault_type: sensor.fault.fault_type,
    }
}

pub fn led_view(entity: &Entity, led: &Led) -> LedView {
    LedView {
        entity_type: entity.addr.entity_type,
        slot: entity.addr.slot,
        ordinal: led.ordinal,
        name: led.name.clone(),
        requested: led.requested,
        applied: led.applied,
    }
}

pub fn display_view(entity: &Entity, display: &Display) -> DisplayView {
    DisplayView {
        entity_type: entity.addr.entity_type,
        slot: entity.addr.slot,
        ordinal: display.ordinal,
        name: display.name.clone(),
        message: display.message.clone(),
    }
}

pub fn power_monitor_view(entity: &Entity, monitor: &PowerMonitor) -> PowerMonitorView {
    PowerMonitorView {
        entity_type: entity.addr.entity_type,
        slot: entity.addr.slot,
        ordinal: monitor.ordinal,
        name: monitor.name.clone(),
        reading: monitor.reading,
        oper_status: monitor.fault.oper_status,
        fault_type: monitor.fault.fault_type,
    }
}

pub fn ext_control_group_view(group: &ExtControlGroup) -> ExtControlGroupView {
    ExtControlGroupView {
        name: group.name.clone(),
        members: group.members.len(),
        temperature: group.temperature,
    }
}

/// Notification carrying every field of a serialized view
pub fn notification<T: Serialize>(
    class: ResourceClass,
    key: &ResourceKey,
    view: &T,
) -> Notification {
    let mut n = Notification::new(class, key.as_str());
    if let Ok(serde_json::Value::Object(fields)) = serde_json::to_value(view) {
        n.fields = fields;
    }
    n
}

pub fn entity_notification(entity: &Entity) -> Notification {
    let key = ResourceKey::entity(entity.addr.entity_type, entity.addr.slot);
    notification(ResourceClass::Entity, &key, &entity_view(entity))
}

pub(crate) fn child_key(entity: &Entity, kind: ChildKind, ordinal: u32) -> ResourceKey {
    ResourceKey::child_by_ordinal(kind, entity.addr.entity_type, entity.addr.slot, ordinal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::EntityAddr;
    use cm_protocol::EntityType;

    #[test]
    fn test_entity_notification_fields() {
        let mut entity = Entity::new(0, EntityAddr::new(EntityType::FanTray, 3));
        entity.present = true;
        let n = entity_notification(&entity);
        assert_eq!(n.class, ResourceClass::Entity);
        assert_eq!(n.key, "entity/fan_tray/3");
        assert_eq!(n.fields["present"], true);
        assert_eq!(n.fields["fault_type"], "ok");
        assert!(!n.fields.contains_key("eeprom"));
    }
}
