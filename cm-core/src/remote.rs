//! Remote-sensor aggregation
//!
//! Each external-control group names sensors spread across entities. On every
//! remote poll the group's temperature becomes the highest current reading among
//! its healthy members, or unknown when none of them has a reading.

use cm_protocol::{Notification, ResourceClass, ResourceLocator};
use tracing::debug;

use crate::cache::Cache;
use crate::data::{ChildKind, SensorRef};
use crate::store::ResourceKey;
use crate::views;

fn member_reading(cache: &Cache, member: &SensorRef) -> Option<i32> {
    let locator = ResourceLocator::by_name(member.entity_type, member.slot, member.sensor.clone());
    let (entity, index) = cache.find_child(ChildKind::TemperatureSensor, &locator).ok()?;
    let sensor = cache.entity(entity)?.temp_sensors.get(index)?;
    if !sensor.fault.is_ok() {
        return None;
    }
    sensor.tracker.current()
}

/// Recompute every group. Returns notifications for groups whose temperature changed.
pub fn poll_remote(cache: &mut Cache) -> Vec<Notification> {
    let readings: Vec<Option<i32>> = cache
        .ext_groups()
        .iter()
        .map(|group| group.members.iter().filter_map(|m| member_reading(cache, m)).max())
        .collect();

    let mut out = Vec::new();
    for (group, temperature) in cache.ext_groups_mut().iter_mut().zip(readings) {
        if group.temperature == temperature {
            continue;
        }
        debug!(group = %group.name, ?temperature, "External-control group temperature");
        group.temperature = temperature;
        let key = ResourceKey::ext_control_group(&group.name);
        out.push(views::notification(
            ResourceClass::ExtControlGroup,
            &key,
            &views::ext_control_group_view(group),
        ));
    }
    out
}
