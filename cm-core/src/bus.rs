//! Request/notification bus entry points
//!
//! `handle_request` is the single dispatcher the bus adapter calls. It validates the
//! request, takes the shared lock with its bounded wait, resolves the target through
//! the resource store, applies the read or write, releases the lock and only then
//! hands any resulting notifications to the sink.

use cm_error::{ChassisError, Result};
use cm_protocol::{
    Notification, NvramView, Request, ResourceClass, ResourceData, ResourceLocator, Response,
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::cache::{Cache, SharedCache};
use crate::data::{ChildKind, Entity};
use crate::led;
use crate::store::ResourceKey;
use crate::views;

/// Receiver of change notifications
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: &Notification);
}

/// Sink that records notifications in the tracing log
#[derive(Debug, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, notification: &Notification) {
        info!(class = %notification.class, key = %notification.key, "Notification");
    }
}

/// Sink that keeps every notification until taken
#[derive(Debug, Default)]
pub struct CollectingSink {
    received: Mutex<Vec<Notification>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<Notification> {
        std::mem::take(&mut *self.received.lock())
    }
}

impl NotificationSink for CollectingSink {
    fn notify(&self, notification: &Notification) {
        self.received.lock().push(notification.clone());
    }
}

/// Hand a batch of notifications to a sink, in order
pub fn emit(sink: &dyn NotificationSink, notifications: &[Notification]) {
    for n in notifications {
        sink.notify(n);
    }
}

fn error_response(e: &ChassisError) -> Response {
    Response::error(e.kind(), e.to_string())
}

/// Serve one bus request
pub fn handle_request(
    cache: &SharedCache,
    sink: &dyn NotificationSink,
    request: Request,
) -> Response {
    if let Err(msg) = request.validate() {
        warn!(request = request.type_name(), "Rejected request: {}", msg);
        return Response::error("invalid", msg);
    }
    debug!(request = request.type_name(), "Handling request");

    let outcome = match cache.acquire() {
        Ok(mut guard) => dispatch(&mut guard, request),
        Err(e) => {
            warn!(request = request.type_name(), error = %e, "Shared cache unavailable");
            return error_response(&e);
        }
    };

    match outcome {
        Ok((data, notifications)) => {
            emit(sink, &notifications);
            Response::Ok(data)
        }
        Err(e) => {
            debug!(error = %e, "Request failed");
            error_response(&e)
        }
    }
}

type Outcome = Result<(ResourceData, Vec<Notification>)>;

fn entity_of(cache: &Cache, id: usize) -> Result<&Entity> {
    cache.entity(id).ok_or_else(|| ChassisError::not_found(format!("entity #{}", id)))
}

fn child_note(
    entity: &Entity,
    kind: ChildKind,
    ordinal: u32,
    class: ResourceClass,
    view: &impl serde::Serialize,
) -> Notification {
    views::notification(class, &views::child_key(entity, kind, ordinal), view)
}

fn dispatch(cache: &mut Cache, request: Request) -> Outcome {
    match request {
        Request::GetEntity { entity_type, slot } => {
            let id = cache.find_entity(entity_type, slot)?;
            Ok((ResourceData::Entity(views::entity_view(entity_of(cache, id)?)), Vec::new()))
        }

        Request::SetAdminStatus { entity_type, slot, up } => {
            let id = cache.find_entity(entity_type, slot)?;
            let entity = cache.entity_mut(id).ok_or_else(|| ChassisError::not_found("entity"))?;
            let mut notes = Vec::new();
            if entity.admin_up != up {
                entity.admin_up = up;
                info!(entity = %entity.addr, up, "Admin status set");
                notes.push(views::entity_notification(entity));
            }
            Ok((ResourceData::Done, notes))
        }

        Request::GetFan { locator } => {
            let (id, index) = cache.find_child(ChildKind::Fan, &locator)?;
            let entity = entity_of(cache, id)?;
            let fan = &entity.fans[index];
            Ok((ResourceData::Fan(views::fan_view(entity, fan)), Vec::new()))
        }

        Request::SetFanTarget { locator, speed } => update_fan(cache, &locator, |fan| {
            let changed = fan.target_speed != Some(speed);
            fan.target_speed = Some(speed);
            changed
        }),

        Request::SetFanSpeedControl { locator, enabled } => update_fan(cache, &locator, |fan| {
            let changed = fan.speed_control != enabled;
            fan.speed_control = enabled;
            changed
        }),

        Request::GetTemperature { locator } => {
            let (id, index) = cache.find_child(ChildKind::TemperatureSensor, &locator)?;
            let entity = entity_of(cache, id)?;
            let sensor = &entity.temp_sensors[index];
            Ok((ResourceData::Temperature(views::temperature_view(entity, sensor)), Vec::new()))
        }

        Request::SetThreshold { locator, index: slot, hi, lo } => {
            update_sensor(cache, &locator, |sensor| {
                if sensor.tracker.set_threshold(slot, hi, lo) {
                    Ok(true)
                } else {
                    Err(ChassisError::invalid(format!(
                        "threshold index {} out of range ({} configured)",
                        slot,
                        sensor.tracker.thresholds().len()
                    )))
                }
            })
        }

        Request::SetThresholdsEnabled { locator, enabled } => {
            update_sensor(cache, &locator, |sensor| Ok(sensor.tracker.set_enabled(enabled)))
        }

        Request::SetShutdownThreshold { locator, celsius } => {
            update_sensor(cache, &locator, |sensor| {
                let changed = sensor.shutdown_threshold != celsius;
                sensor.shutdown_threshold = celsius;
                Ok(changed)
            })
        }

        Request::GetLed { locator } => {
            let (id, index) = cache.find_child(ChildKind::Led, &locator)?;
            let entity = entity_of(cache, id)?;
            Ok((ResourceData::Led(views::led_view(entity, &entity.leds[index])), Vec::new()))
        }

        Request::SetLed { locator, on } => {
            let (id, index) = cache.find_child(ChildKind::Led, &locator)?;
            let (hal, entity, config) =
                cache.hal_and_entity(id).ok_or_else(|| ChassisError::not_found("entity"))?;
            let before: Vec<Option<bool>> = entity.leds.iter().map(|l| l.applied).collect();
            let name = entity.leds[index].name.clone();
            led::set_requested(entity, &name, on);
            let pushes = led::resolve_entity(hal, entity, config);
            debug!(entity = %entity.addr, led = %name, on, pushes, "LED request");

            let entity: &Entity = entity;
            let notes = entity
                .leds
                .iter()
                .zip(before)
                .filter(|(led, before)| led.applied != *before || led.name == name)
                .map(|(led, _)| {
                    let view = views::led_view(entity, led);
                    child_note(entity, ChildKind::Led, led.ordinal, ResourceClass::Led, &view)
                })
                .collect();
            Ok((ResourceData::Done, notes))
        }

        Request::GetDisplay { locator } => {
            let (id, index) = cache.find_child(ChildKind::Display, &locator)?;
            let entity = entity_of(cache, id)?;
            let view = views::display_view(entity, &entity.displays[index]);
            Ok((ResourceData::Display(view), Vec::new()))
        }

        Request::SetDisplayMessage { locator, message } => {
            let (id, index) = cache.find_child(ChildKind::Display, &locator)?;
            let (hal, entity, _) =
                cache.hal_and_entity(id).ok_or_else(|| ChassisError::not_found("entity"))?;
            let mut notes = Vec::new();
            if entity.displays[index].message != message {
                hal.display_write(entity.displays[index].handle, &message)?;
                entity.displays[index].message = message;
                let display = &entity.displays[index];
                notes.push(child_note(
                    entity,
                    ChildKind::Display,
                    display.ordinal,
                    ResourceClass::Display,
                    &views::display_view(entity, display),
                ));
            }
            Ok((ResourceData::Done, notes))
        }

        Request::GetPowerMonitor { locator } => {
            let (id, index) = cache.find_child(ChildKind::PowerMonitor, &locator)?;
            let entity = entity_of(cache, id)?;
            let monitor = &entity.power_monitors[index];
            Ok((ResourceData::PowerMonitor(views::power_monitor_view(entity, monitor)), Vec::new()))
        }

        Request::GetExtControlGroup { name } => {
            let index = cache.find_ext_group(&name)?;
            let group = cache
                .ext_groups()
                .get(index)
                .ok_or_else(|| {
                    ChassisError::not_found(ResourceKey::ext_control_group(&name).to_string())
                })?;
            Ok((ResourceData::ExtControlGroup(views::ext_control_group_view(group)), Vec::new()))
        }

        Request::GetNvram { tag } => {
            let nvram = cache.nvram().ok_or(ChassisError::NvramNotInitialized)?;
            let data = nvram
                .get(tag)
                .ok_or_else(|| ChassisError::not_found(ResourceKey::nvram(tag).to_string()))?;
            Ok((ResourceData::Nvram(NvramView { tag, data: Some(data.to_vec()) }), Vec::new()))
        }

        Request::SetNvram { tag, data } => {
            let nvram = cache.nvram_mut().ok_or(ChassisError::NvramNotInitialized)?;
            let notes = nvram.set(tag, data.as_deref())?.into_iter().collect();
            Ok((ResourceData::Done, notes))
        }
    }
}

fn update_fan(
    cache: &mut Cache,
    locator: &ResourceLocator,
    apply: impl FnOnce(&mut crate::data::Fan) -> bool,
) -> Outcome {
    let (id, index) = cache.find_child(ChildKind::Fan, locator)?;
    let entity = cache.entity_mut(id).ok_or_else(|| ChassisError::not_found("entity"))?;
    let mut notes = Vec::new();
    if apply(&mut entity.fans[index]) {
        let fan = &entity.fans[index];
        let view = views::fan_view(entity, fan);
        notes.push(child_note(entity, ChildKind::Fan, fan.ordinal, ResourceClass::Fan, &view));
    }
    Ok((ResourceData::Done, notes))
}

fn update_sensor(
    cache: &mut Cache,
    locator: &ResourceLocator,
    apply: impl FnOnce(&mut crate::data::TempSensor) -> Result<bool>,
) -> Outcome {
    let (id, index) = cache.find_child(ChildKind::TemperatureSensor, locator)?;
    let entity = cache.entity_mut(id).ok_or_else(|| ChassisError::not_found("entity"))?;
    let mut notes = Vec::new();
    if apply(&mut entity.temp_sensors[index])? {
        let sensor = &entity.temp_sensors[index];
        notes.push(child_note(
            entity,
            ChildKind::TemperatureSensor,
            sensor.ordinal,
            ResourceClass::TemperatureSensor,
            &views::temperature_view(entity, sensor),
        ));
    }
    Ok((ResourceData::Done, notes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{EntityAddr, PlatformConfig};
    use crate::hw::SimHal;
    use cm_protocol::EntityType;
    use std::time::Duration;

    fn shared() -> (SharedCache, SimHal) {
        let config = PlatformConfig::default();
        let sim = SimHal::populated(&config);
        let mut cache = Cache::build(config, Box::new(sim.clone())).unwrap();
        cache.poll_entities();
        (SharedCache::new(cache), sim)
    }

    #[test]
    fn test_get_entity() {
        let (cache, _) = shared();
        let sink = CollectingSink::new();
        let request = Request::GetEntity { entity_type: EntityType::Psu, slot: 2 };
        let response = handle_request(&cache, &sink, request);
        match response {
            Response::Ok(ResourceData::Entity(view)) => {
                assert!(view.present);
                assert_eq!(view.slot, 2);
                assert_eq!(view.children.fans, 1);
            }
            other => panic!("unexpected response {:?}", other),
        }
        assert!(sink.take().is_empty());
    }

    #[test]
    fn test_missing_child_is_not_found() {
        let (cache, _) = shared();
        let sink = CollectingSink::new();
        let locator = ResourceLocator::by_ordinal(EntityType::FanTray, 1, 9);
        match handle_request(&cache, &sink, Request::GetFan { locator }) {
            Response::Error { kind, .. } => assert_eq!(kind, "not_found"),
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn test_invalid_locator_rejected_before_lookup() {
        let (cache, _) = shared();
        let sink = CollectingSink::new();
        let locator =
            ResourceLocator { entity_type: EntityType::Card, slot: 1, ordinal: None, name: None };
        match handle_request(&cache, &sink, Request::GetLed { locator }) {
            Response::Error { kind, .. } => assert_eq!(kind, "invalid"),
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn test_set_fan_target_notifies_once() {
        let (cache, _) = shared();
        let sink = CollectingSink::new();
        let locator = ResourceLocator::by_name(EntityType::FanTray, 2, "Fan 2");
        let request = Request::SetFanTarget { locator: locator.clone(), speed: 15_000 };
        assert!(handle_request(&cache, &sink, request.clone()).is_ok());
        assert!(handle_request(&cache, &sink, request).is_ok());
        let notes = sink.take();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].key, "fan/fan_tray/2/#2");
        assert_eq!(notes[0].fields["target_speed"], 15_000);
    }

    #[test]
    fn test_threshold_index_out_of_range() {
        let (cache, _) = shared();
        let sink = CollectingSink::new();
        let locator = ResourceLocator::by_name(EntityType::Card, 1, "CPU");
        let request = Request::SetThreshold { locator, index: 7, hi: 90, lo: 80 };
        let response = handle_request(&cache, &sink, request);
        assert!(!response.is_ok());
    }

    #[test]
    fn test_display_message_pushed_to_hardware() {
        let (cache, sim) = shared();
        let sink = CollectingSink::new();
        let locator = ResourceLocator::by_ordinal(EntityType::Card, 1, 1);
        let request = Request::SetDisplayMessage { locator, message: "HELLO".into() };
        assert!(handle_request(&cache, &sink, request).is_ok());
        let card = EntityAddr::new(EntityType::Card, 1);
        let hw = sim.handle_of(card, ChildKind::Display, "Front Panel").unwrap();
        assert_eq!(sim.display_message(hw), "HELLO");
        assert_eq!(sink.take().len(), 1);
    }

    #[test]
    fn test_lock_timeout_surfaces_as_error() {
        let (cache, _) = shared();
        let cache = cache.with_timeout(Duration::from_millis(10));
        let contender = cache.clone();
        let _guard = cache.acquire().unwrap();
        let response = std::thread::spawn(move || {
            let sink = CollectingSink::new();
            let request = Request::GetEntity { entity_type: EntityType::Card, slot: 1 };
            handle_request(&contender, &sink, request)
        })
        .join()
        .unwrap();
        match response {
            Response::Error { kind, .. } => assert_eq!(kind, "lock_timeout"),
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn test_nvram_without_device() {
        let (cache, _) = shared();
        let sink = CollectingSink::new();
        let response = handle_request(&cache, &sink, Request::GetNvram { tag: 1 });
        match response {
            Response::Error { kind, .. } => assert_eq!(kind, "nvram"),
            other => panic!("unexpected response {:?}", other),
        }
    }
}
