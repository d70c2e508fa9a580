//! LED priority resolver
//!
//! LEDs of an entity are organized into named groups, `members[0]` first. Resolving
//! a group lights the highest-priority member with a logical "on" request and forces
//! every other member off, so a group never shows more than one lit LED. LEDs that
//! belong to no group simply follow their own request.
//!
//! Hardware is only written when the resolved state differs from the last state
//! pushed; a freshly created LED has no applied state and is always pushed once.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::data::{Entity, LedGroupConfig, PlatformConfig};
use crate::hw::Hal;

/// Record a logical request. Returns false when the entity has no LED by that name.
pub fn set_requested(entity: &mut Entity, led: &str, on: bool) -> bool {
    match entity.leds.iter_mut().find(|l| l.name == led) {
        Some(l) => {
            l.requested = on;
            true
        }
        None => false,
    }
}

/// Push `on` to LED `index` if it differs from the applied state. Returns 1 on a push.
fn apply(hal: &mut dyn Hal, entity: &mut Entity, index: usize, on: bool) -> usize {
    let addr = entity.addr;
    let led = &mut entity.leds[index];
    if led.applied == Some(on) {
        return 0;
    }
    match hal.set_led(led.handle, on) {
        Ok(()) => {
            debug!(entity = %addr, led = %led.name, on, "LED pushed");
            led.applied = Some(on);
            1
        }
        Err(e) => {
            warn!(entity = %addr, led = %led.name, error = %e, "LED write failed");
            0
        }
    }
}

fn resolve_group(hal: &mut dyn Hal, entity: &mut Entity, group: &LedGroupConfig) -> usize {
    let members: Vec<usize> = group
        .members
        .iter()
        .filter_map(|name| entity.leds.iter().position(|l| &l.name == name))
        .collect();
    let winner = members.iter().copied().find(|&i| entity.leds[i].requested);

    let mut pushes = 0;
    for i in members {
        pushes += apply(hal, entity, i, Some(i) == winner);
    }
    pushes
}

/// Resolve every LED of an entity. Returns the number of hardware pushes.
pub fn resolve_entity(hal: &mut dyn Hal, entity: &mut Entity, config: &PlatformConfig) -> usize {
    let mut grouped = HashSet::new();
    let mut pushes = 0;
    for group in config.led_groups_for(entity.addr.entity_type) {
        grouped.extend(group.members.iter().map(String::as_str));
        pushes += resolve_group(hal, entity, group);
    }
    for i in 0..entity.leds.len() {
        if !grouped.contains(entity.leds[i].name.as_str()) {
            let on = entity.leds[i].requested;
            pushes += apply(hal, entity, i, on);
        }
    }
    pushes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ChildKind, EntityAddr, Led};
    use crate::hw::{EntityInfo, SimHal};
    use cm_protocol::EntityType;

    fn setup(names: &[&str], group: &[&str]) -> (SimHal, Entity, PlatformConfig) {
        let sim = SimHal::new();
        let addr = EntityAddr::new(EntityType::Card, 1);
        sim.add_entity(addr, EntityInfo::default());
        let mut entity = Entity::new(0, addr);
        for (i, name) in names.iter().enumerate() {
            let handle = sim.add_child(addr, ChildKind::Led, name);
            entity.leds.push(Led {
                parent: 0,
                ordinal: i as u32 + 1,
                name: name.to_string(),
                handle,
                requested: false,
                applied: None,
            });
        }
        let config = PlatformConfig {
            led_groups: vec![LedGroupConfig {
                entity_type: EntityType::Card,
                name: "status".into(),
                members: group.iter().map(|s| s.to_string()).collect(),
            }],
            ..Default::default()
        };
        (sim, entity, config)
    }

    fn applied(entity: &Entity, name: &str) -> Option<bool> {
        entity.leds.iter().find(|l| l.name == name).and_then(|l| l.applied)
    }

    #[test]
    fn test_priority_and_minimal_pushes() {
        let (mut sim, mut entity, config) = setup(&["A", "B"], &["A", "B"]);
        set_requested(&mut entity, "A", true);
        set_requested(&mut entity, "B", true);
        assert_eq!(resolve_entity(&mut sim, &mut entity, &config), 2);
        assert_eq!(applied(&entity, "A"), Some(true));
        assert_eq!(applied(&entity, "B"), Some(false));

        set_requested(&mut entity, "A", false);
        assert_eq!(resolve_entity(&mut sim, &mut entity, &config), 2);
        assert_eq!(applied(&entity, "A"), Some(false));
        assert_eq!(applied(&entity, "B"), Some(true));
        assert_eq!(sim.led_pushes(entity.leds[0].handle), 2);
        assert_eq!(sim.led_pushes(entity.leds[1].handle), 2);
    }

    #[test]
    fn test_second_resolution_is_idempotent() {
        let (mut sim, mut entity, config) = setup(&["A", "B", "C"], &["A", "B", "C"]);
        set_requested(&mut entity, "B", true);
        resolve_entity(&mut sim, &mut entity, &config);
        assert_eq!(resolve_entity(&mut sim, &mut entity, &config), 0);
    }

    #[test]
    fn test_at_most_one_lit_per_group() {
        let (mut sim, mut entity, config) = setup(&["A", "B", "C"], &["C", "B", "A"]);
        for name in ["A", "B", "C"] {
            set_requested(&mut entity, name, true);
        }
        resolve_entity(&mut sim, &mut entity, &config);
        let lit: Vec<_> = entity.leds.iter().filter(|l| l.applied == Some(true)).collect();
        assert_eq!(lit.len(), 1);
        assert_eq!(lit[0].name, "C");
    }

    #[test]
    fn test_ungrouped_led_follows_request() {
        let (mut sim, mut entity, config) = setup(&["A", "Locator"], &["A"]);
        set_requested(&mut entity, "Locator", true);
        resolve_entity(&mut sim, &mut entity, &config);
        assert_eq!(applied(&entity, "Locator"), Some(true));
        assert_eq!(applied(&entity, "A"), Some(false));
    }

    #[test]
    fn test_unknown_led_rejected() {
        let (_sim, mut entity, _config) = setup(&["A"], &["A"]);
        assert!(!set_requested(&mut entity, "Nope", true));
    }
}
