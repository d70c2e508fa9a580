//! Configuration validation
//!
//! Run once after loading; the daemon refuses to start on a config that fails here.

use std::collections::HashSet;

use cm_error::{ChassisError, Result};

use crate::constants::nvram;
use crate::data::config::PlatformConfig;

fn invalid(field: &str, reason: impl Into<String>) -> ChassisError {
    ChassisError::InvalidConfig { field: field.to_string(), reason: reason.into() }
}

pub fn validate_config(config: &PlatformConfig) -> Result<()> {
    let tuning = &config.fan_control;
    if tuning.margin_pct > 100 {
        return Err(invalid("fan_control.margin_pct", format!("{} exceeds 100", tuning.margin_pct)));
    }
    if tuning.integrator_limit == 0 {
        return Err(invalid("fan_control.integrator_limit", "must be non-zero"));
    }
    if tuning.integrator_incr == 0 {
        return Err(invalid("fan_control.integrator_incr", "must be non-zero"));
    }

    // An LED belongs to at most one group per entity type
    let mut grouped = HashSet::new();
    for group in &config.led_groups {
        if group.members.is_empty() {
            return Err(invalid("led_groups", format!("group {} has no members", group.name)));
        }
        for member in &group.members {
            if member.is_empty() || !grouped.insert((group.entity_type, member.as_str())) {
                return Err(invalid(
                    "led_groups",
                    format!("group {} has an empty or duplicate member {:?}", group.name, member),
                ));
            }
        }
    }

    let mut group_names = HashSet::new();
    for group in &config.ext_control_groups {
        if group.sensors.is_empty() {
            return Err(invalid(
                "ext_control_groups",
                format!("group {} has no sensors", group.name),
            ));
        }
        if group.name.is_empty() || !group_names.insert(group.name.as_str()) {
            return Err(invalid("ext_control_groups", format!("bad group name {:?}", group.name)));
        }
    }

    if config.nvram.size < nvram::HEADER_LEN + nvram::CRC_LEN {
        return Err(invalid(
            "nvram.size",
            format!("{} is smaller than the image header and checksum", config.nvram.size),
        ));
    }

    if config.intervals.poll_ms == 0 || config.intervals.remote_poll_ms == 0 {
        return Err(invalid("intervals", "poll intervals must be non-zero"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::config::{ExtControlGroupConfig, LedGroupConfig};
    use cm_protocol::EntityType;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&PlatformConfig::default()).is_ok());
    }

    #[test]
    fn test_margin_over_hundred_rejected() {
        let mut config = PlatformConfig::default();
        config.fan_control.margin_pct = 150;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_duplicate_led_member_rejected() {
        let mut config = PlatformConfig::default();
        config.led_groups.push(LedGroupConfig {
            entity_type: EntityType::Card,
            name: "status".into(),
            members: vec!["Amber".into(), "Amber".into()],
        });
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_led_in_two_groups_rejected() {
        let mut config = PlatformConfig::default();
        config.led_groups = vec![
            LedGroupConfig {
                entity_type: EntityType::Card,
                name: "status".into(),
                members: vec!["Red".into(), "Green".into()],
            },
            LedGroupConfig {
                entity_type: EntityType::Card,
                name: "locate".into(),
                members: vec!["Blue".into(), "Red".into()],
            },
        ];
        assert!(validate_config(&config).is_err());

        // The same name under another entity type is a different LED
        config.led_groups[1].entity_type = EntityType::Psu;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_empty_ext_group_rejected() {
        let mut config = PlatformConfig::default();
        config
            .ext_control_groups
            .push(ExtControlGroupConfig { name: "cpu".into(), sensors: vec![] });
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_tiny_nvram_rejected() {
        let mut config = PlatformConfig::default();
        config.nvram.size = 8;
        assert!(validate_config(&config).is_err());
    }
}
