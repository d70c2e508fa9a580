//! Platform configuration
//!
//! A JSON document describing the chassis: slot counts, fan-control tuning, LED
//! priority groups and defaults, threshold slots per sensor, external-control
//! sensor groups, intervals and the NVRAM backing device. Every field has a
//! default so an empty document (or no file at all) yields a usable config.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use cm_error::{ChassisError, Result};
use cm_protocol::EntityType;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::constants::{fan, nvram, paths, thermal, timing};
use crate::data::types::SensorRef;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlotCounts {
    #[serde(default = "default_psu_slots")]
    pub psu: u32,
    #[serde(default = "default_fan_tray_slots")]
    pub fan_tray: u32,
    #[serde(default = "default_card_slots")]
    pub card: u32,
}

fn default_psu_slots() -> u32 { 2 }
fn default_fan_tray_slots() -> u32 { 4 }
fn default_card_slots() -> u32 { 1 }

impl SlotCounts {
    pub fn for_type(&self, entity_type: EntityType) -> u32 {
        match entity_type {
            EntityType::Psu => self.psu,
            EntityType::FanTray => self.fan_tray,
            EntityType::Card => self.card,
        }
    }
}

impl Default for SlotCounts {
    fn default() -> Self {
        Self {
            psu: default_psu_slots(),
            fan_tray: default_fan_tray_slots(),
            card: default_card_slots(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FanControlTuning {
    /// Minimum relative speed error, in percent, that triggers a correction
    #[serde(default = "default_margin")]
    pub margin_pct: u32,
    #[serde(default = "default_incr")]
    pub integrator_incr: u32,
    #[serde(default = "default_decr")]
    pub integrator_decr: u32,
    #[serde(default = "default_limit")]
    pub integrator_limit: u32,
}

fn default_margin() -> u32 { fan::DEFAULT_MARGIN_PCT }
fn default_incr() -> u32 { fan::DEFAULT_INTEGRATOR_INCR }
fn default_decr() -> u32 { fan::DEFAULT_INTEGRATOR_DECR }
fn default_limit() -> u32 { fan::DEFAULT_INTEGRATOR_LIMIT }

impl Default for FanControlTuning {
    fn default() -> Self {
        Self {
            margin_pct: default_margin(),
            integrator_incr: default_incr(),
            integrator_decr: default_decr(),
            integrator_limit: default_limit(),
        }
    }
}

/// Priority-ordered LED group; `members[0]` has the highest priority
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedGroupConfig {
    pub entity_type: EntityType,
    pub name: String,
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedDefault {
    pub entity_type: EntityType,
    pub led: String,
    pub on: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ThresholdConfig {
    #[serde(default = "default_threshold_count")]
    pub default_count: usize,
    /// Threshold slots by sensor name
    #[serde(default)]
    pub per_sensor: HashMap<String, usize>,
}

fn default_threshold_count() -> usize { thermal::DEFAULT_THRESHOLD_COUNT }

impl ThresholdConfig {
    pub fn count_for(&self, sensor: &str) -> usize {
        self.per_sensor.get(sensor).copied().unwrap_or(self.default_count)
    }
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self { default_count: default_threshold_count(), per_sensor: HashMap::new() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtControlGroupConfig {
    pub name: String,
    pub sensors: Vec<SensorRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NvramConfig {
    #[serde(default = "default_nvram_path")]
    pub path: PathBuf,
    #[serde(default = "default_nvram_size")]
    pub size: usize,
}

fn default_nvram_path() -> PathBuf { PathBuf::from(paths::NVRAM_FILE) }
fn default_nvram_size() -> usize { nvram::DEFAULT_SIZE }

impl Default for NvramConfig {
    fn default() -> Self {
        Self { path: default_nvram_path(), size: default_nvram_size() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PlatformConfig {
    #[serde(default)]
    pub slots: SlotCounts,
    #[serde(default)]
    pub fan_control: FanControlTuning,
    #[serde(default)]
    pub led_groups: Vec<LedGroupConfig>,
    #[serde(default)]
    pub led_defaults: Vec<LedDefault>,
    #[serde(default)]
    pub thresholds: ThresholdConfig,
    #[serde(default)]
    pub ext_control_groups: Vec<ExtControlGroupConfig>,
    #[serde(default)]
    pub intervals: Intervals,
    #[serde(default)]
    pub nvram: NvramConfig,
    #[serde(default)]
    pub journal_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Intervals {
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,
    #[serde(default = "default_remote_ms")]
    pub remote_poll_ms: u64,
    #[serde(default = "default_job_idle_ms")]
    pub job_idle_ms: u64,
}

fn default_poll_ms() -> u64 { timing::DEFAULT_POLL_INTERVAL_MS }
fn default_remote_ms() -> u64 { timing::DEFAULT_REMOTE_POLL_INTERVAL_MS }
fn default_job_idle_ms() -> u64 { timing::DEFAULT_JOB_IDLE_INTERVAL_MS }

impl Default for Intervals {
    fn default() -> Self {
        Self {
            poll_ms: default_poll_ms(),
            remote_poll_ms: default_remote_ms(),
            job_idle_ms: default_job_idle_ms(),
        }
    }
}

impl PlatformConfig {
    /// LED groups configured for an entity type
    pub fn led_groups_for(&self, entity_type: EntityType) -> impl Iterator<Item = &LedGroupConfig> {
        self.led_groups.iter().filter(move |g| g.entity_type == entity_type)
    }

    /// Configured power-up state for an LED, off when unset
    pub fn led_default(&self, entity_type: EntityType, led: &str) -> bool {
        self.led_defaults
            .iter()
            .find(|d| d.entity_type == entity_type && d.led == led)
            .map(|d| d.on)
            .unwrap_or(false)
    }
}

/// Resolve the configuration path: env override, system file, then per-user config dir
pub fn config_path() -> PathBuf {
    if let Ok(p) = std::env::var(paths::CONFIG_ENV) {
        return PathBuf::from(p);
    }
    let system = Path::new(paths::CONFIG_DIR).join(paths::CONFIG_FILE);
    if system.exists() {
        return system;
    }
    dirs::config_dir()
        .map(|d| d.join("chassisd").join(paths::CONFIG_FILE))
        .unwrap_or(system)
}

/// Load a configuration file; a missing file yields the defaults
pub fn load_config(path: &Path) -> Result<PlatformConfig> {
    if !path.exists() {
        debug!("No platform config at {:?}, using defaults", path);
        return Ok(PlatformConfig::default());
    }
    let contents = fs::read_to_string(path)
        .map_err(|e| ChassisError::FileRead { path: path.to_path_buf(), source: e })?;
    let config: PlatformConfig = serde_json::from_str(&contents)?;
    info!("Loaded platform config from {:?}", path);
    Ok(config)
}

/// Write a configuration file (used by tooling and tests)
pub fn save_config(path: &Path, config: &PlatformConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config)?;
    fs::write(path, json)
        .map_err(|e| ChassisError::FileWrite { path: path.to_path_buf(), source: e })
}
