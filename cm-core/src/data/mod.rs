//! Record types, platform configuration and its validation

mod config;
mod types;
mod validation;

pub use config::{
    config_path, load_config, save_config, ExtControlGroupConfig, FanControlTuning, Intervals,
    LedDefault, LedGroupConfig, NvramConfig, PlatformConfig, SlotCounts, ThresholdConfig,
};
pub use types::{
    now_millis, ChildKind, Display, Entity, EntityAddr, EntityId, ExtControlGroup, Fan, HwHandle,
    HwResource, Led, PowerMonitor, SensorRef, TempSensor,
};
pub use validation::validate_config;
