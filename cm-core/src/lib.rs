//! Chassis Manager Core Library
//!
//! Hardware-state cache and control logic for a switch chassis: power supplies,
//! fan trays and line cards, plus the fans, temperature sensors, LEDs, displays and
//! power monitors they carry.
//!
//! # Features
//!
//! - **Resource Store**: every cached record addressable by a string key
//! - **Entity State Machine**: presence, init retries, power and child lifecycle
//! - **Fan Control**: closed-loop speed checking with a saturating integrator
//! - **Thresholds**: debounced crossing detection with last-crossed tracking
//! - **LEDs**: priority groups with minimal hardware pushes
//! - **NVRAM**: tag/length/value store protected by CRC32
//! - **Job Queue**: FIFO for slow hardware work off the poll path
//!
//! # Module Structure
//!
//! - `hw/` - Hardware abstraction layer and the simulated chassis
//! - `data/` - Record types, platform configuration, validation
//! - `engine/` - Per-record poll algorithms
//!
//! # Example
//!
//! ```no_run
//! use cm_core::{Cache, PlatformConfig, SharedCache, SimHal};
//!
//! let config = PlatformConfig::default();
//! let hal = SimHal::populated(&config);
//! let cache = SharedCache::new(Cache::build(config, Box::new(hal)).unwrap());
//! let notifications = cache.acquire().unwrap().poll_entities();
//! ```

// Grouped modules
pub mod data;
pub mod engine;
pub mod hw;

// Standalone modules
pub mod bus;
pub mod cache;
pub mod constants;
pub mod entity;
pub mod fault;
pub mod jobs;
pub mod led;
pub mod nvram;
pub mod remote;
pub mod store;
pub mod views;

pub use data::{
    config_path, load_config, save_config, validate_config, ChildKind, Entity, EntityAddr,
    EntityId, ExtControlGroup, Fan, HwHandle, HwResource, PlatformConfig, TempSensor,
};

pub use bus::{handle_request, CollectingSink, LogSink, NotificationSink};
pub use cache::{Cache, ResourceRef, SharedCache};
pub use fault::FaultState;
pub use hw::{EntityInfo, Hal, SimHal};
pub use jobs::{Job, JobKind, JobQueue};
pub use nvram::{FileNvram, Nvram, NvramDevice, NvramEntry};
pub use remote::poll_remote;
pub use store::{ResourceKey, ResourceStore};

pub use cm_error::{ChassisError, Result};
