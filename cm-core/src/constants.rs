//! Constants and configuration defaults for the chassis manager
//!
//! Centralizes the fixed caps, intervals, sentinels and on-device layout values.
//! Defaults here are only starting points where the platform configuration has a field.

use std::time::Duration;

/// System paths
pub mod paths {
    /// System-wide configuration directory
    pub const CONFIG_DIR: &str = "/etc/chassisd";

    /// Platform configuration file name
    pub const CONFIG_FILE: &str = "platform.json";

    /// Environment variable overriding the configuration path
    pub const CONFIG_ENV: &str = "CHASSISD_CONFIG";

    /// Default NVRAM backing file
    pub const NVRAM_FILE: &str = "/var/lib/chassisd/nvram.bin";

    /// Default notification journal
    pub const JOURNAL_FILE: &str = "/var/log/chassisd/notifications.json";
}

/// Timing constants
pub mod timing {
    use super::Duration;

    /// Bound on waiting for the shared cache lock
    pub const LOCK_TIMEOUT: Duration = Duration::from_secs(30);

    /// Default entity poll interval
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;

    /// Default remote-sensor poll interval
    pub const DEFAULT_REMOTE_POLL_INTERVAL_MS: u64 = 10_000;

    /// Sleep between job-queue checks while the queue is empty
    pub const DEFAULT_JOB_IDLE_INTERVAL_MS: u64 = 100;
}

/// Entity state machine caps
pub mod entity {
    /// Hardware init attempts before COMM-ERROR is raised
    pub const MAX_INIT_ATTEMPTS: u32 = 3;

    /// Saturation point of the entity fault-status counter
    pub const FAULT_COUNT_CAP: u32 = 3;
}

/// Fan control loop caps and defaults
pub mod fan {
    /// Saturation point of the per-fan fault-status counter
    pub const FAULT_COUNT_CAP: u32 = 3;

    /// Default speed error margin in percent
    pub const DEFAULT_MARGIN_PCT: u32 = 10;

    /// Default integrator step when the fan is below target
    pub const DEFAULT_INTEGRATOR_INCR: u32 = 1;

    /// Default integrator step when the fan is on target
    pub const DEFAULT_INTEGRATOR_DECR: u32 = 1;

    /// Default integrator saturation limit
    pub const DEFAULT_INTEGRATOR_LIMIT: u32 = 5;
}

/// Temperature threshold engine values
pub mod thermal {
    /// Samples kept before the counter saturates
    pub const MAX_SAMPLES: u8 = 2;

    /// Last-crossed temperature after thresholds are (re)enabled
    pub const LAST_CROSSED_SENTINEL: i32 = -9999;

    /// Default number of threshold slots per sensor
    pub const DEFAULT_THRESHOLD_COUNT: usize = 3;
}

/// NVRAM TLV image layout
pub mod nvram {
    /// Image magic
    pub const MAGIC: [u8; 4] = *b"TLV\0";

    /// Supported image version
    pub const VERSION: u8 = 1;

    /// Offset of the first record (magic + version + region length)
    pub const HEADER_LEN: usize = 7;

    /// Trailing CRC32 size
    pub const CRC_LEN: usize = 4;

    /// Per-record header: 64-bit tag + 32-bit length
    pub const RECORD_HEADER_LEN: usize = 12;

    /// Payload bytes kept per entry
    pub const MAX_PAYLOAD: usize = 256;

    /// Largest record region the 16-bit length field can describe
    pub const MAX_REGION: usize = u16::MAX as usize;

    /// Default device size
    pub const DEFAULT_SIZE: usize = 4096;
}
