//! Unified error handling for the chassis manager
//!
//! This crate provides a single error type used across all chassis manager components.
//! It uses thiserror for ergonomic error definitions with proper Display and Error trait impls.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

/// Result type alias using ChassisError
pub type Result<T> = std::result::Result<T, ChassisError>;

/// Unified error type for all chassis manager operations
#[derive(thiserror::Error, Debug)]
pub enum ChassisError {
    // ============================================================================
    // I/O and File System Errors
    // ============================================================================
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: io::Error,
    },

    // ============================================================================
    // Hardware Access Errors
    // ============================================================================
    #[error("Hardware {op} failed: {reason}")]
    Hardware {
        op: &'static str,
        reason: String,
    },

    #[error("Hardware resource not available: {0}")]
    HardwareNotFound(String),

    // ============================================================================
    // Lookup and Store Errors
    // ============================================================================
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Resource store already holds key {0}")]
    StoreInsert(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // ============================================================================
    // NVRAM Errors
    // ============================================================================
    #[error("NVRAM not initialized")]
    NvramNotInitialized,

    #[error("NVRAM image corrupted: {0}")]
    NvramCorrupted(String),

    #[error("NVRAM full: {needed} bytes needed, {capacity} available")]
    NvramFull {
        needed: usize,
        capacity: usize,
    },

    // ============================================================================
    // Configuration Errors
    // ============================================================================
    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidConfig {
        field: String,
        reason: String,
    },

    // ============================================================================
    // Job Queue Errors
    // ============================================================================
    #[error("Job {name} rejected: {reason}")]
    JobRejected {
        name: String,
        reason: String,
    },

    #[error("A job queue is already active: {0}")]
    JobQueueActive(String),

    // ============================================================================
    // Concurrency Errors
    // ============================================================================
    #[error("Timed out after {0:?} waiting for the shared cache lock")]
    LockTimeout(Duration),
}

impl ChassisError {
    /// Create a hardware access error for the named operation
    pub fn hardware(op: &'static str, reason: impl Into<String>) -> Self {
        Self::Hardware {
            op,
            reason: reason.into(),
        }
    }

    /// Create a not-found error for the given resource key or description
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create an invalid request error
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Whether this error is the distinct not-found lookup outcome
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Short machine-readable category, used in bus error responses
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::LockTimeout(_) => "lock_timeout",
            Self::InvalidRequest(_) | Self::InvalidConfig { .. } => "invalid",
            Self::Hardware { .. } | Self::HardwareNotFound(_) => "hardware",
            Self::NvramNotInitialized | Self::NvramCorrupted(_) | Self::NvramFull { .. } => "nvram",
            _ => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_separates_not_found() {
        let err = ChassisError::not_found("fan/psu/1/#3");
        assert!(err.is_not_found());
        assert_eq!(err.kind(), "not_found");
        assert_eq!(ChassisError::hardware("read", "bus").kind(), "hardware");
        assert!(!ChassisError::hardware("read", "bus").is_not_found());
        let err = ChassisError::InvalidConfig { field: "led_groups".into(), reason: "dup".into() };
        assert_eq!(err.kind(), "invalid");
    }

    #[test]
    fn test_display_messages() {
        let err = ChassisError::NvramFull { needed: 300, capacity: 256 };
        assert_eq!(err.to_string(), "NVRAM full: 300 bytes needed, 256 available");
        let err = ChassisError::LockTimeout(Duration::from_secs(30));
        assert!(err.to_string().contains("30s"));
    }
}
