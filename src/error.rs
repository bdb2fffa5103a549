//! Custom error types for the campaign driver.
//!
//! This module defines the primary error type, `FleetError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the failures that can occur while driving experiments across the device fleet.
//!
//! ## Error Hierarchy
//!
//! - **`Connectivity`**: A device could not be reached, a liveness probe failed, or a
//!   tester handshake gave up after its retry budget.
//! - **`Protocol`**: A telemetry frame was short, malformed, or carried the wrong markers.
//! - **`Transfer`**: Copying an artifact off a device failed.
//! - **`Training`**: The training coordinator reported a failed training phase.
//! - **`ConfigMismatch`**: The roster size disagrees with the declared party count.
//! - **`Decode`**: A ledger key could not be decoded into a descriptor.
//! - **`InvalidExperiment`**: A descriptor failed its validity check.
//!
//! Ledger, measurement log, configuration, and I/O errors are wrapped with `#[from]` so the `?`
//! operator works across module boundaries.

use thiserror::Error;

use crate::experiment::codec::DecodeError;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, FleetError>;

/// Errors raised while driving a campaign.
#[derive(Error, Debug)]
pub enum FleetError {
    /// A device or endpoint did not answer
    #[error("Device '{device}' unreachable: {reason}")]
    Connectivity {
        /// Device identity or endpoint
        device: String,
        /// What went wrong
        reason: String,
    },

    /// Malformed tester frame or control bus traffic
    #[error("Telemetry protocol error: {0}")]
    Protocol(String),

    /// Artifacts could not be copied from a device
    #[error("Transfer from '{device}' failed: {reason}")]
    Transfer {
        /// Device identity
        device: String,
        /// What went wrong
        reason: String,
    },

    /// The training coordinator failed
    #[error("Training failed: {0}")]
    Training(String),

    /// Declared party count disagrees with the roster
    #[error("Roster has {actual} parties but {declared} were declared")]
    ConfigMismatch {
        /// Count in the campaign settings
        declared: usize,
        /// Parties in the roster
        actual: usize,
    },

    /// A ledger key did not decode
    #[error("Descriptor decode error: {0}")]
    Decode(#[from] DecodeError),

    /// A descriptor names something outside the catalog
    #[error("Invalid experiment: {0}")]
    InvalidExperiment(String),

    /// Ledger database error
    #[error("Ledger error: {0}")]
    Ledger(#[from] rusqlite::Error),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration loaded but is inconsistent
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// A command template does not expand
    #[error("Command template error: {0}")]
    Template(String),

    /// Measurement file could not be written or read
    #[error("Measurement log error: {0}")]
    MeasurementLog(#[from] csv::Error),

    /// Local I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FleetError {
    /// Shorthand for a connectivity failure on a named device.
    pub fn connectivity(device: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Connectivity {
            device: device.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a transfer failure on a named device.
    pub fn transfer(device: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Transfer {
            device: device.into(),
            reason: reason.into(),
        }
    }
}

impl From<figment::Error> for FleetError {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FleetError::connectivity("rpi3", "probe token not echoed");
        assert_eq!(
            err.to_string(),
            "Device 'rpi3' unreachable: probe token not echoed"
        );
    }

    #[test]
    fn test_config_mismatch_display() {
        let err = FleetError::ConfigMismatch {
            declared: 4,
            actual: 3,
        };
        assert!(err.to_string().contains("3 parties"));
    }
}
