//! Beacon detection strategies
//!
//! The continuous scanner runs while the process is alive inside the
//! geofence; the periodic task is the safety net that runs on OS wake-ups
//! when continuous scanning is unavailable or was suspended.

pub mod continuous;
pub mod filter;
pub mod periodic;
pub mod rssi_window;

pub use continuous::{ContinuousScanner, RadioLease};
pub use filter::ScanFilter;
pub use periodic::{PeriodicOutcome, PeriodicRun, PeriodicTask, SkipReason};
pub use rssi_window::RssiWindows;

use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;
use crate::persistence::PersistenceError;
use crate::platform::PlatformError;
use crate::presence::PresenceError;

/// Errors starting or configuring the continuous scanner
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Radio not ready after {0:?}")]
    NotReady(Duration),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Invalid name prefix filter: {0}")]
    Filter(#[from] regex::Error),

    #[error("Enter threshold {enter} must be above exit threshold {exit}")]
    InvalidThresholds { enter: i16, exit: i16 },
}

/// Errors raised by a periodic invocation
#[derive(Error, Debug)]
pub enum PeriodicError {
    #[error("Presence error: {0}")]
    Presence(#[from] PresenceError),

    #[error("Store error: {0}")]
    Store(#[from] PersistenceError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Scan setup error: {0}")]
    Scan(#[from] ScanError),
}
