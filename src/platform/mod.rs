//! Operating-system seams
//!
//! Everything the presence subsystem needs from the host OS goes through
//! the traits in this module: radio scanning, the periodic background
//! scheduler, background execution grants, capability queries, location
//! fixes and foreground status. Platform differences are captured once in
//! a [`PlatformProfile`] instead of being branched on throughout the code.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::models::Advertisement;

/// Errors reported by platform services
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("Radio unavailable: {0}")]
    RadioUnavailable(String),

    #[error("Scan failed to start: {0}")]
    ScanStart(String),

    #[error("Background scheduler error: {0}")]
    Scheduler(String),

    #[error("Background execution grant refused: {0}")]
    Grant(String),

    #[error("Location unavailable: {0}")]
    Location(String),
}

/// Capabilities that differ between platforms, resolved once at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformProfile {
    /// A durable execution grant (foreground service) must be held while scanning in background
    pub requires_background_grant: bool,
    /// Scan callbacks stop arriving while the host process is backgrounded
    pub suppresses_background_scan_callbacks: bool,
    /// The radio can filter by service identifier while backgrounded
    pub can_filter_by_service_while_backgrounded: bool,
    /// Notification permission is needed to keep background work alive
    pub needs_notification_permission: bool,
    /// A battery-optimization exemption is needed for reliable periodic wake-ups
    pub needs_battery_exemption: bool,
}

impl PlatformProfile {
    pub fn android() -> Self {
        PlatformProfile {
            requires_background_grant: true,
            suppresses_background_scan_callbacks: false,
            can_filter_by_service_while_backgrounded: false,
            needs_notification_permission: true,
            needs_battery_exemption: true,
        }
    }

    pub fn ios() -> Self {
        PlatformProfile {
            requires_background_grant: false,
            suppresses_background_scan_callbacks: true,
            can_filter_by_service_while_backgrounded: true,
            needs_notification_permission: false,
            needs_battery_exemption: false,
        }
    }

    pub fn generic() -> Self {
        PlatformProfile {
            requires_background_grant: false,
            suppresses_background_scan_callbacks: false,
            can_filter_by_service_while_backgrounded: true,
            needs_notification_permission: false,
            needs_battery_exemption: false,
        }
    }

    /// Look up a preset by name
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "android" => Some(Self::android()),
            "ios" => Some(Self::ios()),
            "generic" | "desktop" | "linux" => Some(Self::generic()),
            _ => None,
        }
    }
}

impl Default for PlatformProfile {
    fn default() -> Self {
        Self::generic()
    }
}

/// Which advertisements the radio should deliver
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanRequest {
    /// Service identifiers for native filtering; `None` requests a full scan
    pub service_uuids: Option<Vec<String>>,
}

impl ScanRequest {
    pub fn full() -> Self {
        ScanRequest { service_uuids: None }
    }

    pub fn filtered(service_uuids: Vec<String>) -> Self {
        ScanRequest {
            service_uuids: Some(service_uuids),
        }
    }
}

/// Radio scanning API
#[async_trait]
pub trait RadioScanner: Send + Sync {
    /// Wait until the radio is powered on and usable
    async fn wait_ready(&self) -> Result<(), PlatformError>;

    /// Start scanning; advertisements arrive on the returned channel until `stop_scan`
    async fn start_scan(
        &self,
        request: ScanRequest,
    ) -> Result<mpsc::Receiver<Advertisement>, PlatformError>;

    /// Stop the current scan, if any
    fn stop_scan(&self);
}

/// Authorization status of the periodic background scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackgroundFetchStatus {
    Available,
    Denied,
    Restricted,
}

/// Identifier of one scheduler invocation, handed back on completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InvocationId(pub u64);

/// What a periodic invocation reports back to the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskResult {
    NewData,
    NoData,
    Failed,
}

/// Coarse OS-driven periodic wake-ups
#[async_trait]
pub trait BackgroundScheduler: Send + Sync {
    /// Configure the minimum interval between wake-ups
    async fn configure(&self, interval: Duration) -> Result<(), PlatformError>;

    /// Start delivering wake-ups; starting twice is a no-op
    async fn start(&self) -> Result<(), PlatformError>;

    /// Stop delivering wake-ups
    fn stop(&self);

    fn is_running(&self) -> bool;

    /// Mark an invocation as finished; must be called once per invocation
    fn finish(&self, invocation: InvocationId, result: TaskResult);

    async fn status(&self) -> BackgroundFetchStatus;
}

/// Durable background execution grant (e.g. a foreground service)
#[async_trait]
pub trait BackgroundGrant: Send + Sync {
    async fn acquire(&self) -> Result<(), PlatformError>;

    /// Release the grant; releasing when not held is a no-op
    fn release(&self);
}

/// Permission and battery capability queries
#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    async fn notifications_granted(&self) -> bool;

    /// Show the notification permission prompt; returns the resulting grant
    async fn request_notifications(&self) -> bool;

    async fn battery_optimization_exempt(&self) -> bool;

    /// Ask for a battery-optimization exemption; returns the resulting status
    async fn request_battery_exemption(&self) -> bool;
}

/// A location fix from the OS
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationFix {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub accuracy_m: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait LocationProvider: Send + Sync {
    /// Current position, if one can be obtained
    async fn current_fix(&self) -> Result<Option<LocationFix>, PlatformError>;
}

/// Whether the host process is currently in the foreground
pub trait ForegroundStatus: Send + Sync {
    fn is_foreground(&self) -> bool;
}
