use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Presence state of the user relative to the monitored area
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppState {
    /// Outside the geofence (initial state)
    #[default]
    Outside,
    /// Inside the geofence, no beacon confirmed yet
    InsideArea,
    /// Beacon confirmed nearby
    Present,
    /// Beacon signal dropped below the exit threshold, waiting on the debounce
    Unconfirmed,
}

impl AppState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppState::Outside => "OUTSIDE",
            AppState::InsideArea => "INSIDE_AREA",
            AppState::Present => "PRESENT",
            AppState::Unconfirmed => "UNCONFIRMED",
        }
    }

    /// `Present` or `Unconfirmed`: a beacon was confirmed this session and not yet lost
    pub fn is_present_family(&self) -> bool {
        matches!(self, AppState::Present | AppState::Unconfirmed)
    }

    /// Anything but `Outside`
    pub fn is_in_area(&self) -> bool {
        !matches!(self, AppState::Outside)
    }
}

impl fmt::Display for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OUTSIDE" => Ok(AppState::Outside),
            "INSIDE_AREA" => Ok(AppState::InsideArea),
            "PRESENT" => Ok(AppState::Present),
            "UNCONFIRMED" => Ok(AppState::Unconfirmed),
            other => Err(format!("unknown presence state: {}", other)),
        }
    }
}

/// What caused a state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionCause {
    GeofenceEnter,
    GeofenceExit,
    ColdStart,
    BeaconDetected,
    SignalLost,
    DebounceExpired,
    Watchdog,
    PeriodicTtl,
    PeriodicScan,
    Manual,
}

impl TransitionCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionCause::GeofenceEnter => "geofence_enter",
            TransitionCause::GeofenceExit => "geofence_exit",
            TransitionCause::ColdStart => "cold_start",
            TransitionCause::BeaconDetected => "beacon_detected",
            TransitionCause::SignalLost => "signal_lost",
            TransitionCause::DebounceExpired => "debounce_expired",
            TransitionCause::Watchdog => "watchdog",
            TransitionCause::PeriodicTtl => "periodic_ttl",
            TransitionCause::PeriodicScan => "periodic_scan",
            TransitionCause::Manual => "manual",
        }
    }
}

impl fmt::Display for TransitionCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransitionCause {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "geofence_enter" => Ok(TransitionCause::GeofenceEnter),
            "geofence_exit" => Ok(TransitionCause::GeofenceExit),
            "cold_start" => Ok(TransitionCause::ColdStart),
            "beacon_detected" => Ok(TransitionCause::BeaconDetected),
            "signal_lost" => Ok(TransitionCause::SignalLost),
            "debounce_expired" => Ok(TransitionCause::DebounceExpired),
            "watchdog" => Ok(TransitionCause::Watchdog),
            "periodic_ttl" => Ok(TransitionCause::PeriodicTtl),
            "periodic_scan" => Ok(TransitionCause::PeriodicScan),
            "manual" => Ok(TransitionCause::Manual),
            other => Err(format!("unknown transition cause: {}", other)),
        }
    }
}

/// Identity of a beacon, as carried in attendance reports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRef {
    pub id: String,
    pub name: Option<String>,
}

/// Session bookkeeping persisted next to the state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    /// Last accepted detection, continuous or periodic
    pub last_seen_at: Option<DateTime<Utc>>,
    /// Set once per session after the enter report succeeded
    pub enter_sent_at: Option<DateTime<Utc>>,
    /// Inside-area status already reported this session
    pub inside_area_reported: bool,
    /// Periodic scans are suppressed until this instant
    pub rapid_retry_until: Option<DateTime<Utc>>,
    /// Previous periodic scan attempt
    pub last_scan_attempt_at: Option<DateTime<Utc>>,
    /// Consecutive unsuccessful periodic scans
    pub scan_failure_streak: u32,
    /// Beacon behind the most recent accepted detection
    pub last_device: Option<DeviceRef>,
}

/// A committed state transition, broadcast to subscribers and journaled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub from: AppState,
    pub to: AppState,
    pub cause: TransitionCause,
    pub at: DateTime<Utc>,
}
