use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::platform::{BackgroundFetchStatus, PlatformProfile};

/// Errors raised while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration for the presence daemon
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Presence store location
    pub store: StoreConfig,
    /// Monitored geofence region
    pub geofence: GeofenceConfig,
    /// Beacon filters and thresholds
    pub beacon: BeaconConfig,
    /// Continuous scanner timing
    pub scanner: ScannerConfig,
    /// Periodic fallback task timing
    pub periodic: PeriodicConfig,
    /// Attendance service
    pub attendance: AttendanceConfig,
    /// Platform profile selection
    pub platform: PlatformConfig,
    /// Capabilities reported by the daemon host
    pub host: HostConfig,
    /// Platform event input
    pub input: InputConfig,
    /// Transition journal output
    pub output: OutputConfig,
}

/// Presence store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path to the SQLite database
    pub path: PathBuf,
    /// Transition history older than this many days is pruned at startup
    pub history_retention_days: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            path: PathBuf::from("presence.db"),
            history_retention_days: 30,
        }
    }
}

/// Geofence region configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeofenceConfig {
    pub identifier: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Radius in metres
    pub radius_m: f64,
    pub notify_on_enter: bool,
    pub notify_on_exit: bool,
    /// Location fixes older than this are not trusted for cold-start correction
    pub max_fix_age_secs: u64,
}

impl Default for GeofenceConfig {
    fn default() -> Self {
        GeofenceConfig {
            identifier: "office".to_string(),
            latitude: 52.520008,
            longitude: 13.404954,
            radius_m: 150.0,
            notify_on_enter: true,
            notify_on_exit: true,
            max_fix_age_secs: 300,
        }
    }
}

/// Beacon filter and threshold configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BeaconConfig {
    /// Service identifiers accepted as beacons
    pub service_uuids: Vec<String>,
    /// Case-insensitive device name prefixes accepted as beacons
    pub name_prefixes: Vec<String>,
    /// Smoothed RSSI at or above which the user counts as present (dBm)
    pub enter_threshold: i16,
    /// Smoothed RSSI below which presence becomes unconfirmed (dBm)
    pub exit_threshold: i16,
}

impl Default for BeaconConfig {
    fn default() -> Self {
        BeaconConfig {
            service_uuids: vec!["0000feaa-0000-1000-8000-00805f9b34fb".to_string()],
            name_prefixes: vec!["Office-Beacon".to_string()],
            enter_threshold: -65,
            exit_threshold: -75,
        }
    }
}

/// Continuous scanner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Samples kept per device for smoothing
    pub window_size: usize,
    /// Delay before an unconfirmed presence is downgraded
    pub debounce_secs: u64,
    /// How often the watchdog checks for silence
    pub watchdog_interval_secs: u64,
    /// Silence after which the watchdog downgrades presence
    pub watchdog_timeout_secs: u64,
    /// How long to wait for the radio to become ready
    pub ready_timeout_secs: u64,
}

impl ScannerConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs)
    }

    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_secs(self.watchdog_timeout_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        ScannerConfig {
            window_size: 5,
            debounce_secs: 30,
            watchdog_interval_secs: 10,
            watchdog_timeout_secs: 180,
            ready_timeout_secs: 10,
        }
    }
}

/// Periodic fallback task configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeriodicConfig {
    /// Minimum interval between OS wake-ups
    pub interval_secs: u64,
    /// Upper bound for one scan attempt
    pub scan_timeout_secs: u64,
    /// A PRESENT state older than this without detections is downgraded
    pub presence_ttl_secs: i64,
    /// Skip scanning if the last detection is younger than this
    pub fresh_detection_secs: i64,
    /// Minimum spacing between two scan attempts
    pub min_retry_secs: i64,
    /// Suppression window after the first failed attempt, doubled per further failure
    pub backoff_base_secs: i64,
    /// Upper bound of the suppression window
    pub backoff_max_secs: i64,
}

impl PeriodicConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }
}

impl Default for PeriodicConfig {
    fn default() -> Self {
        PeriodicConfig {
            interval_secs: 900,
            scan_timeout_secs: 15,
            presence_ttl_secs: 600,
            fresh_detection_secs: 120,
            min_retry_secs: 120,
            backoff_base_secs: 60,
            backoff_max_secs: 1800,
        }
    }
}

/// Attendance service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttendanceConfig {
    pub base_url: String,
    pub enter_path: String,
    pub exit_path: String,
    pub inside_area_path: String,
    pub timeout_secs: u64,
    /// Seeds the stored user identifier when none is stored yet
    pub user_id: Option<String>,
    /// Extra request headers (e.g. authorization)
    pub headers: Option<HashMap<String, String>>,
}

impl Default for AttendanceConfig {
    fn default() -> Self {
        AttendanceConfig {
            base_url: "http://localhost:8080".to_string(),
            enter_path: "/attendance/enter".to_string(),
            exit_path: "/attendance/exit".to_string(),
            inside_area_path: "/attendance/inside-area".to_string(),
            timeout_secs: 15,
            user_id: None,
            headers: None,
        }
    }
}

/// Platform profile selection with optional per-flag overrides
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// Preset name: "android", "ios" or "generic"
    pub profile: String,
    pub requires_background_grant: Option<bool>,
    pub suppresses_background_scan_callbacks: Option<bool>,
    pub can_filter_by_service_while_backgrounded: Option<bool>,
    pub needs_notification_permission: Option<bool>,
    pub needs_battery_exemption: Option<bool>,
}

impl PlatformConfig {
    /// Resolve the preset and apply overrides
    pub fn resolve(&self) -> Result<PlatformProfile, ConfigError> {
        let mut profile = PlatformProfile::from_name(&self.profile).ok_or_else(|| {
            ConfigError::Invalid(format!("unknown platform profile: {}", self.profile))
        })?;

        if let Some(v) = self.requires_background_grant {
            profile.requires_background_grant = v;
        }
        if let Some(v) = self.suppresses_background_scan_callbacks {
            profile.suppresses_background_scan_callbacks = v;
        }
        if let Some(v) = self.can_filter_by_service_while_backgrounded {
            profile.can_filter_by_service_while_backgrounded = v;
        }
        if let Some(v) = self.needs_notification_permission {
            profile.needs_notification_permission = v;
        }
        if let Some(v) = self.needs_battery_exemption {
            profile.needs_battery_exemption = v;
        }
        Ok(profile)
    }
}

impl Default for PlatformConfig {
    fn default() -> Self {
        PlatformConfig {
            profile: "generic".to_string(),
            requires_background_grant: None,
            suppresses_background_scan_callbacks: None,
            can_filter_by_service_while_backgrounded: None,
            needs_notification_permission: None,
            needs_battery_exemption: None,
        }
    }
}

/// Capabilities the daemon host reports to the capability manager
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub notifications_granted: bool,
    pub battery_optimization_exempt: bool,
    pub background_fetch: BackgroundFetchStatus,
    /// Initial foreground status; updated by foreground events
    pub start_in_foreground: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            notifications_granted: true,
            battery_optimization_exempt: true,
            background_fetch: BackgroundFetchStatus::Available,
            start_in_foreground: true,
        }
    }
}

/// Platform event input configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// Type of input source: "file" or "udp"
    pub source_type: String,
    /// Path to a JSON-lines event file (if source_type is "file")
    pub file_path: Option<PathBuf>,
    /// UDP bind address (if source_type is "udp")
    pub udp_address: Option<String>,
}

impl Default for InputConfig {
    fn default() -> Self {
        InputConfig {
            source_type: "file".to_string(),
            file_path: Some(PathBuf::from("platform-events.jsonl")),
            udp_address: None,
        }
    }
}

/// Transition journal configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Output format: "json", "jsonl", or "console"
    pub format: String,
    /// Output file path (if format is not "console")
    pub file_path: Option<PathBuf>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            format: "console".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.beacon.enter_threshold <= self.beacon.exit_threshold {
            return Err(ConfigError::Invalid(format!(
                "enter_threshold ({}) must be greater than exit_threshold ({})",
                self.beacon.enter_threshold, self.beacon.exit_threshold
            )));
        }
        if self.beacon.service_uuids.is_empty() && self.beacon.name_prefixes.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one service uuid or name prefix is required".to_string(),
            ));
        }
        if self.scanner.window_size == 0 {
            return Err(ConfigError::Invalid("window_size must be at least 1".to_string()));
        }
        if self.scanner.watchdog_interval_secs == 0 || self.periodic.interval_secs == 0 {
            return Err(ConfigError::Invalid("intervals must be non-zero".to_string()));
        }
        if !(self.geofence.radius_m > 0.0) {
            return Err(ConfigError::Invalid("geofence radius must be positive".to_string()));
        }
        self.platform.resolve()?;
        Ok(())
    }
}
