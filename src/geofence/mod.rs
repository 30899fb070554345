//! Geofence region and boundary events

pub mod bridge;

pub use bridge::GeofenceBridge;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::GeofenceConfig;
use crate::platform::LocationFix;

/// Geographic coordinates in degrees
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

/// Boundary crossing direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeofenceTransition {
    Enter,
    Exit,
}

/// A boundary crossing reported by the OS
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeofenceEvent {
    pub region_id: String,
    pub transition: GeofenceTransition,
}

/// The monitored circular region
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    pub identifier: String,
    pub center: Coordinate,
    pub radius_m: f64,
    pub notify_on_enter: bool,
    pub notify_on_exit: bool,
    /// Fixes older than this are not trusted for reconciliation
    pub max_fix_age: ChronoDuration,
}

impl Region {
    pub fn from_config(config: &GeofenceConfig) -> Self {
        Region {
            identifier: config.identifier.clone(),
            center: Coordinate {
                latitude: config.latitude,
                longitude: config.longitude,
            },
            radius_m: config.radius_m,
            notify_on_enter: config.notify_on_enter,
            notify_on_exit: config.notify_on_exit,
            max_fix_age: ChronoDuration::seconds(config.max_fix_age_secs as i64),
        }
    }

    pub fn distance_m(&self, fix: &LocationFix) -> f64 {
        haversine_distance_m(
            self.center,
            Coordinate {
                latitude: fix.latitude,
                longitude: fix.longitude,
            },
        )
    }

    pub fn contains(&self, fix: &LocationFix) -> bool {
        self.distance_m(fix) <= self.radius_m
    }

    pub fn is_fresh(&self, fix: &LocationFix, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(fix.timestamp) <= self.max_fix_age
    }
}

/// Great-circle distance between two points in metres
pub fn haversine_distance_m(from: Coordinate, to: Coordinate) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_371_000.0;

    let lat1_rad = from.latitude.to_radians();
    let lat2_rad = to.latitude.to_radians();
    let delta_lat = (to.latitude - from.latitude).to_radians();
    let delta_lon = (to.longitude - from.longitude).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();

    EARTH_RADIUS_M * c
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region() -> Region {
        Region::from_config(&GeofenceConfig {
            identifier: "office".to_string(),
            latitude: 52.5200,
            longitude: 13.4050,
            radius_m: 150.0,
            ..GeofenceConfig::default()
        })
    }

    fn fix(latitude: f64, longitude: f64, age_secs: i64) -> LocationFix {
        LocationFix {
            latitude,
            longitude,
            accuracy_m: Some(10.0),
            timestamp: Utc::now() - ChronoDuration::seconds(age_secs),
        }
    }

    #[test]
    fn test_haversine_distance() {
        // New York to Los Angeles: ~3944 km
        let nyc = Coordinate { latitude: 40.7128, longitude: -74.0060 };
        let la = Coordinate { latitude: 34.0522, longitude: -118.2437 };
        let distance = haversine_distance_m(nyc, la);
        assert!((distance - 3_944_000.0).abs() < 50_000.0, "got {}", distance);
    }

    #[test]
    fn test_contains() {
        let region = region();
        assert!(region.contains(&fix(52.5200, 13.4050, 0)));
        // ~111 m north
        assert!(region.contains(&fix(52.5210, 13.4050, 0)));
        // ~1.1 km north
        assert!(!region.contains(&fix(52.5300, 13.4050, 0)));
    }

    #[test]
    fn test_fix_freshness() {
        let region = region();
        let now = Utc::now();
        assert!(region.is_fresh(&fix(52.52, 13.405, 60), now));
        assert!(!region.is_fresh(&fix(52.52, 13.405, 600), now));
    }

    #[test]
    fn test_event_wire_format() {
        let event: GeofenceEvent =
            serde_json::from_str(r#"{"region_id":"office","transition":"exit"}"#).unwrap();
        assert_eq!(event.transition, GeofenceTransition::Exit);
    }
}
