//! Platform event input for a daemon host
//!
//! Without a mobile OS underneath, the daemon learns about geofence
//! crossings, beacon advertisements, location fixes and foreground changes
//! from JSON lines, either tailed from a file or received as UDP datagrams.

pub mod file_tailer;
pub mod udp_listener;

pub use file_tailer::{AsyncFileTailer, EventFileReader};
pub use udp_listener::AsyncUdpListener;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::geofence::GeofenceEvent;
use crate::models::Advertisement;
use crate::platform::LocationFix;

#[derive(Error, Debug)]
pub enum InputError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid event on line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// One event from the host platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlatformEvent {
    Geofence(GeofenceEvent),
    Advertisement(Advertisement),
    Location(LocationFix),
    Foreground { foreground: bool },
    Radio { powered: bool },
}

/// Parse one line; blank lines and `#` comments yield `None`
pub fn parse_event(line: &str) -> Result<Option<PlatformEvent>, serde_json::Error> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }
    serde_json::from_str(trimmed).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geofence::GeofenceTransition;

    #[test]
    fn test_parse_geofence_event() {
        let event = parse_event(r#"{"type":"geofence","region_id":"office","transition":"enter"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            PlatformEvent::Geofence(GeofenceEvent {
                region_id: "office".to_string(),
                transition: GeofenceTransition::Enter,
            })
        );
    }

    #[test]
    fn test_parse_advertisement_defaults() {
        let event = parse_event(r#"{"type":"advertisement","device_id":"AA:BB","rssi":-61}"#)
            .unwrap()
            .unwrap();
        match event {
            PlatformEvent::Advertisement(adv) => {
                assert_eq!(adv.rssi, -61);
                assert!(adv.name.is_none());
                assert!(adv.service_uuids.is_empty());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_parse_location_and_flags() {
        let event = parse_event(
            r#"{"type":"location","latitude":52.52,"longitude":13.405,"timestamp":"2024-05-01T08:00:00Z"}"#,
        )
        .unwrap()
        .unwrap();
        assert!(matches!(event, PlatformEvent::Location(_)));

        let event = parse_event(r#"{"type":"foreground","foreground":false}"#)
            .unwrap()
            .unwrap();
        assert_eq!(event, PlatformEvent::Foreground { foreground: false });
    }

    #[test]
    fn test_skips_blank_and_comment_lines() {
        assert!(parse_event("   ").unwrap().is_none());
        assert!(parse_event("# morning commute").unwrap().is_none());
        assert!(parse_event("{\"type\":\"teleport\"}").is_err());
    }
}
