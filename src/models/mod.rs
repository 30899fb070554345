pub mod detection;
pub mod state;

pub use detection::{Advertisement, Detection};
pub use state::{AppState, DeviceRef, PresenceRecord, StateChange, TransitionCause};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_string_roundtrip() {
        for state in [
            AppState::Outside,
            AppState::InsideArea,
            AppState::Present,
            AppState::Unconfirmed,
        ] {
            assert_eq!(state.as_str().parse::<AppState>().unwrap(), state);
        }
        assert!("NOWHERE".parse::<AppState>().is_err());
    }

    #[test]
    fn test_present_family() {
        assert!(AppState::Present.is_present_family());
        assert!(AppState::Unconfirmed.is_present_family());
        assert!(!AppState::InsideArea.is_present_family());
        assert!(!AppState::Outside.is_in_area());
        assert_eq!(AppState::default(), AppState::Outside);
    }

    #[test]
    fn test_advertisement_json_defaults() {
        let adv: Advertisement =
            serde_json::from_str(r#"{"device_id":"AA:BB","rssi":-60}"#).unwrap();
        assert_eq!(adv.name, None);
        assert!(adv.service_uuids.is_empty());
    }
}
