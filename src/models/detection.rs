use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::DeviceRef;

/// A single radio advertisement as delivered by the scan callback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Advertisement {
    pub device_id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub rssi: i16,
    #[serde(default)]
    pub service_uuids: Vec<String>,
}

/// An advertisement that passed the beacon filter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub device_id: String,
    pub device_name: Option<String>,
    pub rssi: i16,
    pub timestamp: DateTime<Utc>,
}

impl Detection {
    pub fn from_advertisement(adv: &Advertisement, timestamp: DateTime<Utc>) -> Self {
        Detection {
            device_id: adv.device_id.clone(),
            device_name: adv.name.clone(),
            rssi: adv.rssi,
            timestamp,
        }
    }

    pub fn device(&self) -> DeviceRef {
        DeviceRef {
            id: self.device_id.clone(),
            name: self.device_name.clone(),
        }
    }
}
