//! Attendance reporting
//!
//! Posts enter, exit and inside-area events to the attendance service.
//! A report is attempted exactly once; failures are logged and returned
//! to the caller, and the next state-machine trigger or periodic cycle is
//! what effectively retries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

use crate::config::AttendanceConfig;
use crate::models::DeviceRef;
use crate::persistence::{PersistenceError, PresenceStore};

/// Errors that can occur while reporting attendance
#[derive(Error, Debug)]
pub enum AttendanceError {
    #[error("No user identifier configured")]
    MissingUserId,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Attendance service returned status {0}")]
    Status(u16),

    #[error("Store error: {0}")]
    Store(#[from] PersistenceError),
}

/// Kind of attendance event, one endpoint each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceKind {
    Enter,
    Exit,
    InsideArea,
}

impl AttendanceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceKind::Enter => "enter",
            AttendanceKind::Exit => "exit",
            AttendanceKind::InsideArea => "inside_area",
        }
    }
}

/// An attendance event ready to be posted
#[derive(Debug, Clone, PartialEq)]
pub struct AttendanceEvent {
    pub kind: AttendanceKind,
    pub device: Option<DeviceRef>,
    pub at: DateTime<Utc>,
}

impl AttendanceEvent {
    pub fn enter(device: DeviceRef, at: DateTime<Utc>) -> Self {
        AttendanceEvent {
            kind: AttendanceKind::Enter,
            device: Some(device),
            at,
        }
    }

    pub fn exit(device: Option<DeviceRef>, at: DateTime<Utc>) -> Self {
        AttendanceEvent {
            kind: AttendanceKind::Exit,
            device,
            at,
        }
    }

    pub fn inside_area(at: DateTime<Utc>) -> Self {
        AttendanceEvent {
            kind: AttendanceKind::InsideArea,
            device: None,
            at,
        }
    }
}

#[derive(Debug, Serialize)]
struct AttendancePayload<'a> {
    user_id: &'a str,
    event: AttendanceKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_name: Option<&'a str>,
    timestamp: String,
}

/// Destination of attendance events
#[async_trait]
pub trait AttendanceSink: Send + Sync {
    async fn report(&self, event: &AttendanceEvent) -> Result<(), AttendanceError>;
}

/// HTTP attendance reporter
pub struct AttendanceReporter {
    config: AttendanceConfig,
    client: Client,
    store: Arc<dyn PresenceStore>,
}

impl AttendanceReporter {
    /// Create a reporter; the user identifier is read from the store on every report
    pub fn new(config: AttendanceConfig, store: Arc<dyn PresenceStore>) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        AttendanceReporter {
            config,
            client,
            store,
        }
    }

    fn endpoint(&self, kind: AttendanceKind) -> String {
        let path = match kind {
            AttendanceKind::Enter => &self.config.enter_path,
            AttendanceKind::Exit => &self.config.exit_path,
            AttendanceKind::InsideArea => &self.config.inside_area_path,
        };
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn post(&self, user_id: &str, event: &AttendanceEvent) -> Result<(), AttendanceError> {
        let payload = AttendancePayload {
            user_id,
            event: event.kind,
            device_id: event.device.as_ref().map(|d| d.id.as_str()),
            device_name: event.device.as_ref().and_then(|d| d.name.as_deref()),
            timestamp: event.at.to_rfc3339(),
        };

        let mut request = self.client.post(self.endpoint(event.kind));
        if let Some(ref headers) = self.config.headers {
            for (key, value) in headers {
                request = request.header(key, value);
            }
        }

        let response = request.json(&payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AttendanceError::Status(status.as_u16()));
        }
        Ok(())
    }
}

#[async_trait]
impl AttendanceSink for AttendanceReporter {
    async fn report(&self, event: &AttendanceEvent) -> Result<(), AttendanceError> {
        let user_id = match self.store.user_id()? {
            Some(id) => id,
            None => {
                log::info!(
                    "Skipping {} attendance report: no user identifier configured",
                    event.kind.as_str()
                );
                return Err(AttendanceError::MissingUserId);
            }
        };

        match self.post(&user_id, event).await {
            Ok(()) => {
                log::info!("Reported {} attendance for {}", event.kind.as_str(), user_id);
                Ok(())
            }
            Err(e) => {
                log::warn!("Failed to report {} attendance: {}", event.kind.as_str(), e);
                Err(e)
            }
        }
    }
}
