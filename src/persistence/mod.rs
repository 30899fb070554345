//! Persistence module for presence state storage
//!
//! The presence store is the single source of truth for the current
//! state and the session bookkeeping. Every entry point reloads from it
//! instead of trusting memory, since periodic wake-ups may run in a fresh
//! process after the original one was terminated.

pub mod sqlite_store;

pub use sqlite_store::SqlitePresenceStore;

use crate::models::{AppState, DeviceRef, PresenceRecord, StateChange};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors that can occur during persistence operations
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid data in store for key {key}: {reason}")]
    InvalidData { key: String, reason: String },

    #[error("Store lock poisoned")]
    LockPoisoned,
}

/// Keys of the persisted key-value entries
pub mod keys {
    pub const APP_STATE: &str = "presence.state";
    pub const LAST_SEEN_AT: &str = "presence.last_seen_at";
    pub const ENTER_SENT_AT: &str = "presence.enter_sent_at";
    pub const INSIDE_AREA_REPORTED: &str = "presence.inside_area_reported";
    pub const RAPID_RETRY_UNTIL: &str = "presence.rapid_retry_until";
    pub const LAST_SCAN_ATTEMPT_AT: &str = "presence.last_scan_attempt_at";
    pub const SCAN_FAILURE_STREAK: &str = "presence.scan_failure_streak";
    pub const LAST_DEVICE: &str = "presence.last_device";
    pub const USER_ID: &str = "user.id";
    pub const PROMPT_NOTIFICATIONS: &str = "prompt.notifications";
    pub const PROMPT_BATTERY: &str = "prompt.battery_optimization";

    /// Everything that belongs to one presence session
    pub const SESSION_RECORD: &[&str] = &[
        LAST_SEEN_AT,
        ENTER_SENT_AT,
        INSIDE_AREA_REPORTED,
        RAPID_RETRY_UNTIL,
        LAST_SCAN_ATTEMPT_AT,
        SCAN_FAILURE_STREAK,
        LAST_DEVICE,
    ];
}

/// One-time OS prompts whose "already shown" flag is persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    Notifications,
    BatteryOptimization,
}

impl PromptKind {
    fn key(&self) -> &'static str {
        match self {
            PromptKind::Notifications => keys::PROMPT_NOTIFICATIONS,
            PromptKind::BatteryOptimization => keys::PROMPT_BATTERY,
        }
    }
}

/// Trait for presence persistence backends
///
/// Backends only provide per-key atomic reads and writes plus the
/// transition history; there are no cross-key transactions. The typed
/// accessors are built on top of the raw key-value operations.
pub trait PresenceStore: Send + Sync {
    // =====================
    // Raw key-value access
    // =====================

    /// Read a raw value
    fn get_value(&self, key: &str) -> Result<Option<String>, PersistenceError>;

    /// Write a raw value, replacing any previous one
    fn set_value(&self, key: &str, value: &str) -> Result<(), PersistenceError>;

    /// Remove a value; removing a missing key is not an error
    fn remove_value(&self, key: &str) -> Result<(), PersistenceError>;

    // =====================
    // Transition history
    // =====================

    /// Append a committed transition to the history
    fn append_transition(&self, change: &StateChange) -> Result<(), PersistenceError>;

    /// Most recent transitions, newest first
    fn recent_transitions(&self, limit: usize) -> Result<Vec<StateChange>, PersistenceError>;

    /// Remove history entries older than `before`
    fn prune_transitions(&self, before: DateTime<Utc>) -> Result<usize, PersistenceError>;

    /// Clear all data (useful for testing and `presence_cli reset`)
    fn clear_all(&self) -> Result<(), PersistenceError>;

    // =====================
    // Typed accessors
    // =====================

    /// Current presence state; a missing entry reads as `Outside`
    fn app_state(&self) -> Result<AppState, PersistenceError> {
        match self.get_value(keys::APP_STATE)? {
            None => Ok(AppState::Outside),
            Some(raw) => raw.parse().map_err(|reason| PersistenceError::InvalidData {
                key: keys::APP_STATE.to_string(),
                reason,
            }),
        }
    }

    fn set_app_state(&self, state: AppState) -> Result<(), PersistenceError> {
        self.set_value(keys::APP_STATE, state.as_str())
    }

    fn timestamp(&self, key: &str) -> Result<Option<DateTime<Utc>>, PersistenceError> {
        match self.get_value(key)? {
            None => Ok(None),
            Some(raw) => DateTime::parse_from_rfc3339(&raw)
                .map(|dt| Some(dt.with_timezone(&Utc)))
                .map_err(|e| PersistenceError::InvalidData {
                    key: key.to_string(),
                    reason: e.to_string(),
                }),
        }
    }

    fn set_timestamp(
        &self,
        key: &str,
        value: Option<DateTime<Utc>>,
    ) -> Result<(), PersistenceError> {
        match value {
            Some(ts) => self.set_value(key, &ts.to_rfc3339()),
            None => self.remove_value(key),
        }
    }

    fn flag(&self, key: &str) -> Result<bool, PersistenceError> {
        Ok(self.get_value(key)?.as_deref() == Some("true"))
    }

    fn set_flag(&self, key: &str, value: bool) -> Result<(), PersistenceError> {
        if value {
            self.set_value(key, "true")
        } else {
            self.remove_value(key)
        }
    }

    fn scan_failure_streak(&self) -> Result<u32, PersistenceError> {
        match self.get_value(keys::SCAN_FAILURE_STREAK)? {
            None => Ok(0),
            Some(raw) => raw.parse().map_err(|_| PersistenceError::InvalidData {
                key: keys::SCAN_FAILURE_STREAK.to_string(),
                reason: format!("not a counter: {}", raw),
            }),
        }
    }

    fn set_scan_failure_streak(&self, streak: u32) -> Result<(), PersistenceError> {
        if streak == 0 {
            self.remove_value(keys::SCAN_FAILURE_STREAK)
        } else {
            self.set_value(keys::SCAN_FAILURE_STREAK, &streak.to_string())
        }
    }

    fn last_device(&self) -> Result<Option<DeviceRef>, PersistenceError> {
        match self.get_value(keys::LAST_DEVICE)? {
            None => Ok(None),
            Some(raw) => serde_json::from_str(&raw).map(Some).map_err(|e| {
                PersistenceError::InvalidData {
                    key: keys::LAST_DEVICE.to_string(),
                    reason: e.to_string(),
                }
            }),
        }
    }

    fn set_last_device(&self, device: Option<&DeviceRef>) -> Result<(), PersistenceError> {
        match device {
            Some(device) => {
                let raw = serde_json::to_string(device).map_err(|e| {
                    PersistenceError::InvalidData {
                        key: keys::LAST_DEVICE.to_string(),
                        reason: e.to_string(),
                    }
                })?;
                self.set_value(keys::LAST_DEVICE, &raw)
            }
            None => self.remove_value(keys::LAST_DEVICE),
        }
    }

    /// Load the whole session record
    fn record(&self) -> Result<PresenceRecord, PersistenceError> {
        Ok(PresenceRecord {
            last_seen_at: self.timestamp(keys::LAST_SEEN_AT)?,
            enter_sent_at: self.timestamp(keys::ENTER_SENT_AT)?,
            inside_area_reported: self.flag(keys::INSIDE_AREA_REPORTED)?,
            rapid_retry_until: self.timestamp(keys::RAPID_RETRY_UNTIL)?,
            last_scan_attempt_at: self.timestamp(keys::LAST_SCAN_ATTEMPT_AT)?,
            scan_failure_streak: self.scan_failure_streak()?,
            last_device: self.last_device()?,
        })
    }

    /// Drop all session bookkeeping; the state itself is left alone
    fn clear_session_record(&self) -> Result<(), PersistenceError> {
        for key in keys::SESSION_RECORD {
            self.remove_value(key)?;
        }
        Ok(())
    }

    fn user_id(&self) -> Result<Option<String>, PersistenceError> {
        Ok(self
            .get_value(keys::USER_ID)?
            .filter(|id| !id.trim().is_empty()))
    }

    fn set_user_id(&self, user_id: Option<&str>) -> Result<(), PersistenceError> {
        match user_id {
            Some(id) => self.set_value(keys::USER_ID, id),
            None => self.remove_value(keys::USER_ID),
        }
    }

    fn prompt_shown(&self, prompt: PromptKind) -> Result<bool, PersistenceError> {
        self.flag(prompt.key())
    }

    fn mark_prompt_shown(&self, prompt: PromptKind) -> Result<(), PersistenceError> {
        self.set_flag(prompt.key(), true)
    }
}
